use thiserror::Error;

#[derive(Error, Debug)]
pub enum PhxError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Not connected")]
    NotConnected,

    #[error("Already joined: {0}")]
    AlreadyJoined(String),

    #[error("Not joined: {0}")]
    NotJoined(String),

    #[error("Timed out waiting for reply to ref {0}")]
    ReplyTimeout(String),

    #[error("Invalid socket url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for PhxError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        PhxError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PhxError::MalformedEnvelope("missing topic".to_string());
        assert_eq!(err.to_string(), "Malformed envelope: missing topic");
    }

    #[test]
    fn test_not_joined() {
        let err = PhxError::NotJoined("room:unknown".to_string());
        assert_eq!(err.to_string(), "Not joined: room:unknown");
    }

    #[test]
    fn test_reply_timeout() {
        let err = PhxError::ReplyTimeout("7".to_string());
        assert_eq!(err.to_string(), "Timed out waiting for reply to ref 7");
    }
}
