//! Transport adapter: how frames get on and off the wire.
//!
//! The client only sees text frames through [`Connection`]. The stream ending
//! or yielding an error is the terminal "connection lost" signal.

use std::pin::Pin;

use async_trait::async_trait;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::error::PhxError;

/// Protocol version requested from the server; frames are V2 arrays
pub const SERIALIZER_VSN: &str = "2.0.0";

pub type FrameSink = Pin<Box<dyn Sink<String, Error = PhxError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, PhxError>> + Send>>;

/// One live connection
pub struct Connection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl Connection {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens connections to a Phoenix socket endpoint
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<Connection, PhxError>;
}

/// Connector backed by tokio-tungstenite
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Connection, PhxError> {
        let (ws_stream, response) = connect_async(url.as_str()).await?;
        debug!(url = %url, status = %response.status(), "WebSocket connected");

        let (write, read) = ws_stream.split();

        let sink = write.with(|text: String| async move {
            Ok::<_, PhxError>(Message::Text(text.into()))
        });

        let stream = read.filter_map(|item| async move {
            match item {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => {
                    warn!(len = data.len(), "Ignoring binary frame");
                    None
                }
                Ok(Message::Close(frame)) => {
                    debug!(?frame, "Server closed the connection");
                    None
                }
                Ok(_) => None,
                Err(e) => Some(Err(PhxError::from(e))),
            }
        });

        Ok(Connection::new(Box::pin(sink), Box::pin(stream)))
    }
}

/// Build the socket URL: requests the V2 serializer and appends the auth
/// token, form-urlencoded, when one is given.
pub fn socket_url(base: &str, token: Option<&str>) -> Result<Url, PhxError> {
    let mut url = Url::parse(base)?;

    let has_vsn = url.query_pairs().any(|(key, _)| key == "vsn");
    if !has_vsn || token.is_some() {
        let mut pairs = url.query_pairs_mut();
        if !has_vsn {
            pairs.append_pair("vsn", SERIALIZER_VSN);
        }
        if let Some(token) = token {
            pairs.append_pair("token", token);
        }
    }

    Ok(url)
}
