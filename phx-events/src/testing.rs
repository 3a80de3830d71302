//! Test utilities: an in-memory transport.
//!
//! [`mock_transport`] returns a [`MockConnector`] to hand to the client and a
//! [`MockServer`] that plays the Phoenix server side of every connection the
//! client opens, including reconnects.
//!
//! # Example
//!
//! ```ignore
//! use phx_events::testing::mock_transport;
//! use phx_events::{ClientConfig, PhxChannelsClient};
//! use serde_json::json;
//!
//! let (connector, mut server) = mock_transport();
//! let url = url::Url::parse("ws://mock/socket/websocket")?;
//! let client = PhxChannelsClient::connect_with(url, connector, ClientConfig::default()).await?;
//! let mut conn = server.accept().await;
//!
//! client.join("room:lobby", json!({})).await?;
//! let join = conn.expect_event("phx_join").await;
//! conn.reply(&join, "ok", json!({}));
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as wire;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use crate::error::PhxError;
use crate::message::{events, Frame};
use crate::serializer;
use crate::transport::{Connection, Connector};

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// Client half of the in-memory transport
#[derive(Clone)]
pub struct MockConnector {
    accepted: mpsc::UnboundedSender<ServerConnection>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

/// Server half of the in-memory transport
pub struct MockServer {
    accepted: mpsc::UnboundedReceiver<ServerConnection>,
    refuse: Arc<AtomicBool>,
    attempts: Arc<AtomicUsize>,
}

pub fn mock_transport() -> (MockConnector, MockServer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let refuse = Arc::new(AtomicBool::new(false));
    let attempts = Arc::new(AtomicUsize::new(0));
    (
        MockConnector {
            accepted: tx,
            refuse: Arc::clone(&refuse),
            attempts: Arc::clone(&attempts),
        },
        MockServer {
            accepted: rx,
            refuse,
            attempts,
        },
    )
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &Url) -> Result<Connection, PhxError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(PhxError::Transport("connection refused".to_string()));
        }

        let (to_client, client_rx) = wire::unbounded();
        let (client_tx, from_client) = wire::unbounded::<String>();
        self.accepted
            .send(ServerConnection {
                to_client,
                from_client,
            })
            .map_err(|_| PhxError::Transport("mock server dropped".to_string()))?;

        let sink = client_tx.sink_map_err(|e| PhxError::Transport(e.to_string()));
        Ok(Connection::new(Box::pin(sink), Box::pin(client_rx)))
    }
}

impl MockServer {
    /// Wait for the client's next connection.
    pub async fn accept(&mut self) -> ServerConnection {
        tokio::time::timeout(RECV_TIMEOUT, self.accepted.recv())
            .await
            .expect("Timeout waiting for a connection")
            .expect("Connector dropped")
    }

    /// Make subsequent connection attempts fail
    pub fn refuse_connections(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Connection attempts so far, refused ones included
    pub fn connect_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// Server side of one in-memory connection. Dropping it closes the
/// connection.
pub struct ServerConnection {
    to_client: wire::UnboundedSender<Result<String, PhxError>>,
    from_client: wire::UnboundedReceiver<String>,
}

impl ServerConnection {
    /// Next frame from the client, or `None` on timeout or close
    pub async fn recv(&mut self) -> Option<Frame> {
        self.recv_timeout(RECV_TIMEOUT).await
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Frame> {
        match tokio::time::timeout(timeout, self.from_client.next()).await {
            Ok(Some(text)) => {
                Some(serializer::decode(&text).expect("Client sent a malformed frame"))
            }
            _ => None,
        }
    }

    /// Next frame that is not a heartbeat; panics if its event differs
    pub async fn expect_event(&mut self, event: &str) -> Frame {
        loop {
            let frame = self
                .recv()
                .await
                .unwrap_or_else(|| panic!("Timeout waiting for {event}"));
            if frame.topic == events::PHOENIX_TOPIC && frame.event == events::HEARTBEAT {
                continue;
            }
            assert_eq!(frame.event, event, "unexpected frame: {frame:?}");
            return frame;
        }
    }

    pub fn send(&self, frame: Frame) {
        let text = serializer::encode(&frame).expect("Failed to encode frame");
        self.send_text(&text);
    }

    /// Send raw text, malformed or not
    pub fn send_text(&self, text: &str) {
        self.to_client
            .unbounded_send(Ok(text.to_string()))
            .expect("Client side of the connection is gone");
    }

    /// Reply to `request` with `{"status": status, "response": response}`
    pub fn reply(&self, request: &Frame, status: &str, response: Value) {
        self.send(Frame::reply(request, status, response));
    }

    /// Surface a transport error on the client's stream
    pub fn fail(&self, error: PhxError) {
        let _ = self.to_client.unbounded_send(Err(error));
    }

    pub fn disconnect(self) {
        drop(self);
    }
}
