//! Client facade: connection, handler registration and channel operations.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::channel::{ChannelState, ChannelTable};
use crate::config::ClientConfig;
use crate::error::PhxError;
use crate::message::{ChannelEvent, Frame, Ref, Reply, Topic};
use crate::reference::RefAllocator;
use crate::registry::{EventHandler, EventRegistry, RegistrationHandle, TopicPattern};
use crate::reply::PendingReplies;
use crate::router::EventRouter;
use crate::serializer;
use crate::socket::{endpoint, ClosedSignal, ConnectionStatus, Driver, Outbound, ShutdownReason};
use crate::transport::{socket_url, Connector, WebSocketConnector};

/// A Phoenix Channels client.
///
/// Inbound envelopes are dispatched to handlers by event category, each
/// category on its own worker task, in wire order. Channel lifecycle state is
/// tracked per topic and topics are rejoined after a reconnect.
pub struct PhxChannelsClient {
    registry: Arc<EventRegistry>,
    channels: Arc<ChannelTable>,
    pending: Arc<PendingReplies>,
    refs: Arc<RefAllocator>,
    outbound: mpsc::UnboundedSender<Outbound>,
    status: watch::Receiver<ConnectionStatus>,
    closed: Arc<ClosedSignal>,
    cancel: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl PhxChannelsClient {
    /// Connect over websocket to `url`, passing `token` as a query parameter.
    pub async fn connect(
        url: &str,
        token: Option<&str>,
        config: ClientConfig,
    ) -> Result<Self, PhxError> {
        let url = socket_url(url, token)?;
        Self::connect_with(url, WebSocketConnector, config).await
    }

    /// Connect through a custom [`Connector`].
    ///
    /// The first connection attempt is not retried; its error is returned.
    pub async fn connect_with<C: Connector>(
        url: Url,
        connector: C,
        config: ClientConfig,
    ) -> Result<Self, PhxError> {
        config.validate()?;

        let endpoint = endpoint(&url);
        let connector: Arc<dyn Connector> = Arc::new(connector);
        let conn = connector.connect(&url).await?;
        info!(endpoint = %endpoint, "Connected");

        let cancel = CancellationToken::new();
        let registry = Arc::new(EventRegistry::new(config.queue.clone(), cancel.clone()));
        let channels = Arc::new(ChannelTable::new());
        let pending = Arc::new(PendingReplies::new());
        let refs = Arc::new(RefAllocator::new());
        let closed = Arc::new(ClosedSignal::new());
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::Connected);

        let driver = Driver {
            url,
            endpoint,
            connector,
            config,
            router: EventRouter::new(
                Arc::clone(&registry),
                Arc::clone(&channels),
                Arc::clone(&pending),
            ),
            registry: Arc::clone(&registry),
            channels: Arc::clone(&channels),
            pending: Arc::clone(&pending),
            refs: Arc::clone(&refs),
            outbound: outbound_rx,
            status: status_tx,
            closed: Arc::clone(&closed),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(driver.run(conn));

        Ok(Self {
            registry,
            channels,
            pending,
            refs,
            outbound: outbound_tx,
            status: status_rx,
            closed,
            cancel,
            driver: Mutex::new(Some(task)),
        })
    }

    /// Register a handler for an event category. Lifecycle events are
    /// registered by their wire names (`"phx_reply"`, `"phx_error"`, ...).
    pub fn register<H: EventHandler>(
        &self,
        event: impl Into<ChannelEvent>,
        handler: H,
        filter: Option<TopicPattern>,
    ) -> RegistrationHandle {
        self.registry.register(event, handler, filter)
    }

    pub fn unregister(&self, handle: &RegistrationHandle) -> bool {
        self.registry.unregister(handle)
    }

    /// Send `phx_join` for `topic`. Returns the join ref; the channel is
    /// `Joined` once the server replies ok.
    pub async fn join(&self, topic: impl Into<Topic>, payload: Value) -> Result<Ref, PhxError> {
        let topic = topic.into();
        let join_ref = self.refs.next_ref();
        let frame = self.channels.begin_join(&topic, join_ref.clone(), payload)?;
        debug!(topic = %topic, join_ref = %join_ref, "Joining channel");

        if let Err(e) = self.send(&frame).await {
            self.channels.abort_join(&topic, &join_ref);
            return Err(e);
        }
        Ok(join_ref)
    }

    /// Re-send `phx_join` with the original payload for an `Errored` or
    /// `Left` topic.
    pub async fn rejoin(&self, topic: impl Into<Topic>) -> Result<Ref, PhxError> {
        let topic = topic.into();
        let join_ref = self.refs.next_ref();
        let frame = self.channels.rejoin(&topic, join_ref.clone())?;
        debug!(topic = %topic, join_ref = %join_ref, "Rejoining channel");

        if let Err(e) = self.send(&frame).await {
            self.channels.abort_join(&topic, &join_ref);
            return Err(e);
        }
        Ok(join_ref)
    }

    /// Send `phx_leave` for a joined topic
    pub async fn leave(&self, topic: impl Into<Topic>) -> Result<Ref, PhxError> {
        let topic = topic.into();
        let leave_ref = self.refs.next_ref();
        let frame = self.channels.begin_leave(&topic, leave_ref.clone())?;
        debug!(topic = %topic, ref_ = %leave_ref, "Leaving channel");

        self.send(&frame).await?;
        Ok(leave_ref)
    }

    /// Push an application event. The reply, if the server sends one, is
    /// delivered to `phx_reply` handlers.
    pub async fn push(
        &self,
        topic: impl Into<Topic>,
        event: &str,
        payload: Value,
    ) -> Result<Ref, PhxError> {
        let topic = topic.into();
        let ref_ = self.refs.next_ref();
        let frame = self.channels.push_frame(&topic, event, payload, &ref_)?;

        self.send(&frame).await?;
        Ok(ref_)
    }

    /// Push an application event and wait for its reply
    pub async fn call(
        &self,
        topic: impl Into<Topic>,
        event: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Reply, PhxError> {
        let topic = topic.into();
        let ref_ = self.refs.next_ref();
        let frame = self.channels.push_frame(&topic, event, payload, &ref_)?;

        let waiter = self.pending.register(ref_.clone());
        if let Err(e) = self.send(&frame).await {
            self.pending.cancel(&ref_);
            return Err(e);
        }

        match tokio::time::timeout(timeout, waiter).await {
            Ok(Ok(msg)) => msg.reply().ok_or_else(|| {
                PhxError::MalformedEnvelope(format!("expected phx_reply for ref {ref_}"))
            }),
            Ok(Err(_)) => Err(PhxError::ConnectionClosed),
            Err(_) => {
                self.pending.cancel(&ref_);
                Err(PhxError::ReplyTimeout(ref_.to_string()))
            }
        }
    }

    pub fn channel_state(&self, topic: &str) -> Option<ChannelState> {
        self.channels.state(topic)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Close the connection and stop every dispatch worker.
    ///
    /// Handler calls already running complete first, so this must not be
    /// awaited from inside a handler.
    pub async fn shutdown(&self, reason: impl Into<String>) {
        let reason = ShutdownReason::Requested(reason.into());
        info!(reason = %reason, "Shutting down client");

        self.cancel.cancel();
        let task = self.driver.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.registry.shutdown().await;
        self.pending.fail_all();
        self.closed.publish(reason);
    }

    /// Resolves once the client has stopped, with the first reason recorded
    pub async fn wait_closed(&self) -> ShutdownReason {
        self.closed.wait().await
    }

    pub fn closed_reason(&self) -> Option<ShutdownReason> {
        self.closed.get()
    }

    async fn send(&self, frame: &Frame) -> Result<(), PhxError> {
        let text = serializer::encode(frame)?;
        match self.status() {
            ConnectionStatus::Connected => {}
            ConnectionStatus::Reconnecting => return Err(PhxError::NotConnected),
            ConnectionStatus::Closed => return Err(PhxError::ConnectionClosed),
        }

        let (ack, done) = oneshot::channel();
        self.outbound
            .send(Outbound { text, ack })
            .map_err(|_| PhxError::ConnectionClosed)?;
        done.await.map_err(|_| PhxError::ConnectionClosed)?
    }
}

impl Drop for PhxChannelsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for PhxChannelsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhxChannelsClient")
            .field("status", &self.status())
            .field("registry", &self.registry)
            .field("pending_replies", &self.pending.len())
            .finish()
    }
}
