//! Connection driver.
//!
//! One task owns the live connection. It writes outbound frames, feeds inbound
//! frames to the router, keeps the heartbeat and reconnects with backoff when
//! the transport is lost. Dispatch workers are not touched by reconnects.
//!
//! Reading the socket never waits on a dispatch worker: envelopes held back by
//! a full blocking queue are moved on from a separate branch of the loop.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::channel::ChannelTable;
use crate::config::ClientConfig;
use crate::error::PhxError;
use crate::message::{Frame, Ref};
use crate::reference::RefAllocator;
use crate::registry::EventRegistry;
use crate::reply::PendingReplies;
use crate::router::{EventRouter, Routed};
use crate::serializer;
use crate::transport::{Connection, Connector};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the client stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `shutdown` was called
    Requested(String),
    /// The transport failed and could not be re-established
    TransportFailure(String),
}

impl std::fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownReason::Requested(reason) => write!(f, "shutdown requested: {reason}"),
            ShutdownReason::TransportFailure(reason) => write!(f, "transport failure: {reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connected,
    Reconnecting,
    Closed,
}

/// A text frame on its way to the wire, acknowledged once written
pub(crate) struct Outbound {
    pub text: String,
    pub ack: oneshot::Sender<Result<(), PhxError>>,
}

/// Set once with the first shutdown reason; later reasons are ignored
#[derive(Debug)]
pub(crate) struct ClosedSignal {
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl ClosedSignal {
    pub fn new() -> Self {
        let (reason, _) = watch::channel(None);
        Self { reason }
    }

    pub fn publish(&self, reason: ShutdownReason) -> bool {
        self.reason.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        })
    }

    pub fn get(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    pub async fn wait(&self) -> ShutdownReason {
        let mut rx = self.reason.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            // The sender lives in `self`, so this only fails if it is dropped
            if rx.changed().await.is_err() {
                return ShutdownReason::Requested("client dropped".to_string());
            }
        }
    }
}

enum Served {
    Cancelled,
    Lost(PhxError),
}

enum Reconnect {
    Connected(Connection),
    Cancelled,
    GaveUp(String),
}

pub(crate) struct Driver {
    pub url: Url,
    /// `url` without its query string, which may carry the auth token
    pub endpoint: String,
    pub connector: Arc<dyn Connector>,
    pub config: ClientConfig,
    pub router: EventRouter,
    pub registry: Arc<EventRegistry>,
    pub channels: Arc<ChannelTable>,
    pub pending: Arc<PendingReplies>,
    pub refs: Arc<RefAllocator>,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
    pub status: watch::Sender<ConnectionStatus>,
    pub closed: Arc<ClosedSignal>,
    pub cancel: CancellationToken,
}

impl Driver {
    /// Drive `conn` and its successors until shutdown or a terminal
    /// transport failure.
    pub async fn run(mut self, mut conn: Connection) {
        let reason = loop {
            let error = match self.serve(&mut conn).await {
                Served::Cancelled => {
                    close(&mut conn).await;
                    self.status.send_replace(ConnectionStatus::Closed);
                    debug!(endpoint = %self.endpoint, "Connection driver stopped");
                    return;
                }
                Served::Lost(error) => error,
            };

            warn!(endpoint = %self.endpoint, error = %error, "Connection lost");
            self.status.send_replace(ConnectionStatus::Reconnecting);
            for transition in self.channels.on_disconnect() {
                info!(
                    topic = %transition.topic,
                    from = %transition.from,
                    to = %transition.to,
                    "Channel state changed"
                );
            }
            self.pending.fail_all();

            match self.reconnect(&error).await {
                Reconnect::Connected(next) => conn = next,
                Reconnect::Cancelled => {
                    self.status.send_replace(ConnectionStatus::Closed);
                    return;
                }
                Reconnect::GaveUp(last_error) => {
                    break ShutdownReason::TransportFailure(last_error);
                }
            }
        };

        warn!(endpoint = %self.endpoint, reason = %reason, "Giving up on connection");
        self.status.send_replace(ConnectionStatus::Closed);
        self.drain_outbound();
        self.registry.shutdown().await;
        self.closed.publish(reason);
    }

    async fn serve(&mut self, conn: &mut Connection) -> Served {
        for frame in self.channels.rejoin_flagged(&self.refs) {
            info!(topic = %frame.topic, join_ref = ?frame.join_ref, "Rejoining channel");
            if let Err(e) = send_frame(conn, &frame).await {
                return Served::Lost(e);
            }
        }
        self.status.send_replace(ConnectionStatus::Connected);

        let mut heartbeat = self.config.heartbeat_interval().map(|period| {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut awaiting: Option<Ref> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => return Served::Cancelled,

                Some(out) = self.outbound.recv() => {
                    let result = conn.sink.send(out.text).await;
                    let failed = result.as_ref().err().map(|e| e.to_string());
                    let _ = out.ack.send(result);
                    if let Some(e) = failed {
                        return Served::Lost(PhxError::Transport(e));
                    }
                }

                Some(routed) = self.router.deliver_held(), if self.router.has_held() => {
                    trace!(routed = ?routed, backlog = self.router.held_len(), "Delivered held envelope");
                }

                inbound = conn.stream.next() => match inbound {
                    Some(Ok(text)) => {
                        if let Routed::Heartbeat(ref_) = self.router.route_text(&text) {
                            if ref_.is_some() && ref_ == awaiting {
                                trace!(ref_ = ?ref_, "Heartbeat acknowledged");
                                awaiting = None;
                            }
                        }
                    }
                    Some(Err(e)) => return Served::Lost(e),
                    None => return Served::Lost(PhxError::ConnectionClosed),
                },

                _ = tick(&mut heartbeat) => {
                    if let Some(ref_) = awaiting.take() {
                        warn!(ref_ = %ref_, "Heartbeat not answered, closing connection");
                        close(conn).await;
                        return Served::Lost(PhxError::Transport("heartbeat timeout".to_string()));
                    }
                    let ref_ = self.refs.next_ref();
                    if let Err(e) = send_frame(conn, &Frame::heartbeat(&ref_)).await {
                        return Served::Lost(e);
                    }
                    awaiting = Some(ref_);
                }
            }
        }
    }

    async fn reconnect(&mut self, cause: &PhxError) -> Reconnect {
        let policy = self.config.reconnect.clone();
        let mut last_error = cause.to_string();
        let mut attempt: u32 = 1;

        while policy.allows(attempt) {
            let delay = policy.delay_for(attempt);
            info!(
                endpoint = %self.endpoint,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );
            if self.while_disconnected(tokio::time::sleep(delay)).await.is_none() {
                return Reconnect::Cancelled;
            }

            let connector = Arc::clone(&self.connector);
            let url = self.url.clone();
            let connecting = async move { connector.connect(&url).await };
            match self.while_disconnected(connecting).await {
                None => return Reconnect::Cancelled,
                Some(Ok(conn)) => {
                    info!(endpoint = %self.endpoint, attempt, "Reconnected");
                    return Reconnect::Connected(conn);
                }
                Some(Err(e)) => {
                    warn!(endpoint = %self.endpoint, attempt, error = %e, "Reconnect attempt failed");
                    last_error = e.to_string();
                }
            }
            attempt = attempt.saturating_add(1);
        }

        Reconnect::GaveUp(last_error)
    }

    /// Run `fut` while refusing outbound frames and delivering held
    /// envelopes. `None` on cancellation.
    async fn while_disconnected<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                Some(out) = self.outbound.recv() => {
                    let _ = out.ack.send(Err(PhxError::NotConnected));
                }
                Some(_) = self.router.deliver_held(), if self.router.has_held() => {}
                output = &mut fut => return Some(output),
            }
        }
    }

    fn drain_outbound(&mut self) {
        self.outbound.close();
        while let Ok(out) = self.outbound.try_recv() {
            let _ = out.ack.send(Err(PhxError::ConnectionClosed));
        }
    }
}

/// Loggable form of a socket URL
pub(crate) fn endpoint(url: &Url) -> String {
    let mut endpoint = url.clone();
    endpoint.set_query(None);
    endpoint.to_string()
}

async fn send_frame(conn: &mut Connection, frame: &Frame) -> Result<(), PhxError> {
    let text = serializer::encode(frame)?;
    conn.sink.send(text).await
}

async fn close(conn: &mut Connection) {
    if tokio::time::timeout(CLOSE_TIMEOUT, conn.sink.close()).await.is_err() {
        debug!("Timed out closing connection");
    }
}

async fn tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
