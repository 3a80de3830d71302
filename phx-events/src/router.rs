use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::channel::ChannelTable;
use crate::message::{events, ChannelEvent, ChannelMessage, PhxEvent, Ref, Topic};
use crate::queue::{Enqueued, Envelope};
use crate::registry::EventRegistry;
use crate::reply::PendingReplies;
use crate::serializer;

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Routed {
    Queued,
    /// The category queue is full under the blocking policy. The envelope
    /// waits in the router until [`EventRouter::deliver_held`] moves it.
    Held,
    /// Server answer to a heartbeat; consumed by the connection driver
    Heartbeat(Option<Ref>),
    /// No handler registered for the event
    Unregistered,
    /// Full queue under a dropping overflow policy
    Overflowed,
    /// Could not be decoded
    Malformed,
    /// The category's worker has already stopped
    Closed,
}

/// Classifies inbound envelopes and feeds the per-event queues.
///
/// Routing never waits. Envelopes that do not fit a full blocking queue are
/// held in arrival order, and later envelopes line up behind them.
pub(crate) struct EventRouter {
    registry: Arc<EventRegistry>,
    channels: Arc<ChannelTable>,
    pending: Arc<PendingReplies>,
    held: Mutex<VecDeque<Envelope>>,
}

impl EventRouter {
    pub fn new(
        registry: Arc<EventRegistry>,
        channels: Arc<ChannelTable>,
        pending: Arc<PendingReplies>,
    ) -> Self {
        Self {
            registry,
            channels,
            pending,
            held: Mutex::new(VecDeque::new()),
        }
    }

    /// Decode a text frame and route it. Malformed frames are logged and dropped.
    pub fn route_text(&self, data: &str) -> Routed {
        match serializer::decode_message(data) {
            Ok(msg) => self.route(msg),
            Err(e) => {
                warn!(error = %e, frame = %data, "Dropping malformed frame");
                Routed::Malformed
            }
        }
    }

    /// Route one envelope.
    ///
    /// Lifecycle state and reply waiters are updated before the envelope is
    /// queued, so handlers observe the post-transition state.
    pub fn route(&self, msg: ChannelMessage) -> Routed {
        if msg.topic().as_str() == events::PHOENIX_TOPIC
            && *msg.event() == ChannelEvent::Lifecycle(PhxEvent::Reply)
        {
            return Routed::Heartbeat(msg.ref_().cloned());
        }

        if let Some(transition) = self.channels.observe(&msg) {
            info!(
                topic = %transition.topic,
                from = %transition.from,
                to = %transition.to,
                "Channel state changed"
            );
        }

        if self.pending.complete(&msg) {
            trace!(topic = %msg.topic(), "Completed reply waiter");
        }

        let envelope = Arc::new(msg);
        let mut held = self.held.lock();
        if !held.is_empty() {
            if !self.registry.is_registered(envelope.event()) {
                return unregistered(envelope.topic(), envelope.event());
            }
            held.push_back(envelope);
            return Routed::Held;
        }

        match self.registry.try_enqueue(Arc::clone(&envelope)) {
            Some(Err(envelope)) => {
                debug!(
                    topic = %envelope.topic(),
                    event = %envelope.event(),
                    "Event queue full, holding envelope"
                );
                held.push_back(envelope);
                Routed::Held
            }
            Some(Ok(outcome)) => report(envelope.topic(), envelope.event(), Some(outcome)),
            None => report(envelope.topic(), envelope.event(), None),
        }
    }

    pub fn has_held(&self) -> bool {
        !self.held.lock().is_empty()
    }

    pub fn held_len(&self) -> usize {
        self.held.lock().len()
    }

    /// Wait for room and enqueue the oldest held envelope.
    ///
    /// Cancel safe: the envelope leaves the backlog only once it is queued.
    pub async fn deliver_held(&self) -> Option<Routed> {
        let envelope = self.held.lock().front().cloned()?;
        let outcome = self.registry.enqueue(Arc::clone(&envelope)).await;
        self.held.lock().pop_front();
        Some(report(envelope.topic(), envelope.event(), outcome))
    }
}

fn unregistered(topic: &Topic, event: &ChannelEvent) -> Routed {
    trace!(topic = %topic, event = %event, "No handlers registered, dropping");
    Routed::Unregistered
}

fn report(topic: &Topic, event: &ChannelEvent, outcome: Option<Enqueued>) -> Routed {
    match outcome {
        None => unregistered(topic, event),
        Some(Enqueued::Queued) => Routed::Queued,
        Some(Enqueued::Dropped) => {
            warn!(topic = %topic, event = %event, "Event queue full, dropped envelope");
            Routed::Overflowed
        }
        Some(Enqueued::Closed) => {
            debug!(topic = %topic, event = %event, "Dispatch worker stopped, dropping");
            Routed::Closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::config::QueueConfig;
    use crate::message::Topic;
    use crate::registry::handler_fn;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        router: EventRouter,
        registry: Arc<EventRegistry>,
        channels: Arc<ChannelTable>,
        pending: Arc<PendingReplies>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(EventRegistry::new(
            QueueConfig::default(),
            CancellationToken::new(),
        ));
        let channels = Arc::new(ChannelTable::new());
        let pending = Arc::new(PendingReplies::new());
        let router = EventRouter::new(
            Arc::clone(&registry),
            Arc::clone(&channels),
            Arc::clone(&pending),
        );
        Fixture {
            router,
            registry,
            channels,
            pending,
        }
    }

    #[tokio::test]
    async fn test_unregistered_is_silent() {
        let fx = fixture();
        let routed = fx
            .router
            .route_text(r#"[null, null, "room:1", "shout", {}]"#);
        assert_eq!(routed, Routed::Unregistered);
    }

    #[tokio::test]
    async fn test_malformed_dropped() {
        let fx = fixture();
        assert_eq!(fx.router.route_text("{"), Routed::Malformed);
        assert_eq!(
            fx.router.route_text(r#"[null, null, null, "shout", {}]"#),
            Routed::Malformed
        );
    }

    #[tokio::test]
    async fn test_routes_to_registered_category() {
        let fx = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.registry.register(
            "shout",
            handler_fn("collect", move |msg| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg);
                    Ok::<_, anyhow::Error>(())
                }
            }),
            None,
        );

        let routed = fx
            .router
            .route_text(r#"[null, null, "room:1", "shout", {"body": "hi"}]"#);
        assert_eq!(routed, Routed::Queued);

        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.payload()["body"], "hi");
        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_handlers_see_post_transition_state() {
        let fx = fixture();
        fx.channels
            .begin_join(&Topic::new("room:1"), Ref::new("r1"), json!({}))
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let channels = Arc::clone(&fx.channels);
        fx.registry.register(
            "phx_reply",
            handler_fn("state", move |msg| {
                let tx = tx.clone();
                let channels = Arc::clone(&channels);
                async move {
                    let _ = tx.send(channels.state(msg.topic().as_str()));
                    Ok::<_, anyhow::Error>(())
                }
            }),
            None,
        );

        let routed = fx
            .router
            .route_text(r#"["r1", "r1", "room:1", "phx_reply", {"status": "ok", "response": {}}]"#);
        assert_eq!(routed, Routed::Queued);
        assert_eq!(rx.recv().await.unwrap(), Some(ChannelState::Joined));
        fx.registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_reply_not_dispatched() {
        let fx = fixture();
        let (tx, mut rx) = mpsc::unbounded_channel();
        fx.registry.register(
            "phx_reply",
            handler_fn("collect", move |msg| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg);
                    Ok::<_, anyhow::Error>(())
                }
            }),
            None,
        );

        let routed = fx
            .router
            .route_text(r#"[null, "5", "phoenix", "phx_reply", {"status": "ok", "response": {}}]"#);
        assert_eq!(routed, Routed::Heartbeat(Some(Ref::new("5"))));

        fx.registry.shutdown().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reply_completes_waiter_without_registration() {
        let fx = fixture();
        let waiter = fx.pending.register(Ref::new("8"));

        let routed = fx
            .router
            .route_text(r#"[null, "8", "room:1", "phx_reply", {"status": "ok", "response": {"n": 1}}]"#);
        assert_eq!(routed, Routed::Unregistered);

        let reply = waiter.await.unwrap().reply().unwrap();
        assert!(reply.status.is_ok());
        assert_eq!(reply.response["n"], 1);
    }

    #[tokio::test]
    async fn test_overflow_reported() {
        let registry = Arc::new(EventRegistry::new(
            QueueConfig {
                capacity: Some(1),
                overflow: crate::config::OverflowPolicy::DropNewest,
            },
            CancellationToken::new(),
        ));
        let router = EventRouter::new(
            Arc::clone(&registry),
            Arc::new(ChannelTable::new()),
            Arc::new(PendingReplies::new()),
        );

        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        registry.register(
            "shout",
            handler_fn("gate", move |_msg| {
                let mut release_rx = release_rx.clone();
                let started_tx = started_tx.clone();
                async move {
                    let _ = started_tx.send(());
                    let _ = release_rx.wait_for(|released| *released).await;
                    Ok::<_, anyhow::Error>(())
                }
            }),
            None,
        );

        let frame = r#"[null, null, "room:1", "shout", {}]"#;
        assert_eq!(router.route_text(frame), Routed::Queued);
        started_rx.recv().await.unwrap();
        // Worker is busy with the first envelope: one fits, the next overflows
        assert_eq!(router.route_text(frame), Routed::Queued);
        assert_eq!(router.route_text(frame), Routed::Overflowed);

        release_tx.send(true).unwrap();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_blocking_queue_holds_without_waiting() {
        let registry = Arc::new(EventRegistry::new(
            QueueConfig {
                capacity: Some(1),
                overflow: crate::config::OverflowPolicy::Block,
            },
            CancellationToken::new(),
        ));
        let pending = Arc::new(PendingReplies::new());
        let router = EventRouter::new(
            Arc::clone(&registry),
            Arc::new(ChannelTable::new()),
            Arc::clone(&pending),
        );

        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        registry.register(
            "shout",
            handler_fn("gate", move |msg| {
                let mut release_rx = release_rx.clone();
                let seen_tx = seen_tx.clone();
                async move {
                    let _ = seen_tx.send(msg.payload()["n"].as_u64());
                    let _ = release_rx.wait_for(|released| *released).await;
                    Ok::<_, anyhow::Error>(())
                }
            }),
            None,
        );

        let shout = |n: u64| format!(r#"[null, null, "room:1", "shout", {{"n": {n}}}]"#);
        assert_eq!(router.route_text(&shout(1)), Routed::Queued);
        assert_eq!(seen_rx.recv().await.unwrap(), Some(1));
        assert_eq!(router.route_text(&shout(2)), Routed::Queued);
        assert_eq!(router.route_text(&shout(3)), Routed::Held);
        assert_eq!(router.route_text(&shout(4)), Routed::Held);
        assert_eq!(router.held_len(), 2);

        // Bookkeeping still runs while the category is backed up
        let waiter = pending.register(Ref::new("9"));
        assert_eq!(
            router.route_text(r#"[null, "9", "room:1", "phx_reply", {"status": "ok", "response": {}}]"#),
            Routed::Unregistered
        );
        assert!(waiter.await.unwrap().reply().unwrap().status.is_ok());

        release_tx.send(true).unwrap();
        while router.has_held() {
            assert_eq!(router.deliver_held().await, Some(Routed::Queued));
        }
        assert_eq!(router.deliver_held().await, None);

        let mut rest = Vec::new();
        for _ in 0..3 {
            rest.push(seen_rx.recv().await.unwrap());
        }
        assert_eq!(rest, vec![Some(2), Some(3), Some(4)]);
        registry.shutdown().await;
    }
}
