use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::dispatch::spawn_worker;
use crate::message::{ChannelEvent, ChannelMessage};
use crate::queue::{event_queue, Enqueued, Envelope, QueueSender};

/// Pattern for matching topic strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    /// The pattern string (e.g., "room:*" or "room:lobby")
    pattern: String,
    /// Whether this is a wildcard pattern
    is_wildcard: bool,
    /// The prefix for wildcard patterns (e.g., "room:" for "room:*")
    prefix: String,
}

impl TopicPattern {
    /// Create a new topic pattern
    ///
    /// Supports exact matches ("room:lobby") and wildcard matches ("room:*")
    pub fn new(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let is_wildcard = pattern.ends_with(":*");
        let prefix = if is_wildcard {
            pattern.trim_end_matches('*').to_string()
        } else {
            pattern.clone()
        };

        Self {
            pattern,
            is_wildcard,
            prefix,
        }
    }

    /// Check if this pattern matches the given topic
    pub fn matches(&self, topic: &str) -> bool {
        if self.is_wildcard {
            topic.starts_with(&self.prefix)
        } else {
            topic == self.pattern
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_wildcard(&self) -> bool {
        self.is_wildcard
    }
}

impl From<&str> for TopicPattern {
    fn from(pattern: &str) -> Self {
        TopicPattern::new(pattern)
    }
}

pub type HandlerResult = anyhow::Result<()>;

/// Consumer of envelopes for one event category.
///
/// Handlers registered for the same category run one after another, in
/// registration order, on that category's dispatch worker. An error or a
/// panic is logged and does not affect sibling handlers.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, message: &ChannelMessage) -> HandlerResult;

    /// Name used when logging failures
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Wrap an async closure as an [`EventHandler`]
///
/// ```ignore
/// client.register("new_msg", handler_fn("print", |msg| async move {
///     println!("{}", msg.payload());
///     Ok(())
/// }), None);
/// ```
pub fn handler_fn<F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    F: Fn(ChannelMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(ChannelMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: &ChannelMessage) -> HandlerResult {
        (self.f)(message.clone()).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Returned by `register`, used to `unregister`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegistrationHandle {
    event: ChannelEvent,
    id: u64,
}

impl RegistrationHandle {
    pub fn event(&self) -> &ChannelEvent {
        &self.event
    }
}

pub(crate) struct HandlerEntry {
    pub id: u64,
    pub handler: Arc<dyn EventHandler>,
    pub filter: Option<TopicPattern>,
}

impl HandlerEntry {
    pub fn accepts(&self, topic: &str) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |pattern| pattern.matches(topic))
    }
}

pub(crate) type HandlerList = Arc<RwLock<Vec<Arc<HandlerEntry>>>>;

/// Queue, handlers and worker task of one event category
struct Registration {
    sender: QueueSender,
    handlers: HandlerList,
    task: JoinHandle<()>,
}

/// Maps event categories to their registration entries.
///
/// Entries are created on the first `register` for a category and torn down
/// by `shutdown`. Must be used from within a tokio runtime.
pub struct EventRegistry {
    entries: DashMap<ChannelEvent, Registration>,
    next_id: AtomicU64,
    queue: QueueConfig,
    shutdown: CancellationToken,
}

impl EventRegistry {
    pub fn new(queue: QueueConfig, shutdown: CancellationToken) -> Self {
        Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
            queue,
            shutdown,
        }
    }

    /// Register a handler for an event category, optionally limited to
    /// topics matching `filter`.
    ///
    /// After `shutdown` nothing is registered and no worker is started; the
    /// returned handle does not refer to any handler.
    pub fn register<H: EventHandler>(
        &self,
        event: impl Into<ChannelEvent>,
        handler: H,
        filter: Option<TopicPattern>,
    ) -> RegistrationHandle {
        let event = event.into().normalized();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if self.shutdown.is_cancelled() {
            warn!(event = %event, handler = handler.name(), "Registry is shut down, handler not registered");
            return RegistrationHandle { event, id };
        }
        let entry = Arc::new(HandlerEntry {
            id,
            handler: Arc::new(handler),
            filter,
        });

        let registration = self.entries.entry(event.clone()).or_insert_with(|| {
            debug!(event = %event, "Starting dispatch worker");
            let (sender, receiver) = event_queue(&self.queue);
            let handlers: HandlerList = Arc::new(RwLock::new(Vec::new()));
            let task = spawn_worker(
                event.clone(),
                receiver,
                Arc::clone(&handlers),
                self.shutdown.child_token(),
            );
            Registration {
                sender,
                handlers,
                task,
            }
        });
        registration.handlers.write().push(entry);

        RegistrationHandle { event, id }
    }

    /// Remove a handler. The category keeps its queue and worker.
    pub fn unregister(&self, handle: &RegistrationHandle) -> bool {
        let Some(registration) = self.entries.get(&handle.event) else {
            return false;
        };
        let mut handlers = registration.handlers.write();
        let before = handlers.len();
        handlers.retain(|entry| entry.id != handle.id);
        handlers.len() != before
    }

    pub fn is_registered(&self, event: &ChannelEvent) -> bool {
        self.entries.contains_key(event)
    }

    pub fn handler_count(&self, event: &ChannelEvent) -> usize {
        self.entries
            .get(event)
            .map(|registration| registration.handlers.read().len())
            .unwrap_or(0)
    }

    /// Identity of the category's worker, and whether it is still running
    #[cfg(test)]
    pub(crate) fn worker(&self, event: &ChannelEvent) -> Option<(usize, bool)> {
        self.entries.get(event).map(|registration| {
            (
                Arc::as_ptr(&registration.handlers) as usize,
                !registration.task.is_finished(),
            )
        })
    }

    /// Enqueue without waiting. A full blocking queue hands the envelope back.
    pub(crate) fn try_enqueue(&self, envelope: Envelope) -> Option<Result<Enqueued, Envelope>> {
        let registration = self.entries.get(envelope.event())?;
        Some(registration.sender.try_enqueue(envelope))
    }

    /// Enqueue onto the envelope's category; `None` when nothing is registered.
    pub(crate) async fn enqueue(&self, envelope: Envelope) -> Option<Enqueued> {
        // Clone the sender so no map guard is held across the await
        let sender = self.entries.get(envelope.event())?.sender.clone();
        Some(sender.enqueue(envelope).await)
    }

    /// Stop every dispatch worker and drop all registrations.
    ///
    /// Handler calls already running complete; queued envelopes are discarded.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let events: Vec<ChannelEvent> = self.entries.iter().map(|e| e.key().clone()).collect();
        for event in events {
            if let Some((_, registration)) = self.entries.remove(&event) {
                drop(registration.sender);
                let _ = registration.task.await;
                debug!(event = %event, "Dispatch worker stopped");
            }
        }
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let events: Vec<String> = self.entries.iter().map(|e| e.key().to_string()).collect();
        f.debug_struct("EventRegistry")
            .field("events", &events)
            .finish()
    }
}
