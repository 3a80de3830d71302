//! Per-event delivery queues.
//!
//! Each event category owns exactly one queue. The flavour is picked from
//! [`QueueConfig`]: unbounded, or bounded with one of the overflow policies.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::config::{OverflowPolicy, QueueConfig};
use crate::message::ChannelMessage;

pub(crate) type Envelope = Arc<ChannelMessage>;

/// Outcome of putting an envelope on a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    /// The overflow policy discarded an envelope: the new one under
    /// `drop_newest`, the oldest queued one under `drop_oldest`
    Dropped,
    /// The dispatch worker is gone
    Closed,
}

#[derive(Clone)]
pub(crate) enum QueueSender {
    Unbounded(mpsc::UnboundedSender<Envelope>),
    Blocking(mpsc::Sender<Envelope>),
    DropNewest(mpsc::Sender<Envelope>),
    DropOldest(Arc<RingSender>),
}

pub(crate) enum QueueReceiver {
    Unbounded(mpsc::UnboundedReceiver<Envelope>),
    Bounded(mpsc::Receiver<Envelope>),
    DropOldest(RingReceiver),
}

/// Create the queue pair for one event category
pub(crate) fn event_queue(config: &QueueConfig) -> (QueueSender, QueueReceiver) {
    let Some(capacity) = config.capacity else {
        let (tx, rx) = mpsc::unbounded_channel();
        return (QueueSender::Unbounded(tx), QueueReceiver::Unbounded(rx));
    };
    let capacity = capacity.max(1);

    match config.overflow {
        OverflowPolicy::Block => {
            let (tx, rx) = mpsc::channel(capacity);
            (QueueSender::Blocking(tx), QueueReceiver::Bounded(rx))
        }
        OverflowPolicy::DropNewest => {
            let (tx, rx) = mpsc::channel(capacity);
            (QueueSender::DropNewest(tx), QueueReceiver::Bounded(rx))
        }
        OverflowPolicy::DropOldest => {
            let (tx, rx) = ring(capacity);
            (QueueSender::DropOldest(Arc::new(tx)), QueueReceiver::DropOldest(rx))
        }
    }
}

impl QueueSender {
    /// Put an envelope on the queue, suspending only under the blocking policy.
    pub(crate) async fn enqueue(&self, envelope: Envelope) -> Enqueued {
        match self {
            QueueSender::Blocking(tx) => match tx.send(envelope).await {
                Ok(()) => Enqueued::Queued,
                Err(_) => Enqueued::Closed,
            },
            _ => match self.try_enqueue(envelope) {
                Ok(outcome) => outcome,
                // Only the blocking flavour reports a full queue
                Err(_) => Enqueued::Closed,
            },
        }
    }

    /// Put an envelope on the queue without waiting.
    ///
    /// A full blocking queue hands the envelope back.
    pub(crate) fn try_enqueue(&self, envelope: Envelope) -> Result<Enqueued, Envelope> {
        match self {
            QueueSender::Unbounded(tx) => match tx.send(envelope) {
                Ok(()) => Ok(Enqueued::Queued),
                Err(_) => Ok(Enqueued::Closed),
            },
            QueueSender::Blocking(tx) => match tx.try_send(envelope) {
                Ok(()) => Ok(Enqueued::Queued),
                Err(mpsc::error::TrySendError::Full(envelope)) => Err(envelope),
                Err(mpsc::error::TrySendError::Closed(_)) => Ok(Enqueued::Closed),
            },
            QueueSender::DropNewest(tx) => match tx.try_send(envelope) {
                Ok(()) => Ok(Enqueued::Queued),
                Err(mpsc::error::TrySendError::Full(_)) => Ok(Enqueued::Dropped),
                Err(mpsc::error::TrySendError::Closed(_)) => Ok(Enqueued::Closed),
            },
            QueueSender::DropOldest(tx) => Ok(tx.push(envelope)),
        }
    }
}

impl QueueReceiver {
    /// Next envelope in arrival order, `None` once every sender is gone
    pub(crate) async fn recv(&mut self) -> Option<Envelope> {
        match self {
            QueueReceiver::Unbounded(rx) => rx.recv().await,
            QueueReceiver::Bounded(rx) => rx.recv().await,
            QueueReceiver::DropOldest(rx) => rx.recv().await,
        }
    }
}

/// Fixed-capacity FIFO shared by the drop-oldest sender and its worker
struct Ring {
    items: Mutex<VecDeque<Envelope>>,
    capacity: usize,
    /// Set when either side goes away
    closed: AtomicBool,
    ready: Notify,
}

pub(crate) struct RingSender(Arc<Ring>);

pub(crate) struct RingReceiver(Arc<Ring>);

fn ring(capacity: usize) -> (RingSender, RingReceiver) {
    let ring = Arc::new(Ring {
        items: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity,
        closed: AtomicBool::new(false),
        ready: Notify::new(),
    });
    (RingSender(Arc::clone(&ring)), RingReceiver(ring))
}

impl RingSender {
    fn push(&self, envelope: Envelope) -> Enqueued {
        if self.0.closed.load(Ordering::Acquire) {
            return Enqueued::Closed;
        }
        let evicted = {
            let mut items = self.0.items.lock();
            let evicted = if items.len() >= self.0.capacity {
                items.pop_front()
            } else {
                None
            };
            items.push_back(envelope);
            evicted
        };
        self.0.ready.notify_one();

        if evicted.is_some() {
            Enqueued::Dropped
        } else {
            Enqueued::Queued
        }
    }
}

impl Drop for RingSender {
    fn drop(&mut self) {
        self.0.closed.store(true, Ordering::Release);
        self.0.ready.notify_one();
    }
}

impl RingReceiver {
    async fn recv(&mut self) -> Option<Envelope> {
        loop {
            let ready = self.0.ready.notified();
            if let Some(envelope) = self.0.items.lock().pop_front() {
                return Some(envelope);
            }
            if self.0.closed.load(Ordering::Acquire) {
                return None;
            }
            ready.await;
        }
    }
}

impl Drop for RingReceiver {
    fn drop(&mut self) {
        self.0.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn envelope(n: u64) -> Envelope {
        Arc::new(ChannelMessage::new("room:1", "shout", json!({ "n": n })))
    }

    fn n(envelope: &Envelope) -> u64 {
        envelope.payload()["n"].as_u64().unwrap()
    }

    fn bounded(capacity: usize, overflow: OverflowPolicy) -> QueueConfig {
        QueueConfig {
            capacity: Some(capacity),
            overflow,
        }
    }

    #[tokio::test]
    async fn test_unbounded_preserves_order() {
        let (tx, mut rx) = event_queue(&QueueConfig::default());
        for i in 0..100 {
            assert_eq!(tx.enqueue(envelope(i)).await, Enqueued::Queued);
        }
        for i in 0..100 {
            assert_eq!(n(&rx.recv().await.unwrap()), i);
        }
    }

    #[tokio::test]
    async fn test_drop_newest_when_full() {
        let (tx, mut rx) = event_queue(&bounded(2, OverflowPolicy::DropNewest));
        assert_eq!(tx.enqueue(envelope(1)).await, Enqueued::Queued);
        assert_eq!(tx.enqueue(envelope(2)).await, Enqueued::Queued);
        assert_eq!(tx.enqueue(envelope(3)).await, Enqueued::Dropped);

        assert_eq!(n(&rx.recv().await.unwrap()), 1);
        assert_eq!(n(&rx.recv().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn test_drop_oldest_when_full() {
        let (tx, mut rx) = event_queue(&bounded(2, OverflowPolicy::DropOldest));
        assert_eq!(tx.enqueue(envelope(1)).await, Enqueued::Queued);
        assert_eq!(tx.enqueue(envelope(2)).await, Enqueued::Queued);
        assert_eq!(tx.enqueue(envelope(3)).await, Enqueued::Dropped);

        assert_eq!(n(&rx.recv().await.unwrap()), 2);
        assert_eq!(n(&rx.recv().await.unwrap()), 3);
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_exact_capacity() {
        let (tx, mut rx) = event_queue(&bounded(3, OverflowPolicy::DropOldest));
        for i in 1..=4 {
            tx.enqueue(envelope(i)).await;
        }
        drop(tx);

        let mut kept = Vec::new();
        while let Some(envelope) = rx.recv().await {
            kept.push(n(&envelope));
        }
        assert_eq!(kept, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_drop_oldest_wakes_waiting_receiver() {
        let (tx, mut rx) = event_queue(&bounded(1, OverflowPolicy::DropOldest));
        let waiting = tokio::spawn(async move { rx.recv().await.map(|envelope| n(&envelope)) });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(tx.enqueue(envelope(7)).await, Enqueued::Queued);
        assert_eq!(waiting.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_block_try_enqueue_hands_back_when_full() {
        let (tx, mut rx) = event_queue(&bounded(1, OverflowPolicy::Block));
        assert_eq!(tx.try_enqueue(envelope(1)), Ok(Enqueued::Queued));

        let returned = tx.try_enqueue(envelope(2)).unwrap_err();
        assert_eq!(n(&returned), 2);

        assert_eq!(n(&rx.recv().await.unwrap()), 1);
        assert_eq!(tx.try_enqueue(returned), Ok(Enqueued::Queued));
        assert_eq!(n(&rx.recv().await.unwrap()), 2);
    }

    #[tokio::test]
    async fn test_block_waits_for_room() {
        let (tx, mut rx) = event_queue(&bounded(1, OverflowPolicy::Block));
        assert_eq!(tx.enqueue(envelope(1)).await, Enqueued::Queued);

        let blocked = tokio::time::timeout(Duration::from_millis(50), tx.enqueue(envelope(2))).await;
        assert!(blocked.is_err(), "enqueue should suspend on a full queue");

        assert_eq!(n(&rx.recv().await.unwrap()), 1);
        assert_eq!(tx.enqueue(envelope(3)).await, Enqueued::Queued);
        assert_eq!(n(&rx.recv().await.unwrap()), 3);
    }

    #[tokio::test]
    async fn test_closed_after_receiver_dropped() {
        let (tx, rx) = event_queue(&QueueConfig::default());
        drop(rx);
        assert_eq!(tx.enqueue(envelope(1)).await, Enqueued::Closed);

        let (tx, rx) = event_queue(&bounded(2, OverflowPolicy::DropOldest));
        drop(rx);
        assert_eq!(tx.enqueue(envelope(1)).await, Enqueued::Closed);
    }
}
