use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::message::{ChannelEvent, ChannelMessage, PhxEvent, Ref};

/// Outstanding requests waiting for their `phx_reply`, keyed by ref
#[derive(Debug, Default)]
pub(crate) struct PendingReplies {
    waiters: DashMap<Ref, oneshot::Sender<ChannelMessage>>,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, ref_: Ref) -> oneshot::Receiver<ChannelMessage> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(ref_, tx);
        rx
    }

    pub fn cancel(&self, ref_: &Ref) {
        self.waiters.remove(ref_);
    }

    /// Hand a reply to its waiter. Returns whether one was waiting.
    pub fn complete(&self, msg: &ChannelMessage) -> bool {
        if msg.event() != &ChannelEvent::Lifecycle(PhxEvent::Reply) {
            return false;
        }
        let Some(ref_) = msg.ref_() else {
            return false;
        };
        match self.waiters.remove(ref_) {
            Some((_, waiter)) => waiter.send(msg.clone()).is_ok(),
            None => false,
        }
    }

    /// Drop every waiter; their receivers observe a closed channel
    pub fn fail_all(&self) {
        self.waiters.clear();
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_complete_matching_ref() {
        let pending = PendingReplies::new();
        let rx = pending.register(Ref::new("3"));

        let other = ChannelMessage::new("room:1", "phx_reply", json!({"status": "ok"})).with_ref("4");
        assert!(!pending.complete(&other));

        let reply = ChannelMessage::new("room:1", "phx_reply", json!({"status": "ok"})).with_ref("3");
        assert!(pending.complete(&reply));
        assert_eq!(rx.await.unwrap(), reply);
        assert_eq!(pending.len(), 0);
    }

    #[tokio::test]
    async fn test_non_reply_ignored() {
        let pending = PendingReplies::new();
        let _rx = pending.register(Ref::new("3"));

        let push = ChannelMessage::new("room:1", "shout", json!({})).with_ref("3");
        assert!(!pending.complete(&push));
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_fail_all_closes_waiters() {
        let pending = PendingReplies::new();
        let rx = pending.register(Ref::new("1"));
        pending.fail_all();
        assert!(rx.await.is_err());
    }

    #[test]
    fn test_cancel() {
        let pending = PendingReplies::new();
        let _rx = pending.register(Ref::new("1"));
        pending.cancel(&Ref::new("1"));
        assert_eq!(pending.len(), 0);
    }
}
