//! Per-topic channel lifecycle.
//!
//! ```text
//! Joining -> Joined -> Leaving -> Left
//!    |         |
//!    +---------+--> Errored -> Joining (rejoin)
//! ```
//!
//! Transitions run under the topic's map entry lock, so a state change is
//! atomic with respect to concurrent deliveries for the same topic.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::PhxError;
use crate::message::{events, ChannelEvent, ChannelMessage, Frame, PhxEvent, Ref, Topic};
use crate::reference::RefAllocator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    Joining,
    Joined,
    Leaving,
    Left,
    Errored,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Joining => "joining",
            ChannelState::Joined => "joined",
            ChannelState::Leaving => "leaving",
            ChannelState::Left => "left",
            ChannelState::Errored => "errored",
        }
    }
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A state change caused by an inbound envelope or by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub topic: Topic,
    pub from: ChannelState,
    pub to: ChannelState,
}

#[derive(Debug)]
struct TopicChannel {
    state: ChannelState,
    /// Ref of the join that opened the current channel instance
    join_ref: Ref,
    /// Ref of the join or leave still waiting for its reply
    pending: Option<Ref>,
    join_payload: Value,
    /// Set on transport loss, cleared when the rejoin is issued
    rejoin: bool,
}

impl TopicChannel {
    fn joining(join_ref: Ref, join_payload: Value) -> Self {
        Self {
            state: ChannelState::Joining,
            pending: Some(join_ref.clone()),
            join_ref,
            join_payload,
            rejoin: false,
        }
    }

    fn restart(&mut self, join_ref: Ref) {
        self.state = ChannelState::Joining;
        self.pending = Some(join_ref.clone());
        self.join_ref = join_ref;
        self.rejoin = false;
    }

    fn join_frame(&self, topic: &Topic) -> Frame {
        Frame::new(topic.as_str(), events::PHX_JOIN, self.join_payload.clone())
            .with_ref(self.join_ref.as_str())
            .with_join_ref(self.join_ref.as_str())
    }

    /// Envelopes tagged with an older join_ref belong to a previous channel
    /// instance and must not move the current one.
    fn is_current(&self, msg: &ChannelMessage) -> bool {
        msg.join_ref().map_or(true, |join_ref| *join_ref == self.join_ref)
    }
}

/// Lifecycle state of every topic this client has touched
#[derive(Debug, Default)]
pub struct ChannelTable {
    channels: DashMap<Topic, TopicChannel>,
}

impl ChannelTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, topic: &str) -> Option<ChannelState> {
        self.channels.get(topic).map(|channel| channel.state)
    }

    pub fn join_ref(&self, topic: &str) -> Option<Ref> {
        self.channels.get(topic).map(|channel| channel.join_ref.clone())
    }

    pub fn topics_in(&self, state: ChannelState) -> Vec<Topic> {
        self.channels
            .iter()
            .filter(|entry| entry.state == state)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Enter `Joining` and build the `phx_join` frame.
    ///
    /// Allowed for unknown topics and for topics in `Left` or `Errored`.
    pub(crate) fn begin_join(
        &self,
        topic: &Topic,
        join_ref: Ref,
        payload: Value,
    ) -> Result<Frame, PhxError> {
        match self.channels.entry(topic.clone()) {
            Entry::Vacant(vacant) => {
                let channel = TopicChannel::joining(join_ref, payload);
                let frame = channel.join_frame(topic);
                vacant.insert(channel);
                Ok(frame)
            }
            Entry::Occupied(mut occupied) => {
                let channel = occupied.get_mut();
                match channel.state {
                    ChannelState::Left | ChannelState::Errored => {
                        channel.join_payload = payload;
                        channel.restart(join_ref);
                        Ok(channel.join_frame(topic))
                    }
                    _ => Err(PhxError::AlreadyJoined(topic.to_string())),
                }
            }
        }
    }

    /// Re-enter `Joining` from `Errored` or `Left` with the original payload
    pub(crate) fn rejoin(&self, topic: &Topic, join_ref: Ref) -> Result<Frame, PhxError> {
        let mut channel = self
            .channels
            .get_mut(topic.as_str())
            .ok_or_else(|| PhxError::NotJoined(topic.to_string()))?;

        match channel.state {
            ChannelState::Errored | ChannelState::Left => {
                channel.restart(join_ref);
                Ok(channel.join_frame(topic))
            }
            _ => Err(PhxError::AlreadyJoined(topic.to_string())),
        }
    }

    /// `Joined -> Leaving` and the `phx_leave` frame
    pub(crate) fn begin_leave(&self, topic: &Topic, leave_ref: Ref) -> Result<Frame, PhxError> {
        let mut channel = self
            .channels
            .get_mut(topic.as_str())
            .filter(|channel| channel.state == ChannelState::Joined)
            .ok_or_else(|| PhxError::NotJoined(topic.to_string()))?;

        channel.state = ChannelState::Leaving;
        channel.pending = Some(leave_ref.clone());

        Ok(
            Frame::new(topic.as_str(), events::PHX_LEAVE, Value::Object(Default::default()))
                .with_ref(leave_ref.as_str())
                .with_join_ref(channel.join_ref.as_str()),
        )
    }

    /// Application push on a joining or joined channel
    pub(crate) fn push_frame(
        &self,
        topic: &Topic,
        event: &str,
        payload: Value,
        push_ref: &Ref,
    ) -> Result<Frame, PhxError> {
        let channel = self
            .channels
            .get(topic.as_str())
            .filter(|channel| {
                matches!(channel.state, ChannelState::Joining | ChannelState::Joined)
            })
            .ok_or_else(|| PhxError::NotJoined(topic.to_string()))?;

        Ok(Frame::new(topic.as_str(), event, payload)
            .with_ref(push_ref.as_str())
            .with_join_ref(channel.join_ref.as_str()))
    }

    /// Apply an inbound lifecycle envelope. Returns the transition, if any.
    pub(crate) fn observe(&self, msg: &ChannelMessage) -> Option<Transition> {
        let ChannelEvent::Lifecycle(event) = msg.event() else {
            return None;
        };
        let mut channel = self.channels.get_mut(msg.topic().as_str())?;
        let from = channel.state;

        let to = match event {
            PhxEvent::Reply => {
                let ref_ = msg.ref_()?;
                if channel.pending.as_ref() != Some(ref_) {
                    return None;
                }
                let reply = msg.reply()?;
                channel.pending = None;
                match from {
                    ChannelState::Joining if reply.status.is_ok() => ChannelState::Joined,
                    ChannelState::Joining => ChannelState::Errored,
                    ChannelState::Leaving => ChannelState::Left,
                    _ => return None,
                }
            }
            PhxEvent::Error => {
                if !channel.is_current(msg) {
                    return None;
                }
                match from {
                    ChannelState::Joining | ChannelState::Joined => {
                        channel.pending = None;
                        ChannelState::Errored
                    }
                    _ => return None,
                }
            }
            PhxEvent::Close => {
                if !channel.is_current(msg) {
                    return None;
                }
                match from {
                    ChannelState::Joining | ChannelState::Joined | ChannelState::Leaving => {
                        channel.pending = None;
                        ChannelState::Left
                    }
                    _ => return None,
                }
            }
            PhxEvent::Join | PhxEvent::Leave => return None,
        };

        channel.state = to;
        Some(Transition {
            topic: msg.topic().clone(),
            from,
            to,
        })
    }

    /// The `phx_join` for `join_ref` never reached the server. The topic is
    /// parked in `Errored` and flagged so the next connection rejoins it.
    pub(crate) fn abort_join(&self, topic: &Topic, join_ref: &Ref) -> Option<Transition> {
        let mut channel = self.channels.get_mut(topic.as_str())?;
        if channel.state != ChannelState::Joining || channel.pending.as_ref() != Some(join_ref) {
            return None;
        }
        channel.state = ChannelState::Errored;
        channel.pending = None;
        channel.rejoin = true;
        Some(Transition {
            topic: topic.clone(),
            from: ChannelState::Joining,
            to: ChannelState::Errored,
        })
    }

    /// Transport lost: joined and joining topics become `Errored` and are
    /// flagged for rejoin; a pending leave counts as done.
    pub(crate) fn on_disconnect(&self) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for mut entry in self.channels.iter_mut() {
            let from = entry.state;
            let to = match from {
                ChannelState::Joining | ChannelState::Joined => {
                    entry.rejoin = true;
                    ChannelState::Errored
                }
                ChannelState::Leaving => ChannelState::Left,
                _ => continue,
            };
            entry.state = to;
            entry.pending = None;
            transitions.push(Transition {
                topic: entry.key().clone(),
                from,
                to,
            });
        }
        transitions
    }

    /// Transport back: every topic flagged by `on_disconnect` re-enters
    /// `Joining` with a fresh ref. Returns the join frames to send.
    pub(crate) fn rejoin_flagged(&self, refs: &RefAllocator) -> Vec<Frame> {
        let mut frames = Vec::new();
        for mut entry in self.channels.iter_mut() {
            if !entry.rejoin || entry.state != ChannelState::Errored {
                continue;
            }
            entry.restart(refs.next_ref());
            frames.push(entry.join_frame(entry.key()));
        }
        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(topic: &str, ref_: &str, status: &str) -> ChannelMessage {
        ChannelMessage::new(topic, "phx_reply", json!({"status": status, "response": {}}))
            .with_ref(ref_)
    }

    fn joined(table: &ChannelTable, topic: &str, ref_: &str) {
        table
            .begin_join(&Topic::new(topic), Ref::new(ref_), json!({}))
            .unwrap();
        table.observe(&reply(topic, ref_, "ok")).unwrap();
        assert_eq!(table.state(topic), Some(ChannelState::Joined));
    }

    #[test]
    fn test_join_frame() {
        let table = ChannelTable::new();
        let frame = table
            .begin_join(&Topic::new("room:1"), Ref::new("r1"), json!({"user": "a"}))
            .unwrap();

        assert_eq!(frame.topic, "room:1");
        assert_eq!(frame.event, events::PHX_JOIN);
        assert_eq!(frame.ref_.as_deref(), Some("r1"));
        assert_eq!(frame.join_ref.as_deref(), Some("r1"));
        assert_eq!(frame.payload, json!({"user": "a"}));
        assert_eq!(table.state("room:1"), Some(ChannelState::Joining));
    }

    #[test]
    fn test_join_ok_error_rejoin_scenario() {
        let table = ChannelTable::new();
        table
            .begin_join(&Topic::new("room:1"), Ref::new("r1"), json!({}))
            .unwrap();

        let transition = table.observe(&reply("room:1", "r1", "ok")).unwrap();
        assert_eq!(transition.from, ChannelState::Joining);
        assert_eq!(transition.to, ChannelState::Joined);

        let error = ChannelMessage::new("room:1", "phx_error", json!({}));
        let transition = table.observe(&error).unwrap();
        assert_eq!(transition.to, ChannelState::Errored);

        table
            .begin_join(&Topic::new("room:1"), Ref::new("r2"), json!({}))
            .unwrap();
        assert_eq!(table.state("room:1"), Some(ChannelState::Joining));
        assert_eq!(table.join_ref("room:1"), Some(Ref::new("r2")));
    }

    #[test]
    fn test_reply_with_other_ref_ignored() {
        let table = ChannelTable::new();
        table
            .begin_join(&Topic::new("room:1"), Ref::new("r1"), json!({}))
            .unwrap();

        assert!(table.observe(&reply("room:1", "r9", "ok")).is_none());
        assert_eq!(table.state("room:1"), Some(ChannelState::Joining));
    }

    #[test]
    fn test_join_rejected() {
        let table = ChannelTable::new();
        table
            .begin_join(&Topic::new("room:1"), Ref::new("r1"), json!({}))
            .unwrap();

        table.observe(&reply("room:1", "r1", "error")).unwrap();
        assert_eq!(table.state("room:1"), Some(ChannelState::Errored));
    }

    #[test]
    fn test_error_while_joining() {
        let table = ChannelTable::new();
        table
            .begin_join(&Topic::new("room:1"), Ref::new("r1"), json!({}))
            .unwrap();

        let error = ChannelMessage::new("room:1", "phx_error", json!({}));
        table.observe(&error).unwrap();
        assert_eq!(table.state("room:1"), Some(ChannelState::Errored));
    }

    #[test]
    fn test_double_join_rejected() {
        let table = ChannelTable::new();
        joined(&table, "room:1", "r1");

        let result = table.begin_join(&Topic::new("room:1"), Ref::new("r2"), json!({}));
        assert!(matches!(result, Err(PhxError::AlreadyJoined(_))));
    }

    #[test]
    fn test_leave_then_reply() {
        let table = ChannelTable::new();
        joined(&table, "room:1", "r1");

        let frame = table.begin_leave(&Topic::new("room:1"), Ref::new("r2")).unwrap();
        assert_eq!(frame.event, events::PHX_LEAVE);
        assert_eq!(frame.ref_.as_deref(), Some("r2"));
        assert_eq!(frame.join_ref.as_deref(), Some("r1"));
        assert_eq!(table.state("room:1"), Some(ChannelState::Leaving));

        table.observe(&reply("room:1", "r2", "ok")).unwrap();
        assert_eq!(table.state("room:1"), Some(ChannelState::Left));
    }

    #[test]
    fn test_leave_then_close() {
        let table = ChannelTable::new();
        joined(&table, "room:1", "r1");
        table.begin_leave(&Topic::new("room:1"), Ref::new("r2")).unwrap();

        let close = ChannelMessage::new("room:1", "phx_close", json!({}));
        table.observe(&close).unwrap();
        assert_eq!(table.state("room:1"), Some(ChannelState::Left));
    }

    #[test]
    fn test_leave_requires_joined() {
        let table = ChannelTable::new();
        let result = table.begin_leave(&Topic::new("room:1"), Ref::new("r1"));
        assert!(matches!(result, Err(PhxError::NotJoined(_))));

        table
            .begin_join(&Topic::new("room:1"), Ref::new("r1"), json!({}))
            .unwrap();
        let result = table.begin_leave(&Topic::new("room:1"), Ref::new("r2"));
        assert!(matches!(result, Err(PhxError::NotJoined(_))));
    }

    #[test]
    fn test_stale_error_ignored() {
        let table = ChannelTable::new();
        joined(&table, "room:1", "r5");

        let stale = ChannelMessage::from(
            Frame::new("room:1", "phx_error", json!({})).with_join_ref("r1"),
        );
        assert!(table.observe(&stale).is_none());
        assert_eq!(table.state("room:1"), Some(ChannelState::Joined));
    }

    #[test]
    fn test_server_close_while_joined() {
        let table = ChannelTable::new();
        joined(&table, "room:1", "r1");

        let close = ChannelMessage::new("room:1", "phx_close", json!({}));
        table.observe(&close).unwrap();
        assert_eq!(table.state("room:1"), Some(ChannelState::Left));

        assert!(table.on_disconnect().is_empty());
    }

    #[test]
    fn test_push_frame_requires_membership() {
        let table = ChannelTable::new();
        let result = table.push_frame(&Topic::new("room:1"), "shout", json!({}), &Ref::new("1"));
        assert!(matches!(result, Err(PhxError::NotJoined(_))));

        joined(&table, "room:1", "r1");
        let frame = table
            .push_frame(&Topic::new("room:1"), "shout", json!({"a": 1}), &Ref::new("7"))
            .unwrap();
        assert_eq!(frame.ref_.as_deref(), Some("7"));
        assert_eq!(frame.join_ref.as_deref(), Some("r1"));
        assert_eq!(frame.event, "shout");
    }

    #[test]
    fn test_disconnect_and_rejoin_flagged() {
        let table = ChannelTable::new();
        let refs = RefAllocator::new();
        joined(&table, "room:1", "a");
        joined(&table, "room:2", "b");
        joined(&table, "room:3", "c");
        table.begin_leave(&Topic::new("room:3"), Ref::new("d")).unwrap();

        let transitions = table.on_disconnect();
        assert_eq!(transitions.len(), 3);
        assert_eq!(table.state("room:1"), Some(ChannelState::Errored));
        assert_eq!(table.state("room:2"), Some(ChannelState::Errored));
        assert_eq!(table.state("room:3"), Some(ChannelState::Left));

        let mut frames = table.rejoin_flagged(&refs);
        frames.sort_by(|a, b| a.topic.cmp(&b.topic));
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].topic, "room:1");
        assert_eq!(frames[1].topic, "room:2");
        assert_ne!(frames[0].ref_, frames[1].ref_);
        for frame in &frames {
            assert_eq!(frame.event, events::PHX_JOIN);
            assert_eq!(frame.ref_, frame.join_ref);
        }
        assert_eq!(table.state("room:1"), Some(ChannelState::Joining));

        assert!(table.rejoin_flagged(&refs).is_empty());
    }

    #[test]
    fn test_aborted_join_is_rejoined() {
        let table = ChannelTable::new();
        let refs = RefAllocator::new();
        let topic = Topic::new("room:1");
        table.begin_join(&topic, Ref::new("r1"), json!({})).unwrap();

        assert!(table.abort_join(&topic, &Ref::new("other")).is_none());
        let transition = table.abort_join(&topic, &Ref::new("r1")).unwrap();
        assert_eq!(transition.to, ChannelState::Errored);

        let frames = table.rejoin_flagged(&refs);
        assert_eq!(frames.len(), 1);
        assert_eq!(table.state("room:1"), Some(ChannelState::Joining));
    }

    #[test]
    fn test_explicit_rejoin_keeps_payload() {
        let table = ChannelTable::new();
        table
            .begin_join(&Topic::new("room:1"), Ref::new("r1"), json!({"token": "t"}))
            .unwrap();
        table.observe(&reply("room:1", "r1", "error")).unwrap();

        let frame = table.rejoin(&Topic::new("room:1"), Ref::new("r2")).unwrap();
        assert_eq!(frame.payload, json!({"token": "t"}));
        assert_eq!(table.state("room:1"), Some(ChannelState::Joining));

        let result = table.rejoin(&Topic::new("room:1"), Ref::new("r3"));
        assert!(matches!(result, Err(PhxError::AlreadyJoined(_))));
    }

    #[test]
    fn test_topics_in() {
        let table = ChannelTable::new();
        joined(&table, "room:1", "r1");
        table
            .begin_join(&Topic::new("room:2"), Ref::new("r2"), json!({}))
            .unwrap();

        assert_eq!(table.topics_in(ChannelState::Joined), vec![Topic::new("room:1")]);
        assert_eq!(table.topics_in(ChannelState::Joining), vec![Topic::new("room:2")]);
    }
}
