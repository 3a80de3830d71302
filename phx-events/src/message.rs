use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Phoenix event and topic constants
pub mod events {
    pub const PHX_JOIN: &str = "phx_join";
    pub const PHX_LEAVE: &str = "phx_leave";
    pub const PHX_REPLY: &str = "phx_reply";
    pub const PHX_CLOSE: &str = "phx_close";
    pub const PHX_ERROR: &str = "phx_error";
    pub const HEARTBEAT: &str = "heartbeat";
    /// Topic used for socket-level messages such as heartbeats
    pub const PHOENIX_TOPIC: &str = "phoenix";
}

/// Reply status constants
pub mod status {
    pub const OK: &str = "ok";
    pub const ERROR: &str = "error";
}

/// Channel identifier, optionally of the form `prefix:subtopic`.
///
/// The subtopic position is computed once when the topic is built.
#[derive(Clone)]
pub struct Topic {
    name: String,
    subtopic_at: Option<usize>,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let subtopic_at = name.find(':').map(|idx| idx + 1);
        Self { name, subtopic_at }
    }

    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Everything after the first colon, or `None` when there is no colon.
    pub fn subtopic(&self) -> Option<&str> {
        self.subtopic_at.map(|idx| &self.name[idx..])
    }
}

impl PartialEq for Topic {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Topic {}

impl Hash for Topic {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl Borrow<str> for Topic {
    fn borrow(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({:?})", self.name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for Topic {
    fn from(name: &str) -> Self {
        Topic::new(name)
    }
}

impl From<String> for Topic {
    fn from(name: String) -> Self {
        Topic::new(name)
    }
}

/// Opaque correlation token linking a request to its reply
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ref(String);

impl Ref {
    pub fn new(value: impl Into<String>) -> Self {
        Ref(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Ref {
    fn from(value: &str) -> Self {
        Ref::new(value)
    }
}

impl From<String> for Ref {
    fn from(value: String) -> Self {
        Ref(value)
    }
}

impl Borrow<str> for Ref {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Application-defined event name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event(String);

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Event(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The closed set of protocol lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhxEvent {
    Close,
    Error,
    Join,
    Reply,
    Leave,
}

impl PhxEvent {
    pub const ALL: [PhxEvent; 5] = [
        PhxEvent::Close,
        PhxEvent::Error,
        PhxEvent::Join,
        PhxEvent::Reply,
        PhxEvent::Leave,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhxEvent::Close => events::PHX_CLOSE,
            PhxEvent::Error => events::PHX_ERROR,
            PhxEvent::Join => events::PHX_JOIN,
            PhxEvent::Reply => events::PHX_REPLY,
            PhxEvent::Leave => events::PHX_LEAVE,
        }
    }

    pub fn from_tag(tag: &str) -> Option<PhxEvent> {
        match tag {
            events::PHX_CLOSE => Some(PhxEvent::Close),
            events::PHX_ERROR => Some(PhxEvent::Error),
            events::PHX_JOIN => Some(PhxEvent::Join),
            events::PHX_REPLY => Some(PhxEvent::Reply),
            events::PHX_LEAVE => Some(PhxEvent::Leave),
            _ => None,
        }
    }
}

impl fmt::Display for PhxEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event category used for routing: a lifecycle event or an application event.
///
/// Always build it through `From<&str>` so that lifecycle tags never end up in
/// the `Application` variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    Lifecycle(PhxEvent),
    Application(Event),
}

impl ChannelEvent {
    pub fn as_str(&self) -> &str {
        match self {
            ChannelEvent::Lifecycle(event) => event.as_str(),
            ChannelEvent::Application(event) => event.as_str(),
        }
    }

    pub fn is_lifecycle(&self) -> bool {
        matches!(self, ChannelEvent::Lifecycle(_))
    }

    /// Re-classify, folding lifecycle tags wrapped as application events.
    pub(crate) fn normalized(self) -> Self {
        match self {
            ChannelEvent::Application(event) => ChannelEvent::from(event.as_str()),
            lifecycle => lifecycle,
        }
    }
}

impl From<&str> for ChannelEvent {
    fn from(tag: &str) -> Self {
        match PhxEvent::from_tag(tag) {
            Some(event) => ChannelEvent::Lifecycle(event),
            None => ChannelEvent::Application(Event::new(tag)),
        }
    }
}

impl From<PhxEvent> for ChannelEvent {
    fn from(event: PhxEvent) -> Self {
        ChannelEvent::Lifecycle(event)
    }
}

impl fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw Phoenix frame as it travels on the wire
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub join_ref: Option<String>,
    pub ref_: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Frame {
    pub fn new(topic: impl Into<String>, event: impl Into<String>, payload: Value) -> Self {
        Self {
            join_ref: None,
            ref_: None,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    pub fn with_ref(mut self, ref_: impl Into<String>) -> Self {
        self.ref_ = Some(ref_.into());
        self
    }

    pub fn with_join_ref(mut self, join_ref: impl Into<String>) -> Self {
        self.join_ref = Some(join_ref.into());
        self
    }

    /// Create a reply frame for the given request
    pub fn reply(request: &Frame, status: &str, response: Value) -> Self {
        Self {
            join_ref: request.join_ref.clone(),
            ref_: request.ref_.clone(),
            topic: request.topic.clone(),
            event: events::PHX_REPLY.to_string(),
            payload: serde_json::json!({
                "status": status,
                "response": response,
            }),
        }
    }

    /// Socket-level heartbeat
    pub fn heartbeat(ref_: &Ref) -> Self {
        Frame::new(
            events::PHOENIX_TOPIC,
            events::HEARTBEAT,
            Value::Object(Map::new()),
        )
        .with_ref(ref_.as_str())
    }
}

/// Decoded, immutable protocol envelope
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelMessage {
    topic: Topic,
    ref_: Option<Ref>,
    join_ref: Option<Ref>,
    event: ChannelEvent,
    payload: Value,
}

impl ChannelMessage {
    pub fn new(topic: impl Into<Topic>, event: &str, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            ref_: None,
            join_ref: None,
            event: ChannelEvent::from(event),
            payload: normalize_payload(payload),
        }
    }

    pub fn with_ref(mut self, ref_: impl Into<Ref>) -> Self {
        self.ref_ = Some(ref_.into());
        self
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn subtopic(&self) -> Option<&str> {
        self.topic.subtopic()
    }

    pub fn ref_(&self) -> Option<&Ref> {
        self.ref_.as_ref()
    }

    pub fn join_ref(&self) -> Option<&Ref> {
        self.join_ref.as_ref()
    }

    pub fn event(&self) -> &ChannelEvent {
        &self.event
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn is_lifecycle(&self) -> bool {
        self.event.is_lifecycle()
    }

    /// Parse the payload of a `phx_reply` envelope
    pub fn reply(&self) -> Option<Reply> {
        match self.event {
            ChannelEvent::Lifecycle(PhxEvent::Reply) => Some(Reply::from_payload(&self.payload)),
            _ => None,
        }
    }
}

impl From<Frame> for ChannelMessage {
    fn from(frame: Frame) -> Self {
        Self {
            topic: Topic::new(frame.topic),
            ref_: frame.ref_.map(Ref),
            join_ref: frame.join_ref.map(Ref),
            event: ChannelEvent::from(frame.event.as_str()),
            payload: normalize_payload(frame.payload),
        }
    }
}

fn normalize_payload(payload: Value) -> Value {
    match payload {
        Value::Null => Value::Object(Map::new()),
        other => other,
    }
}

/// Status carried in a `phx_reply` payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
    Other(String),
}

impl ReplyStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ReplyStatus::Ok => status::OK,
            ReplyStatus::Error => status::ERROR,
            ReplyStatus::Other(other) => other,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ReplyStatus::Ok)
    }
}

/// Parsed `phx_reply` payload: `{"status": ..., "response": ...}`
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: ReplyStatus,
    pub response: Value,
}

impl Reply {
    pub fn from_payload(payload: &Value) -> Self {
        let status = match payload.get("status").and_then(Value::as_str) {
            Some(status::OK) => ReplyStatus::Ok,
            Some(status::ERROR) => ReplyStatus::Error,
            Some(other) => ReplyStatus::Other(other.to_string()),
            None => ReplyStatus::Other(String::new()),
        };
        let response = payload
            .get("response")
            .cloned()
            .filter(|v| !v.is_null())
            .unwrap_or_else(|| Value::Object(Map::new()));

        Reply { status, response }
    }
}
