pub mod channel;
pub mod client;
pub mod config;
pub(crate) mod dispatch;
pub mod error;
pub mod message;
pub(crate) mod queue;
pub mod reference;
pub mod registry;
pub(crate) mod reply;
pub(crate) mod router;
pub mod serializer;
pub mod socket;
pub mod testing;
pub mod transport;

pub use channel::{ChannelState, ChannelTable, Transition};
pub use client::PhxChannelsClient;
pub use config::{load_config, ClientConfig, OverflowPolicy, QueueConfig, ReconnectConfig};
pub use error::PhxError;
pub use message::{
    events, ChannelEvent, ChannelMessage, Event, Frame, PhxEvent, Ref, Reply, ReplyStatus, Topic,
};
pub use reference::RefAllocator;
pub use registry::{handler_fn, EventHandler, HandlerResult, RegistrationHandle, TopicPattern};
pub use socket::{ConnectionStatus, ShutdownReason};
pub use transport::{socket_url, Connection, Connector, WebSocketConnector};
