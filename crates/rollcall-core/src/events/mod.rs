//! Messages exchanged between proxies over the shared channel.
//!
//! Every proxy publishes to and subscribes on one channel. A message is a
//! [`BusEnvelope`]: a `type` tag, the sender's process instance id and a `data`
//! body. Presence bodies carry their own `action` tag and are decoded into the
//! closed [`PresenceChange`] enum by explicit dispatch on that tag.

pub mod types;

pub use types::{
    BusEnvelope, BusMessage, ChannelMessage, CommandTarget, PresenceAction, PresenceChange,
    PresenceEvent, ProxyCommand, WirePresenceEvent,
};

/// Name of the shared pub/sub channel.
pub const DATA_CHANNEL: &str = "rollcall-data";
