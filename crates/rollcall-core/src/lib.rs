pub mod error;
pub mod events;
pub mod model;
pub mod platform;
pub mod time;

pub use error::{ErrorCategory, Result, RollcallError};
pub use events::{BusEnvelope, BusMessage, PresenceChange, PresenceEvent};
pub use model::{HeartbeatRecord, IdentityCacheEntry, LastOnline, PlayerRecord, ProxyId};
pub use platform::{HeadlessPlatform, LocalPlayer, NetworkNotification, ProxyPlatform};
