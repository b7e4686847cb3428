pub mod bus;
pub mod config;
pub mod context;
pub mod heartbeat;
pub mod identity;
pub mod metrics;
pub mod observability;
pub mod presence;
pub mod scripts;
pub mod store;
pub mod sweeper;
pub mod worker;

pub use bus::{BusError, BusHandler, BusSubscriber, EventBus};
pub use config::{AppConfig, ConfigError, IdentityConfig, PresenceConfig, RedisConfig, RedisMode};
pub use context::{RollcallContext, current, install};
pub use heartbeat::{HeartbeatTask, LivenessTable};
pub use identity::{IdentityAuthority, IdentityResolver, MojangAuthority};
pub use observability::init_tracing;
pub use presence::{KickOutcome, PresenceCache, PresenceRegistry};
pub use store::{StoreAccess, StoreError};
pub use sweeper::{ReconciliationSweeper, SweepReport};
pub use worker::WorkerPool;
