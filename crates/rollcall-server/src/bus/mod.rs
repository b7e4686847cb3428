//! Pub/sub fan-out between the proxies of a fleet.
//!
//! Every proxy publishes to, and subscribes on, one shared channel:
//! 1. A mutation is written to the store
//! 2. The matching message is published on the channel
//! 3. Every subscriber, including the sender, folds it into local caches and
//!    notifies its platform
//!
//! Publishing never fails the caller; errors are logged.

pub mod dispatch;
pub mod subscriber;

use rollcall_core::events::DATA_CHANNEL;
use rollcall_core::{BusEnvelope, BusMessage, ProxyId, RollcallError};
use uuid::Uuid;

pub use dispatch::BusHandler;
pub use subscriber::BusSubscriber;

use crate::store::{StoreAccess, StoreError};

/// Errors that can occur on the bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis subscribe error: {0}")]
    Subscribe(String),

    #[error("Redis publish error: {0}")]
    Publish(#[from] StoreError),

    #[error("Redis message error: {0}")]
    Message(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] RollcallError),

    #[error("Redis pub/sub stream ended")]
    StreamEnded,
}

/// Publishing side of the bus.
pub struct EventBus {
    store: StoreAccess,
    proxy_id: ProxyId,
    /// Distinguishes this process from another one configured with the same proxy id.
    instance: Uuid,
}

impl EventBus {
    pub fn new(store: StoreAccess, proxy_id: ProxyId) -> Self {
        Self {
            store,
            proxy_id,
            instance: Uuid::new_v4(),
        }
    }

    pub fn instance(&self) -> Uuid {
        self.instance
    }

    pub fn proxy_id(&self) -> &ProxyId {
        &self.proxy_id
    }

    /// Publish `message`, logging instead of returning failures.
    pub async fn publish(&self, message: BusMessage) {
        if let Err(e) = self.try_publish(&message).await {
            tracing::warn!(
                proxy = %self.proxy_id,
                sender = %message.sender(),
                error = %e,
                "Failed to publish bus message"
            );
        }
    }

    pub async fn try_publish(&self, message: &BusMessage) -> Result<(), BusError> {
        let payload = BusEnvelope::new(self.instance, message)?.encode()?;

        let mut publish = redis::cmd("PUBLISH");
        publish.arg(DATA_CHANNEL).arg(payload);
        let receivers: i64 = self.store.query(&publish).await?;

        tracing::trace!(channel = DATA_CHANNEL, receivers = receivers, "Published bus message");
        Ok(())
    }
}
