//! Subscription side of the bus.
//!
//! The subscriber holds a dedicated pub/sub connection (pooled and cluster
//! connections cannot SUBSCRIBE), forwards every message to the [`BusHandler`]
//! and reconnects after failures until shutdown.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use rollcall_core::events::DATA_CHANNEL;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::{BusError, BusHandler};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Background subscriber on the shared channel.
///
/// # Example
///
/// ```ignore
/// let subscriber = Arc::new(BusSubscriber::new(redis_url, handler));
/// let ready = subscriber.ready();
/// tokio::spawn(subscriber.run(shutdown_rx));
/// ```
pub struct BusSubscriber {
    redis_url: String,
    handler: Arc<BusHandler>,
    subscribed: watch::Sender<bool>,
}

impl BusSubscriber {
    pub fn new(redis_url: impl Into<String>, handler: Arc<BusHandler>) -> Self {
        let (subscribed, _) = watch::channel(false);
        Self {
            redis_url: redis_url.into(),
            handler,
            subscribed,
        }
    }

    /// Flips to `true` whenever the subscription is active.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.subscribed.subscribe()
    }

    /// Run until `shutdown` turns true, reconnecting on connection failures.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(channel = DATA_CHANNEL, "Starting bus subscriber");

        loop {
            let result = self.subscribe_loop(&mut shutdown).await;
            self.subscribed.send_replace(false);
            match result {
                Ok(()) => {
                    info!("Bus subscriber stopped gracefully");
                    break;
                }
                Err(e) => {
                    error!(error = %e, delay_secs = RECONNECT_DELAY.as_secs(), "Bus subscriber error, reconnecting");
                    tokio::select! {
                        _ = sleep(RECONNECT_DELAY) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// One subscription lifetime. `Ok` means shutdown was requested.
    async fn subscribe_loop(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), BusError> {
        let client = redis::Client::open(self.redis_url.as_str())
            .map_err(|e| BusError::Connection(e.to_string()))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        pubsub
            .subscribe(DATA_CHANNEL)
            .await
            .map_err(|e| BusError::Subscribe(e.to_string()))?;

        info!(channel = DATA_CHANNEL, "Subscribed to bus channel");
        self.subscribed.send_replace(true);

        let mut stream = pubsub.on_message();

        loop {
            tokio::select! {
                next = stream.next() => match next {
                    Some(msg) => {
                        let payload: String = msg
                            .get_payload()
                            .map_err(|e: redis::RedisError| BusError::Message(e.to_string()))?;
                        debug!(bytes = payload.len(), "Received bus message");
                        self.handler.handle_raw(&payload).await;
                    }
                    None => {
                        warn!("Bus pub/sub stream ended");
                        return Err(BusError::StreamEnded);
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                }
            }
        }
    }
}
