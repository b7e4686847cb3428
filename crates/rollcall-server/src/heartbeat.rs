//! Proxy liveness: periodic heartbeats and the fleet table built from them.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rollcall_core::model::HEARTBEATS_KEY;
use rollcall_core::{BusMessage, HeartbeatRecord, ProxyId, ProxyPlatform};
use tokio::sync::watch;

use crate::bus::EventBus;
use crate::store::{StoreAccess, StoreError};

/// Every heartbeat currently stored, skipping entries that cannot be decoded.
pub async fn fetch_heartbeats(store: &StoreAccess) -> Result<Vec<HeartbeatRecord>, StoreError> {
    let mut hgetall = redis::cmd("HGETALL");
    hgetall.arg(HEARTBEATS_KEY);
    let raw: Vec<(String, String)> = store.query(&hgetall).await?;

    Ok(raw
        .into_iter()
        .filter_map(|(proxy, json)| match serde_json::from_str::<HeartbeatRecord>(&json) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(proxy = %proxy, error = %e, "Unreadable heartbeat");
                None
            }
        })
        .collect())
}

/// Proxies whose heartbeat is within `staleness` of the store clock.
pub async fn live_proxies(
    store: &StoreAccess,
    staleness: Duration,
) -> Result<Vec<ProxyId>, StoreError> {
    let now = store.server_time_millis().await?;
    let live: Vec<ProxyId> = fetch_heartbeats(store)
        .await?
        .into_iter()
        .filter(|record| !record.is_stale_at(now, staleness))
        .map(|record| record.proxy_id)
        .collect();
    crate::metrics::set_live_proxies(live.len());
    Ok(live)
}

/// Latest heartbeat seen from each proxy over the bus.
#[derive(Default)]
pub struct LivenessTable {
    latest: DashMap<ProxyId, HeartbeatRecord>,
}

impl LivenessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `record` if it is newer than what we have.
    ///
    /// Returns `true` when the proxy was not known before.
    pub fn observe(&self, record: HeartbeatRecord) -> bool {
        match self.latest.entry(record.proxy_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().timestamp < record.timestamp {
                    occupied.insert(record);
                }
                false
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(record);
                true
            }
        }
    }

    pub fn forget(&self, proxy: &ProxyId) -> bool {
        self.latest.remove(proxy).is_some()
    }

    pub fn get(&self, proxy: &ProxyId) -> Option<HeartbeatRecord> {
        self.latest.get(proxy).map(|r| r.clone())
    }
}

/// Heartbeat timestamps follow the store clock but never repeat or go backwards.
fn advance_timestamp(previous: i64, store_now: i64) -> i64 {
    store_now.max(previous + 1)
}

/// Writes this proxy's heartbeat and announces it on the bus.
pub struct HeartbeatTask {
    proxy_id: ProxyId,
    store: StoreAccess,
    bus: Arc<EventBus>,
    platform: Arc<dyn ProxyPlatform>,
    liveness: Arc<LivenessTable>,
    last_timestamp: AtomicI64,
}

impl HeartbeatTask {
    pub fn new(
        proxy_id: ProxyId,
        store: StoreAccess,
        bus: Arc<EventBus>,
        platform: Arc<dyn ProxyPlatform>,
        liveness: Arc<LivenessTable>,
    ) -> Self {
        Self {
            proxy_id,
            store,
            bus,
            platform,
            liveness,
            last_timestamp: AtomicI64::new(0),
        }
    }

    /// Timestamp for the next heartbeat: the store clock, but always after the previous one.
    fn next_timestamp(&self, store_now: i64) -> i64 {
        let mut previous = self.last_timestamp.load(Ordering::Acquire);
        loop {
            let next = advance_timestamp(previous, store_now);
            match self.last_timestamp.compare_exchange(
                previous,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => previous = actual,
            }
        }
    }

    /// Write and publish one heartbeat.
    pub async fn beat(&self) -> Result<HeartbeatRecord, StoreError> {
        let now = self.store.server_time_millis().await?;
        let record = HeartbeatRecord {
            proxy_id: self.proxy_id.clone(),
            timestamp: self.next_timestamp(now),
            player_count: self.platform.local_players().len() as u64,
        };

        let json = serde_json::to_string(&record)
            .map_err(|e| StoreError::Configuration(format!("cannot encode heartbeat: {e}")))?;
        let mut hset = redis::cmd("HSET");
        hset.arg(HEARTBEATS_KEY).arg(self.proxy_id.as_str()).arg(json);
        self.store.query::<()>(&hset).await?;

        self.liveness.observe(record.clone());
        self.bus.publish(BusMessage::Heartbeat(record.clone())).await;

        tracing::trace!(proxy = %self.proxy_id, timestamp = record.timestamp, "Heartbeat");
        Ok(record)
    }

    /// Remove this proxy's heartbeat, marking it gone for the rest of the fleet.
    pub async fn remove(&self) -> Result<(), StoreError> {
        let mut hdel = redis::cmd("HDEL");
        hdel.arg(HEARTBEATS_KEY).arg(self.proxy_id.as_str());
        self.store.query::<()>(&hdel).await?;
        self.liveness.forget(&self.proxy_id);
        Ok(())
    }

    pub fn start(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(proxy = %self.proxy_id, interval_secs = every.as_secs(), "Heartbeat task started");
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.beat().await {
                            tracing::error!(proxy = %self.proxy_id, error = %e, "Heartbeat failed");
                        }
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            tracing::debug!("Heartbeat task shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}
