//! Bidirectional name <-> uuid resolution.
//!
//! ## Lookup Order
//!
//! ```text
//! platform (live) → memory (DashMap) → shared (`uuid-cache`) → authority (HTTP)
//! ```
//!
//! A name that parses as a uuid is returned as is once memory misses. In
//! offline mode a name that memory does not know maps to its offline uuid
//! and the shared cache and authority are skipped.
//!
//! Entries carry an absolute expiry; an expired entry is treated as absent and
//! removed from whichever tier it was found in. Successful authority lookups are
//! written back to both caches. Failures never reach the caller: they are logged
//! and the lookup reports a miss.

pub mod authority;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use md5::{Digest, Md5};
use rollcall_core::model::{IdentityCacheEntry, UUID_CACHE_KEY};
use rollcall_core::ProxyPlatform;
use tokio::sync::watch;
use uuid::Uuid;

pub use authority::{ExternalLookupError, IdentityAuthority, MojangAuthority};

use crate::metrics;
use crate::store::{StoreAccess, StoreError};

/// Uuid a server without authentication assigns to `name`.
///
/// Name-based MD5 uuid (version 3) over `"OfflinePlayer:" + name`, without a namespace.
pub fn offline_uuid(name: &str) -> Uuid {
    let digest = Md5::digest(format!("OfflinePlayer:{name}").as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest);
    uuid::Builder::from_md5_bytes(bytes).into_uuid()
}

/// Parse `input` when it is already a uuid, dashed or as 32 hex digits.
pub fn parse_literal_uuid(input: &str) -> Option<Uuid> {
    let looks_like_uuid = match input.len() {
        36 => input
            .chars()
            .enumerate()
            .all(|(i, c)| matches!(i, 8 | 13 | 18 | 23) == (c == '-') && (c == '-' || c.is_ascii_hexdigit())),
        32 => input.chars().all(|c| c.is_ascii_hexdigit()),
        _ => false,
    };
    if looks_like_uuid {
        Uuid::parse_str(input).ok()
    } else {
        None
    }
}

pub struct IdentityResolver {
    store: StoreAccess,
    platform: Arc<dyn ProxyPlatform>,
    authority: Arc<dyn IdentityAuthority>,
    /// Keyed by lower-cased name
    by_name: DashMap<String, IdentityCacheEntry>,
    by_uuid: DashMap<Uuid, IdentityCacheEntry>,
    ttl: Duration,
    online_mode: bool,
}

impl IdentityResolver {
    pub fn new(
        store: StoreAccess,
        platform: Arc<dyn ProxyPlatform>,
        authority: Arc<dyn IdentityAuthority>,
        ttl: Duration,
        online_mode: bool,
    ) -> Self {
        Self {
            store,
            platform,
            authority,
            by_name: DashMap::new(),
            by_uuid: DashMap::new(),
            ttl,
            online_mode,
        }
    }

    /// Uuid currently associated with `name`, or `None` when unknown.
    pub async fn resolve_uuid(&self, name: &str, allow_external: bool) -> Option<Uuid> {
        if let Some(player) = self.platform.local_player_by_name(name) {
            metrics::record_cache_hit("platform");
            return Some(player.uuid);
        }

        let key = name.to_lowercase();

        if let Some(entry) = self.memory_get(&self.by_name, &key) {
            metrics::record_cache_hit("memory");
            return Some(entry.uuid);
        }

        if let Some(uuid) = parse_literal_uuid(name) {
            return Some(uuid);
        }

        // Derivable, so never cached.
        if !self.online_mode {
            return Some(offline_uuid(name));
        }

        match self.shared_get(&key).await {
            Ok(Some(entry)) => {
                metrics::record_cache_hit("shared");
                let uuid = entry.uuid;
                self.remember_entry(entry);
                return Some(uuid);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "Shared identity cache unavailable");
            }
        }

        if !allow_external {
            metrics::record_cache_miss();
            return None;
        }

        match self.authority.lookup_uuid(name).await {
            Ok(Some((uuid, canonical_name))) => {
                metrics::record_cache_hit("authority");
                self.persist(IdentityCacheEntry::new(canonical_name, uuid, self.ttl))
                    .await;
                Some(uuid)
            }
            Ok(None) => {
                metrics::record_cache_miss();
                None
            }
            Err(e) => {
                tracing::warn!(name = %name, error = %e, "Identity authority lookup failed");
                metrics::record_cache_miss();
                None
            }
        }
    }

    /// Current name of `uuid`, or `None` when unknown.
    pub async fn resolve_name(&self, uuid: &Uuid, allow_external: bool) -> Option<String> {
        if let Some(player) = self.platform.local_player(uuid) {
            metrics::record_cache_hit("platform");
            return Some(player.name);
        }

        if let Some(entry) = self.memory_get(&self.by_uuid, uuid) {
            metrics::record_cache_hit("memory");
            return Some(entry.name);
        }

        match self.shared_get(&uuid.to_string()).await {
            Ok(Some(entry)) => {
                metrics::record_cache_hit("shared");
                let name = entry.name.clone();
                self.remember_entry(entry);
                return Some(name);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(uuid = %uuid, error = %e, "Shared identity cache unavailable");
            }
        }

        if !allow_external || !self.online_mode {
            metrics::record_cache_miss();
            return None;
        }

        match self.authority.lookup_name(uuid).await {
            Ok(Some(name)) => {
                metrics::record_cache_hit("authority");
                self.persist(IdentityCacheEntry::new(name.clone(), *uuid, self.ttl))
                    .await;
                Some(name)
            }
            Ok(None) => {
                metrics::record_cache_miss();
                None
            }
            Err(e) => {
                tracing::warn!(uuid = %uuid, error = %e, "Identity authority lookup failed");
                metrics::record_cache_miss();
                None
            }
        }
    }

    /// Record an association observed first-hand, e.g. a player logging in.
    pub async fn remember(&self, name: &str, uuid: Uuid) {
        self.persist(IdentityCacheEntry::new(name, uuid, self.ttl)).await;
    }

    /// Pull the shared entry of `uuid` into memory ahead of a lookup.
    pub async fn warm(&self, uuid: &Uuid) {
        if self.memory_get(&self.by_uuid, uuid).is_some() {
            return;
        }
        match self.shared_get(&uuid.to_string()).await {
            Ok(Some(entry)) => self.remember_entry(entry),
            Ok(None) => {}
            Err(e) => tracing::debug!(uuid = %uuid, error = %e, "Could not warm identity cache"),
        }
    }

    /// Delete every expired entry from the shared cache and from memory.
    ///
    /// Returns the number of shared fields removed.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.by_name.retain(|_, entry| !entry.is_expired());
        self.by_uuid.retain(|_, entry| !entry.is_expired());

        let mut hgetall = redis::cmd("HGETALL");
        hgetall.arg(UUID_CACHE_KEY);
        let all: Vec<(String, String)> = self.store.query(&hgetall).await?;

        let stale: Vec<String> = all
            .into_iter()
            .filter(|(field, raw)| match serde_json::from_str::<IdentityCacheEntry>(raw) {
                Ok(entry) => entry.is_expired(),
                Err(e) => {
                    tracing::debug!(field = %field, error = %e, "Dropping unreadable identity entry");
                    true
                }
            })
            .map(|(field, _)| field)
            .collect();

        if stale.is_empty() {
            return Ok(0);
        }

        let mut hdel = redis::cmd("HDEL");
        hdel.arg(UUID_CACHE_KEY).arg(&stale);
        let removed: usize = self.store.query(&hdel).await?;
        tracing::info!(removed = removed, "Purged expired identity entries");
        Ok(removed)
    }

    /// Run [`purge_expired`](Self::purge_expired) every `every` until shutdown.
    pub fn start_purge_task(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.purge_expired().await {
                            tracing::warn!(error = %e, "Identity cache purge failed");
                        }
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            tracing::debug!("Identity purge task shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn memory_get<K>(&self, map: &DashMap<K, IdentityCacheEntry>, key: &K) -> Option<IdentityCacheEntry>
    where
        K: std::hash::Hash + Eq,
    {
        let entry = map.get(key)?.clone();
        if entry.is_expired() {
            self.forget_memory(&entry);
            return None;
        }
        Some(entry)
    }

    fn forget_memory(&self, entry: &IdentityCacheEntry) {
        self.by_name
            .remove_if(&entry.name_field(), |_, cached| cached.uuid == entry.uuid);
        self.by_uuid
            .remove_if(&entry.uuid, |_, cached| cached.name == entry.name);
    }

    fn remember_entry(&self, entry: IdentityCacheEntry) {
        self.by_name.insert(entry.name_field(), entry.clone());
        self.by_uuid.insert(entry.uuid, entry);
    }

    async fn shared_get(&self, field: &str) -> Result<Option<IdentityCacheEntry>, StoreError> {
        let mut hget = redis::cmd("HGET");
        hget.arg(UUID_CACHE_KEY).arg(field);
        let Some(raw) = self.store.query::<Option<String>>(&hget).await? else {
            return Ok(None);
        };

        let entry: IdentityCacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(field = %field, error = %e, "Unreadable identity entry, removing");
                let mut hdel = redis::cmd("HDEL");
                hdel.arg(UUID_CACHE_KEY).arg(field);
                self.store.query::<()>(&hdel).await?;
                return Ok(None);
            }
        };

        if entry.is_expired() {
            let mut hdel = redis::cmd("HDEL");
            hdel.arg(UUID_CACHE_KEY)
                .arg(entry.name_field())
                .arg(entry.uuid_field());
            self.store.query::<()>(&hdel).await?;
            self.forget_memory(&entry);
            return Ok(None);
        }

        Ok(Some(entry))
    }

    async fn persist(&self, entry: IdentityCacheEntry) {
        self.remember_entry(entry.clone());

        let json = match serde_json::to_string(&entry) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(uuid = %entry.uuid, error = %e, "Could not encode identity entry");
                return;
            }
        };

        let mut hset = redis::cmd("HSET");
        hset.arg(UUID_CACHE_KEY)
            .arg(entry.name_field())
            .arg(&json)
            .arg(entry.uuid_field())
            .arg(&json);
        if let Err(e) = self.store.query::<()>(&hset).await {
            tracing::warn!(uuid = %entry.uuid, error = %e, "Could not persist identity entry");
        }
    }
}
