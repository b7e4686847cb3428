//! Per-process presence cache fed by bus events.
//!
//! Entries expire after a fixed TTL. Event timestamps all come from the store
//! clock. An entry built from events remembers the newest timestamp applied and
//! ignores older events. An entry read from the store has no timestamp and
//! gives way to any event.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rollcall_core::{LastOnline, PlayerRecord, PresenceChange, PresenceEvent, ProxyId};
use uuid::Uuid;

/// What this process believes about one player.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedPresence {
    pub proxy: Option<ProxyId>,
    pub server: Option<String>,
    pub ip: Option<IpAddr>,
    pub last_online: LastOnline,
    /// Store-clock millis of the newest event applied; `None` for state read from the store.
    pub as_of: Option<i64>,
}

impl CachedPresence {
    pub fn from_record(record: &PlayerRecord) -> Self {
        Self {
            proxy: record.proxy.clone(),
            server: record.server.clone(),
            ip: record.ip,
            last_online: record.last_online,
            as_of: None,
        }
    }

    pub fn is_online(&self) -> bool {
        self.last_online.is_online()
    }
}

#[derive(Clone, Debug)]
struct Slot {
    presence: CachedPresence,
    cached_at: Instant,
}

impl Slot {
    fn new(presence: CachedPresence) -> Self {
        Self {
            presence,
            cached_at: Instant::now(),
        }
    }
}

pub struct PresenceCache {
    entries: DashMap<Uuid, Slot>,
    ttl: Duration,
}

impl PresenceCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, uuid: &Uuid) -> Option<CachedPresence> {
        if let Some(slot) = self.entries.get(uuid) {
            if slot.cached_at.elapsed() <= self.ttl {
                return Some(slot.presence.clone());
            }
        }
        // Expired or absent
        self.entries
            .remove_if(uuid, |_, slot| slot.cached_at.elapsed() > self.ttl);
        None
    }

    /// Store state read from the shared store, unless an event landed while it was being read.
    pub fn insert(&self, uuid: Uuid, presence: CachedPresence) {
        match self.entries.entry(uuid) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().presence.as_of.is_none() {
                    occupied.insert(Slot::new(presence));
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::new(presence));
            }
        }
    }

    /// Drop what we know about `uuid`; the next read goes to the store.
    pub fn invalidate(&self, uuid: &Uuid) {
        self.entries.remove(uuid);
    }

    /// Fold a bus event into the cache, last timestamp wins.
    ///
    /// Returns `false` when the event was older than the cached state and ignored.
    pub fn apply(&self, event: &PresenceEvent) -> bool {
        let current = self.get(&event.uuid);
        if let Some(cached_ts) = current.as_ref().and_then(|c| c.as_of) {
            if cached_ts > event.timestamp {
                tracing::debug!(
                    uuid = %event.uuid,
                    action = %event.action(),
                    event_ts = event.timestamp,
                    cached_ts = cached_ts,
                    "Ignoring out-of-order presence event"
                );
                return false;
            }
        }

        let next = match &event.change {
            PresenceChange::Join { ip } => Some(CachedPresence {
                proxy: Some(event.sender_proxy.clone()),
                server: None,
                ip: Some(*ip),
                last_online: LastOnline::Online,
                as_of: Some(event.timestamp),
            }),
            PresenceChange::Leave { last_seen_at } => Some(CachedPresence {
                proxy: None,
                server: None,
                ip: None,
                last_online: LastOnline::Offline(*last_seen_at),
                as_of: Some(event.timestamp),
            }),
            PresenceChange::ServerChange { new_server, .. } => match current {
                Some(mut presence) if presence.is_online() => {
                    presence.server = Some(new_server.clone());
                    presence.as_of = Some(event.timestamp);
                    Some(presence)
                }
                // Not enough to build an entry from; let the next read fetch it.
                _ => {
                    self.invalidate(&event.uuid);
                    None
                }
            },
            // The owner's LEAVE carries the state change.
            PresenceChange::Kick { .. } => None,
        };

        if let Some(presence) = next {
            self.entries.insert(event.uuid, Slot::new(presence));
        }
        true
    }

    /// Unexpired entries that say the player is online, with the owner they name.
    pub fn online_owners(&self) -> Vec<(Uuid, ProxyId)> {
        self.entries
            .iter()
            .filter(|slot| slot.cached_at.elapsed() <= self.ttl && slot.presence.is_online())
            .filter_map(|slot| {
                let owner = slot.presence.proxy.clone()?;
                Some((*slot.key(), owner))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
