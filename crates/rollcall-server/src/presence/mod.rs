//! Fleet-wide presence registry.
//!
//! ## State
//!
//! ```text
//! Offline ──JOIN──▶ Online(proxy, -) ──SERVER_CHANGE──▶ Online(proxy, server)
//!    ▲                                                       │
//!    └──────────────── LEAVE / executed KICK ◀───────────────┘
//! ```
//!
//! Writes go to the shared store first and are then announced on the bus.
//! Every event is stamped with the store clock after its write lands.
//! Reads prefer the local platform for players connected here, then the
//! presence cache, then the store.
//!
//! A record names its owner only while the owner's set holds the player:
//! ownership is added to the set before the record and cleared from the record
//! before the set. Whatever step fails, the sweeper can still find the player.

pub mod cache;

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use redis::Cmd;
use rollcall_core::events::{ChannelMessage, CommandTarget, ProxyCommand};
use rollcall_core::model::{fields, player_key, proxy_members_key};
use rollcall_core::{
    BusMessage, LastOnline, PlayerRecord, PresenceChange, PresenceEvent, ProxyId, ProxyPlatform,
    RollcallError,
};
use uuid::Uuid;

pub use cache::{CachedPresence, PresenceCache};

use crate::bus::EventBus;
use crate::heartbeat;
use crate::scripts::BuiltinScripts;
use crate::store::StoreAccess;

pub type Result<T> = std::result::Result<T, RollcallError>;

/// Where a kick request ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickOutcome {
    /// The player was connected here and has been disconnected.
    Local,
    /// Published for the owning proxy to execute.
    Forwarded,
}

pub struct PresenceRegistry {
    proxy_id: ProxyId,
    store: StoreAccess,
    scripts: BuiltinScripts,
    bus: Arc<EventBus>,
    platform: Arc<dyn ProxyPlatform>,
    cache: PresenceCache,
    staleness: Duration,
}

impl PresenceRegistry {
    pub fn new(
        proxy_id: ProxyId,
        store: StoreAccess,
        scripts: BuiltinScripts,
        bus: Arc<EventBus>,
        platform: Arc<dyn ProxyPlatform>,
        cache_ttl: Duration,
        staleness: Duration,
    ) -> Self {
        Self {
            proxy_id,
            store,
            scripts,
            bus,
            platform,
            cache: PresenceCache::new(cache_ttl),
            staleness,
        }
    }

    pub fn proxy_id(&self) -> &ProxyId {
        &self.proxy_id
    }

    pub fn cache(&self) -> &PresenceCache {
        &self.cache
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Register `uuid` as connected to `proxy` from `ip` and announce it.
    pub async fn record_join(&self, uuid: Uuid, proxy: &ProxyId, ip: IpAddr) -> Result<()> {
        self.attach(uuid, proxy, ip).await?;
        self.cache.invalidate(&uuid);
        let joined_at = self.store.server_time_millis().await?;
        tracing::debug!(uuid = %uuid, proxy = %proxy, "Player joined");

        self.bus
            .publish(BusMessage::Presence(PresenceEvent::join(
                uuid,
                proxy.clone(),
                joined_at,
                ip,
            )))
            .await;
        Ok(())
    }

    pub async fn record_server_change(
        &self,
        uuid: Uuid,
        proxy: &ProxyId,
        new_server: &str,
        old_server: Option<&str>,
    ) -> Result<()> {
        let mut hset = redis::cmd("HSET");
        hset.arg(player_key(&uuid)).arg(fields::SERVER).arg(new_server);
        self.store.query::<()>(&hset).await?;
        self.cache.invalidate(&uuid);
        let changed_at = self.store.server_time_millis().await?;
        tracing::debug!(uuid = %uuid, server = %new_server, "Player changed server");

        self.bus
            .publish(BusMessage::Presence(PresenceEvent::server_change(
                uuid,
                proxy.clone(),
                changed_at,
                new_server,
                old_server.map(str::to_string),
            )))
            .await;
        Ok(())
    }

    /// Mark `uuid` as gone from `proxy`, stamped with the store clock.
    ///
    /// Always restamps, even when the player was not in the proxy's set.
    /// The record is cleared before the set entry is removed.
    /// Returns the last-seen timestamp.
    pub async fn record_leave(&self, uuid: Uuid, proxy: &ProxyId) -> Result<i64> {
        let last_seen = self.store.server_time_millis().await?;
        self.scripts
            .leave
            .invoke::<(), _, _>(&[player_key(&uuid)], &[last_seen])
            .await?;
        self.cache.invalidate(&uuid);

        let mut srem = redis::cmd("SREM");
        srem.arg(proxy_members_key(proxy)).arg(uuid.to_string());
        let removed: i64 = self.store.query(&srem).await?;
        tracing::debug!(uuid = %uuid, proxy = %proxy, was_member = removed > 0, "Player left");

        self.bus
            .publish(BusMessage::Presence(PresenceEvent::leave(
                uuid,
                proxy.clone(),
                last_seen,
            )))
            .await;
        Ok(last_seen)
    }

    /// Disconnect `uuid` wherever it is connected.
    ///
    /// At most once: a forwarded kick is not acknowledged.
    pub async fn kick_player(&self, uuid: Uuid, reason: &str) -> Result<KickOutcome> {
        if self.platform.kick_local(&uuid, reason) {
            tracing::info!(uuid = %uuid, reason = %reason, "Kicked local player");
            return Ok(KickOutcome::Local);
        }

        let requested_at = self.store.server_time_millis().await?;
        self.bus
            .publish(BusMessage::Presence(PresenceEvent::kick(
                uuid,
                self.proxy_id.clone(),
                requested_at,
                reason,
            )))
            .await;
        Ok(KickOutcome::Forwarded)
    }

    pub async fn send_channel_message(&self, channel: &str, message: &str) {
        self.bus
            .publish(BusMessage::Channel(ChannelMessage {
                sender_proxy: self.proxy_id.clone(),
                channel: channel.to_string(),
                message: message.to_string(),
            }))
            .await;
    }

    pub async fn send_proxy_command(&self, target: CommandTarget, command: &str) {
        self.bus
            .publish(BusMessage::Command(ProxyCommand {
                sender_proxy: self.proxy_id.clone(),
                target,
                command: command.to_string(),
            }))
            .await;
    }

    /// Write membership and the online record without announcing anything.
    pub(crate) async fn attach(&self, uuid: Uuid, proxy: &ProxyId, ip: IpAddr) -> Result<()> {
        let mut sadd = redis::cmd("SADD");
        sadd.arg(proxy_members_key(proxy)).arg(uuid.to_string());
        self.store.query::<()>(&sadd).await?;

        self.scripts
            .join
            .invoke::<(), _, _>(&[player_key(&uuid)], &[ip.to_string(), proxy.to_string()])
            .await?;
        Ok(())
    }

    /// Leave cleanup on behalf of `owner`, skipped if another proxy owns the player.
    ///
    /// Announces LEAVE when the record was released. Returns whether it was.
    pub(crate) async fn release(&self, uuid: Uuid, owner: &ProxyId) -> Result<bool> {
        let last_seen = self.store.server_time_millis().await?;
        let released: i64 = self
            .scripts
            .release_owner
            .invoke(&[player_key(&uuid)], &[owner.to_string(), last_seen.to_string()])
            .await?;
        self.cache.invalidate(&uuid);

        if released == 1 {
            self.bus
                .publish(BusMessage::Presence(PresenceEvent::leave(
                    uuid,
                    self.proxy_id.clone(),
                    last_seen,
                )))
                .await;
        }
        Ok(released == 1)
    }

    // ========================================================================
    // Bus input
    // ========================================================================

    /// Fold a presence event from the bus into local state.
    ///
    /// Executes a KICK addressed to a player connected here.
    pub fn apply_remote(&self, event: &PresenceEvent) {
        self.cache.apply(event);

        if let PresenceChange::Kick { reason } = &event.change {
            if self.platform.kick_local(&event.uuid, reason) {
                tracing::info!(
                    uuid = %event.uuid,
                    requested_by = %event.sender_proxy,
                    reason = %reason,
                    "Executed forwarded kick"
                );
            }
        }
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Current presence of `uuid`, local platform first.
    async fn presence(&self, uuid: &Uuid) -> Result<CachedPresence> {
        if let Some(player) = self.platform.local_player(uuid) {
            return Ok(CachedPresence {
                proxy: Some(self.proxy_id.clone()),
                server: player.server,
                ip: Some(player.ip),
                last_online: LastOnline::Online,
                as_of: None,
            });
        }

        if let Some(cached) = self.cache.get(uuid) {
            return Ok(cached);
        }

        let record = self.fetch_record(uuid).await?;
        let presence = CachedPresence::from_record(&record);
        self.cache.insert(*uuid, presence.clone());
        Ok(presence)
    }

    /// Raw `player:<uuid>` record from the store.
    pub async fn fetch_record(&self, uuid: &Uuid) -> Result<PlayerRecord> {
        let mut hgetall = redis::cmd("HGETALL");
        hgetall.arg(player_key(uuid));
        let hash: HashMap<String, String> = self.store.query(&hgetall).await?;
        PlayerRecord::from_hash(*uuid, hash)
    }

    pub async fn query_last_online(&self, uuid: &Uuid) -> Result<LastOnline> {
        Ok(self.presence(uuid).await?.last_online)
    }

    pub async fn query_owner_proxy(&self, uuid: &Uuid) -> Result<Option<ProxyId>> {
        let presence = self.presence(uuid).await?;
        Ok(presence.proxy.filter(|_| presence.last_online.is_online()))
    }

    pub async fn query_server(&self, uuid: &Uuid) -> Result<Option<String>> {
        let presence = self.presence(uuid).await?;
        Ok(presence.server.filter(|_| presence.last_online.is_online()))
    }

    pub async fn query_ip(&self, uuid: &Uuid) -> Result<Option<IpAddr>> {
        let presence = self.presence(uuid).await?;
        Ok(presence.ip.filter(|_| presence.last_online.is_online()))
    }

    pub async fn live_proxies(&self) -> Result<Vec<ProxyId>> {
        Ok(heartbeat::live_proxies(&self.store, self.staleness).await?)
    }

    pub async fn players_on_proxy(&self, proxy: &ProxyId) -> Result<HashSet<Uuid>> {
        let mut smembers = redis::cmd("SMEMBERS");
        smembers.arg(proxy_members_key(proxy));
        let members: Vec<String> = self.store.query(&smembers).await?;
        Ok(parse_members(proxy, members))
    }

    /// Membership of every live proxy.
    pub async fn live_memberships(&self) -> Result<HashMap<ProxyId, HashSet<Uuid>>> {
        let proxies = self.live_proxies().await?;
        let cmds: Vec<Cmd> = proxies
            .iter()
            .map(|proxy| {
                let mut smembers = redis::cmd("SMEMBERS");
                smembers.arg(proxy_members_key(proxy));
                smembers
            })
            .collect();
        let sets: Vec<Vec<String>> = self.store.query_all(&cmds).await?;

        Ok(proxies
            .into_iter()
            .zip(sets)
            .map(|(proxy, members)| {
                let parsed = parse_members(&proxy, members);
                (proxy, parsed)
            })
            .collect())
    }

    /// Union of the members of every live proxy.
    pub async fn network_players(&self) -> Result<HashSet<Uuid>> {
        Ok(self
            .live_memberships()
            .await?
            .into_values()
            .flatten()
            .collect())
    }

    pub async fn total_network_players(&self) -> Result<u64> {
        let cmds: Vec<Cmd> = self
            .live_proxies()
            .await?
            .iter()
            .map(|proxy| {
                let mut scard = redis::cmd("SCARD");
                scard.arg(proxy_members_key(proxy));
                scard
            })
            .collect();
        let counts: Vec<u64> = self.store.query_all(&cmds).await?;
        let total = counts.into_iter().sum();
        crate::metrics::set_network_players(total);
        Ok(total)
    }

    /// Online players grouped by backend server. Players not yet on a server are left out.
    pub async fn server_breakdown(&self) -> Result<HashMap<String, HashSet<Uuid>>> {
        let players: Vec<Uuid> = self.network_players().await?.into_iter().collect();
        let cmds: Vec<Cmd> = players
            .iter()
            .map(|uuid| {
                let mut hget = redis::cmd("HGET");
                hget.arg(player_key(uuid)).arg(fields::SERVER);
                hget
            })
            .collect();
        let servers: Vec<Option<String>> = self.store.query_all(&cmds).await?;

        let mut breakdown: HashMap<String, HashSet<Uuid>> = HashMap::new();
        for (uuid, server) in players.into_iter().zip(servers) {
            if let Some(server) = server {
                breakdown.entry(server).or_default().insert(uuid);
            }
        }
        Ok(breakdown)
    }

    pub(crate) fn store(&self) -> &StoreAccess {
        &self.store
    }

    pub(crate) fn platform(&self) -> &Arc<dyn ProxyPlatform> {
        &self.platform
    }
}

/// Decode set members, dropping anything that is not a uuid.
pub(crate) fn parse_members(proxy: &ProxyId, members: Vec<String>) -> HashSet<Uuid> {
    members
        .into_iter()
        .filter_map(|raw| match Uuid::parse_str(&raw) {
            Ok(uuid) => Some(uuid),
            Err(e) => {
                tracing::warn!(proxy = %proxy, member = %raw, error = %e, "Ignoring malformed set member");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_members_skips_garbage() {
        let proxy = ProxyId::new("a").unwrap();
        let uuid = Uuid::new_v4();
        let parsed = parse_members(&proxy, vec![uuid.to_string(), "not-a-uuid".into()]);
        assert_eq!(parsed.len(), 1);
        assert!(parsed.contains(&uuid));
    }
}
