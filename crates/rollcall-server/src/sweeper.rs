//! Background repair of presence state left behind by dead proxies.
//!
//! Each cycle:
//! 1. Reads every heartbeat against the store clock and splits proxies into live and dead
//! 2. For each dead proxy: releases every member that no live proxy holds, then
//!    deletes the set and the heartbeat once every release went through
//! 3. Reconciles this proxy's own set with the players the platform reports
//! 4. Releases records this process has seen online whose owner's set no longer
//!    holds the player
//!
//! Every step is per-uuid and idempotent, so several proxies may sweep at once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use redis::Cmd;
use rollcall_core::model::{HEARTBEATS_KEY, fields, player_key, proxy_members_key};
use rollcall_core::{NetworkNotification, ProxyId, RollcallError};
use tokio::sync::watch;
use uuid::Uuid;

use crate::heartbeat::{LivenessTable, fetch_heartbeats};
use crate::metrics;
use crate::presence::{PresenceRegistry, parse_members};

/// What one sweep cycle changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub dead_proxies: Vec<ProxyId>,
    /// Players whose record was cleared.
    pub released: usize,
    /// Local players missing from this proxy's set and written back.
    pub reattached: usize,
    /// Set entries of this proxy dropped because the player is not connected here.
    pub detached: usize,
}

pub struct ReconciliationSweeper {
    registry: Arc<PresenceRegistry>,
    liveness: Arc<LivenessTable>,
    staleness: Duration,
}

impl ReconciliationSweeper {
    pub fn new(
        registry: Arc<PresenceRegistry>,
        liveness: Arc<LivenessTable>,
        staleness: Duration,
    ) -> Self {
        Self {
            registry,
            liveness,
            staleness,
        }
    }

    pub async fn sweep_once(&self) -> Result<SweepReport, RollcallError> {
        let store = self.registry.store();
        let now = store.server_time_millis().await?;
        let (live, dead): (Vec<_>, Vec<_>) = fetch_heartbeats(store)
            .await?
            .into_iter()
            .partition(|record| !record.is_stale_at(now, self.staleness));

        let live: Vec<ProxyId> = live.into_iter().map(|r| r.proxy_id).collect();
        metrics::set_live_proxies(live.len());

        let mut memberships = self.memberships(&live).await?;
        let own = self.registry.proxy_id().clone();
        // This proxy may not have heartbeated yet.
        if !memberships.contains_key(&own) {
            let members = self.registry.players_on_proxy(&own).await?;
            memberships.insert(own.clone(), members);
        }
        let held: HashSet<Uuid> = memberships.values().flatten().copied().collect();

        let mut report = SweepReport::default();
        for record in dead {
            let dead_proxy = record.proxy_id;
            if dead_proxy == own {
                continue;
            }
            report.released += self.clean_dead_proxy(&dead_proxy, &held).await?;
            report.dead_proxies.push(dead_proxy);
        }

        self.correct_local(&own, &memberships, &mut report).await?;
        self.release_orphans(&memberships, &mut report).await?;

        if report.released > 0 {
            metrics::record_sweep_cleaned(report.released);
        }
        Ok(report)
    }

    async fn memberships(
        &self,
        proxies: &[ProxyId],
    ) -> Result<HashMap<ProxyId, HashSet<Uuid>>, RollcallError> {
        let cmds: Vec<Cmd> = proxies
            .iter()
            .map(|proxy| {
                let mut smembers = redis::cmd("SMEMBERS");
                smembers.arg(proxy_members_key(proxy));
                smembers
            })
            .collect();
        let sets: Vec<Vec<String>> = self.registry.store().query_all(&cmds).await?;
        Ok(proxies
            .iter()
            .cloned()
            .zip(sets)
            .map(|(proxy, members)| {
                let parsed = parse_members(&proxy, members);
                (proxy, parsed)
            })
            .collect())
    }

    /// Remove every trace of `dead` and release its players nobody else holds.
    async fn clean_dead_proxy(
        &self,
        dead: &ProxyId,
        held: &HashSet<Uuid>,
    ) -> Result<usize, RollcallError> {
        let store = self.registry.store();
        let members = self.registry.players_on_proxy(dead).await?;
        tracing::warn!(proxy = %dead, members = members.len(), "Cleaning up after dead proxy");

        let mut released = 0;
        let mut failed = 0;
        for uuid in members.into_iter().filter(|uuid| !held.contains(uuid)) {
            match self.registry.release(uuid, dead).await {
                Ok(true) => released += 1,
                Ok(false) => {
                    tracing::debug!(uuid = %uuid, proxy = %dead, "Player owned elsewhere, keeping record");
                }
                Err(e) => {
                    failed += 1;
                    tracing::warn!(uuid = %uuid, proxy = %dead, error = %e, "Failed to release player");
                }
            }
        }

        // The set and heartbeat are how the next cycle finds what is left.
        if failed > 0 {
            tracing::warn!(proxy = %dead, failed = failed, "Dead proxy only partly cleaned, retrying next cycle");
            return Ok(released);
        }

        let mut del = redis::cmd("DEL");
        del.arg(proxy_members_key(dead));
        store.query::<()>(&del).await?;

        let mut hdel = redis::cmd("HDEL");
        hdel.arg(HEARTBEATS_KEY).arg(dead.as_str());
        store.query::<()>(&hdel).await?;

        if self.liveness.forget(dead) {
            self.registry
                .platform()
                .notify(NetworkNotification::ProxyLost(dead.clone()));
        }
        Ok(released)
    }

    /// Make this proxy's set and records agree with what the platform reports.
    async fn correct_local(
        &self,
        own: &ProxyId,
        memberships: &HashMap<ProxyId, HashSet<Uuid>>,
        report: &mut SweepReport,
    ) -> Result<(), RollcallError> {
        let store = self.registry.store();
        let empty = HashSet::new();
        let own_set = memberships.get(own).unwrap_or(&empty);
        let local: HashMap<Uuid, _> = self
            .registry
            .platform()
            .local_players()
            .into_iter()
            .map(|player| (player.uuid, player))
            .collect();

        // Connected here but missing from our set.
        for (uuid, player) in local.iter().filter(|(uuid, _)| !own_set.contains(uuid)) {
            tracing::warn!(uuid = %uuid, "Local player missing from proxy set, re-registering");
            self.reattach(*uuid, own, player.ip, player.server.as_deref())
                .await?;
            report.reattached += 1;
        }

        // In our set but not connected here. Release before dropping the entry.
        for uuid in own_set.iter().filter(|uuid| !local.contains_key(uuid)) {
            let elsewhere = memberships
                .iter()
                .any(|(proxy, members)| proxy != own && members.contains(uuid));
            if elsewhere {
                tracing::debug!(uuid = %uuid, "Stale set entry, player is on another proxy");
            } else if self.registry.release(*uuid, own).await? {
                report.released += 1;
            }

            let mut srem = redis::cmd("SREM");
            srem.arg(proxy_members_key(own)).arg(uuid.to_string());
            store.query::<()>(&srem).await?;
            report.detached += 1;
        }

        // Connected here, in our set, but the record names another owner.
        let checked: Vec<Uuid> = local
            .keys()
            .filter(|uuid| own_set.contains(uuid))
            .copied()
            .collect();
        let cmds: Vec<Cmd> = checked
            .iter()
            .map(|uuid| {
                let mut hget = redis::cmd("HGET");
                hget.arg(player_key(uuid)).arg(fields::PROXY);
                hget
            })
            .collect();
        let owners: Vec<Option<String>> = store.query_all(&cmds).await?;
        for (uuid, owner) in checked.into_iter().zip(owners) {
            if owner.as_deref() == Some(own.as_str()) {
                continue;
            }
            tracing::warn!(uuid = %uuid, recorded = ?owner, "Owner mismatch, reclaiming record");
            if let Some(player) = local.get(&uuid) {
                self.reattach(uuid, own, player.ip, player.server.as_deref())
                    .await?;
                report.reattached += 1;
            }
        }
        Ok(())
    }

    /// Clear records that name an owner whose set does not hold the player.
    ///
    /// Candidates come from the presence cache; each one is confirmed against the store first.
    async fn release_orphans(
        &self,
        memberships: &HashMap<ProxyId, HashSet<Uuid>>,
        report: &mut SweepReport,
    ) -> Result<(), RollcallError> {
        let store = self.registry.store();
        let platform = self.registry.platform();
        let candidates: Vec<(Uuid, ProxyId)> = self
            .registry
            .cache()
            .online_owners()
            .into_iter()
            .filter(|(uuid, owner)| {
                !memberships.get(owner).is_some_and(|members| members.contains(uuid))
                    && platform.local_player(uuid).is_none()
            })
            .collect();

        for (uuid, owner) in candidates {
            let mut hget = redis::cmd("HGET");
            hget.arg(player_key(&uuid)).arg(fields::PROXY);
            let recorded: Option<String> = store.query(&hget).await?;
            if recorded.as_deref() != Some(owner.as_str()) {
                self.registry.cache().invalidate(&uuid);
                continue;
            }

            // Ownership is written to the set before the record, so this is current.
            let mut sismember = redis::cmd("SISMEMBER");
            sismember.arg(proxy_members_key(&owner)).arg(uuid.to_string());
            if store.query::<bool>(&sismember).await? {
                continue;
            }

            tracing::warn!(uuid = %uuid, owner = %owner, "Record names an owner that does not hold the player, releasing");
            if self.registry.release(uuid, &owner).await? {
                report.released += 1;
            }
        }
        Ok(())
    }

    async fn reattach(
        &self,
        uuid: Uuid,
        own: &ProxyId,
        ip: std::net::IpAddr,
        server: Option<&str>,
    ) -> Result<(), RollcallError> {
        self.registry.attach(uuid, own, ip).await?;
        if let Some(server) = server {
            let mut hset = redis::cmd("HSET");
            hset.arg(player_key(&uuid)).arg(fields::SERVER).arg(server);
            self.registry.store().query::<()>(&hset).await?;
        }
        self.registry.cache().invalidate(&uuid);
        Ok(())
    }

    pub fn start(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(interval_secs = every.as_secs(), "Reconciliation sweeper started");
            let mut ticker = tokio::time::interval(every);
            // The first tick fires immediately; give heartbeats a chance to land first.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.sweep_once().await {
                            Ok(report) if report != SweepReport::default() => {
                                tracing::info!(
                                    dead = report.dead_proxies.len(),
                                    released = report.released,
                                    reattached = report.reattached,
                                    detached = report.detached,
                                    "Sweep repaired presence state"
                                );
                            }
                            Ok(_) => tracing::trace!("Sweep found nothing to repair"),
                            Err(e) => tracing::warn!(error = %e, "Sweep failed, retrying next cycle"),
                        }
                    }
                    result = shutdown.changed() => {
                        if result.is_err() || *shutdown.borrow() {
                            tracing::debug!("Reconciliation sweeper shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }
}
