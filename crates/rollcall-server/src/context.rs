//! Process bootstrap and lifecycle.
//!
//! [`RollcallContext::start`] builds every component, verifies the store and
//! launches the background tasks. Components receive what they need
//! explicitly; only a platform adapter that cannot thread the context through
//! its host framework should reach for [`install`] / [`current`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use rollcall_core::model::proxy_members_key;
use rollcall_core::{LocalPlayer, ProxyId, ProxyPlatform, RollcallError};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::bus::{BusHandler, BusSubscriber, EventBus};
use crate::config::AppConfig;
use crate::heartbeat::{HeartbeatTask, LivenessTable, fetch_heartbeats};
use crate::identity::{IdentityAuthority, IdentityResolver, MojangAuthority};
use crate::presence::PresenceRegistry;
use crate::scripts::{BuiltinScripts, ScriptCache};
use crate::store::StoreAccess;
use crate::sweeper::ReconciliationSweeper;
use crate::worker::WorkerPool;

static CURRENT: OnceLock<Arc<RollcallContext>> = OnceLock::new();

/// Make `context` discoverable through [`current`]. Returns `false` if one was already installed.
pub fn install(context: Arc<RollcallContext>) -> bool {
    CURRENT.set(context).is_ok()
}

pub fn current() -> Option<Arc<RollcallContext>> {
    CURRENT.get().cloned()
}

pub struct RollcallContext {
    config: AppConfig,
    proxy_id: ProxyId,
    store: StoreAccess,
    bus: Arc<EventBus>,
    registry: Arc<PresenceRegistry>,
    identity: Arc<IdentityResolver>,
    liveness: Arc<LivenessTable>,
    heartbeat: Arc<HeartbeatTask>,
    sweeper: Arc<ReconciliationSweeper>,
    workers: WorkerPool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl RollcallContext {
    /// Start with the HTTP identity authority from `config.identity`.
    pub async fn start(
        config: AppConfig,
        platform: Arc<dyn ProxyPlatform>,
    ) -> Result<Arc<Self>, RollcallError> {
        let authority = MojangAuthority::new(
            config.identity.authority_url.as_str(),
            config.identity.authority_timeout(),
        )?;
        Self::start_with_authority(config, platform, Arc::new(authority)).await
    }

    pub async fn start_with_authority(
        config: AppConfig,
        platform: Arc<dyn ProxyPlatform>,
        authority: Arc<dyn IdentityAuthority>,
    ) -> Result<Arc<Self>, RollcallError> {
        config.validate()?;
        let proxy_id = config.resolve_proxy_id()?;
        let pubsub_url = config
            .redis
            .pubsub_url()
            .ok_or_else(|| RollcallError::configuration("no Redis node to subscribe on"))?
            .to_string();

        let store = StoreAccess::connect(&config.redis).await?;
        store.verify_server().await?;
        ensure_unique_proxy_id(&store, &proxy_id, config.presence.staleness()).await?;

        let scripts = BuiltinScripts::load(&ScriptCache::new(store.clone())).await?;
        let bus = Arc::new(EventBus::new(store.clone(), proxy_id.clone()));
        let liveness = Arc::new(LivenessTable::new());

        let registry = Arc::new(PresenceRegistry::new(
            proxy_id.clone(),
            store.clone(),
            scripts,
            Arc::clone(&bus),
            Arc::clone(&platform),
            config.presence.cache_ttl(),
            config.presence.staleness(),
        ));
        let identity = Arc::new(IdentityResolver::new(
            store.clone(),
            Arc::clone(&platform),
            authority,
            config.identity.cache_ttl(),
            config.proxy.online_mode,
        ));

        let leftovers = release_members(&registry, &proxy_id).await?;
        if leftovers > 0 {
            tracing::warn!(proxy = %proxy_id, released = leftovers, "Released players left over from a previous run");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        let handler = Arc::new(BusHandler::new(
            proxy_id.clone(),
            bus.instance(),
            Arc::clone(&registry),
            Arc::clone(&identity),
            Arc::clone(&liveness),
            Arc::clone(&platform),
        ));
        let subscriber = Arc::new(BusSubscriber::new(pubsub_url, handler));
        let mut ready = subscriber.ready();
        tasks.push(tokio::spawn(subscriber.run(shutdown_rx.clone())));
        let subscribed = matches!(
            tokio::time::timeout(config.redis.timeout(), ready.wait_for(|s| *s)).await,
            Ok(Ok(_))
        );
        if !subscribed {
            tracing::warn!("Bus subscription not ready yet, continuing; it keeps retrying in the background");
        }

        let heartbeat = Arc::new(HeartbeatTask::new(
            proxy_id.clone(),
            store.clone(),
            Arc::clone(&bus),
            Arc::clone(&platform),
            Arc::clone(&liveness),
        ));
        // Be visible as live before anyone sweeps.
        heartbeat.beat().await?;
        tasks.push(
            Arc::clone(&heartbeat)
                .start(config.presence.heartbeat_interval(), shutdown_rx.clone()),
        );

        let sweeper = Arc::new(ReconciliationSweeper::new(
            Arc::clone(&registry),
            Arc::clone(&liveness),
            config.presence.staleness(),
        ));
        tasks.push(
            Arc::clone(&sweeper).start(config.presence.sweep_interval(), shutdown_rx.clone()),
        );

        if let Some(every) = config.identity.purge_interval() {
            tasks.push(Arc::clone(&identity).start_purge_task(every, shutdown_rx.clone()));
        }

        let workers = WorkerPool::on_current_runtime(config.presence.worker_concurrency);

        tracing::info!(
            proxy = %proxy_id,
            mode = %store.mode(),
            online_mode = config.proxy.online_mode,
            "Rollcall started"
        );

        Ok(Arc::new(Self {
            config,
            proxy_id,
            store,
            bus,
            registry,
            identity,
            liveness,
            heartbeat,
            sweeper,
            workers,
            shutdown_tx,
            tasks: Mutex::new(tasks),
            stopped: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn proxy_id(&self) -> &ProxyId {
        &self.proxy_id
    }

    pub fn store(&self) -> &StoreAccess {
        &self.store
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.registry
    }

    pub fn identity(&self) -> &Arc<IdentityResolver> {
        &self.identity
    }

    pub fn liveness(&self) -> &Arc<LivenessTable> {
        &self.liveness
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatTask> {
        &self.heartbeat
    }

    pub fn sweeper(&self) -> &Arc<ReconciliationSweeper> {
        &self.sweeper
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    // ========================================================================
    // Adapter entry points, safe to call from host threads
    // ========================================================================

    /// A player finished logging in to this proxy.
    pub fn player_connected(&self, player: LocalPlayer) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let identity = Arc::clone(&self.identity);
        let proxy = self.proxy_id.clone();
        self.workers.submit(async move {
            identity.remember(&player.name, player.uuid).await;
            if let Err(e) = registry.record_join(player.uuid, &proxy, player.ip).await {
                tracing::error!(uuid = %player.uuid, error = %e, "Failed to record join");
                return;
            }
            if let Some(server) = player.server.as_deref() {
                if let Err(e) = registry
                    .record_server_change(player.uuid, &proxy, server, None)
                    .await
                {
                    tracing::error!(uuid = %player.uuid, error = %e, "Failed to record initial server");
                }
            }
        })
    }

    pub fn player_switched_server(
        &self,
        uuid: Uuid,
        new_server: String,
        old_server: Option<String>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let proxy = self.proxy_id.clone();
        self.workers.submit(async move {
            if let Err(e) = registry
                .record_server_change(uuid, &proxy, &new_server, old_server.as_deref())
                .await
            {
                tracing::error!(uuid = %uuid, error = %e, "Failed to record server change");
            }
        })
    }

    pub fn player_disconnected(&self, uuid: Uuid) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let proxy = self.proxy_id.clone();
        self.workers.submit(async move {
            if let Err(e) = registry.record_leave(uuid, &proxy).await {
                tracing::error!(uuid = %uuid, error = %e, "Failed to record leave");
            }
        })
    }

    /// Stop background tasks, withdraw the heartbeat and release every player still attached here.
    ///
    /// Calling it more than once is harmless.
    pub async fn shutdown(&self) -> Result<(), RollcallError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(proxy = %self.proxy_id, "Shutting down");

        self.shutdown_tx.send_replace(true);
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                tracing::warn!("Background task did not stop in time");
            }
        }

        self.heartbeat.remove().await?;
        let released = release_members(&self.registry, &self.proxy_id).await?;
        tracing::info!(proxy = %self.proxy_id, released = released, "Shutdown complete");
        Ok(())
    }
}

/// Refuse to start while another live process heartbeats under the same id.
async fn ensure_unique_proxy_id(
    store: &StoreAccess,
    proxy_id: &ProxyId,
    staleness: Duration,
) -> Result<(), RollcallError> {
    let now = store.server_time_millis().await?;
    let existing = fetch_heartbeats(store)
        .await?
        .into_iter()
        .find(|record| &record.proxy_id == proxy_id);

    match existing {
        Some(record) if !record.is_stale_at(now, staleness) => {
            Err(RollcallError::configuration(format!(
                "proxy id '{proxy_id}' is already in use by a live proxy (last heartbeat {} ms ago)",
                now - record.timestamp
            )))
        }
        _ => Ok(()),
    }
}

/// Release every member `proxy` still owns and drop it from the set.
///
/// A member whose release fails stays in the set for the sweeper.
async fn release_members(
    registry: &PresenceRegistry,
    proxy: &ProxyId,
) -> Result<usize, RollcallError> {
    let mut released = 0;
    for uuid in registry.players_on_proxy(proxy).await? {
        match registry.release(uuid, proxy).await {
            Ok(true) => released += 1,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(uuid = %uuid, error = %e, "Failed to release player");
                continue;
            }
        }
        let mut srem = redis::cmd("SREM");
        srem.arg(proxy_members_key(proxy)).arg(uuid.to_string());
        registry.store().query::<()>(&srem).await?;
    }
    Ok(released)
}
