//! Shared harness: one Redis container per test binary and an in-memory platform.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rollcall_core::{LocalPlayer, NetworkNotification, ProxyPlatform};
use rollcall_server::identity::ExternalLookupError;
use rollcall_server::{AppConfig, IdentityAuthority, RollcallContext};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::Redis;
use tokio::sync::OnceCell;
use uuid::Uuid;

static SHARED_REDIS: OnceCell<(ContainerAsync<Redis>, String)> = OnceCell::const_new();

pub async fn redis_url() -> String {
    let (_, url) = SHARED_REDIS
        .get_or_init(|| async {
            let container = Redis::default()
                .start()
                .await
                .expect("start redis container");
            let host_port = container.get_host_port_ipv4(6379).await.expect("get port");
            let url = format!("redis://127.0.0.1:{}", host_port);
            (container, url)
        })
        .await;
    url.clone()
}

/// Config for a proxy with a unique id, pointing at the shared container.
pub async fn node_config(prefix: &str) -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.redis.url = redis_url().await;
    cfg.redis.retry_backoff_ms = 50;
    cfg.proxy.id = format!("{prefix}-{}", &Uuid::new_v4().simple().to_string()[..8]);
    cfg.identity.purge_interval_secs = 0;
    cfg
}

pub async fn start_node(prefix: &str) -> (Arc<RollcallContext>, Arc<FakePlatform>) {
    let platform = Arc::new(FakePlatform::default());
    let ctx = RollcallContext::start_with_authority(
        node_config(prefix).await,
        platform.clone(),
        Arc::new(NoAuthority),
    )
    .await
    .expect("start node");
    (ctx, platform)
}

pub fn player(name: &str, server: Option<&str>) -> LocalPlayer {
    LocalPlayer {
        uuid: Uuid::new_v4(),
        name: name.to_string(),
        server: server.map(str::to_string),
        ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)),
    }
}

/// Connect `player` the way an adapter would: platform first, then the registry.
pub async fn connect(ctx: &RollcallContext, platform: &FakePlatform, player: LocalPlayer) {
    platform.add(player.clone());
    ctx.player_connected(player).await.expect("join task");
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..40 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

/// Platform whose connected players are whatever the test says.
#[derive(Default)]
pub struct FakePlatform {
    players: Mutex<HashMap<Uuid, LocalPlayer>>,
    pub kicked: Mutex<Vec<(Uuid, String)>>,
    pub commands: Mutex<Vec<String>>,
    pub notifications: Mutex<Vec<NetworkNotification>>,
}

impl FakePlatform {
    pub fn add(&self, player: LocalPlayer) {
        self.players.lock().unwrap().insert(player.uuid, player);
    }

    pub fn remove(&self, uuid: &Uuid) {
        self.players.lock().unwrap().remove(uuid);
    }

    pub fn saw(&self, predicate: impl Fn(&NetworkNotification) -> bool) -> bool {
        self.notifications.lock().unwrap().iter().any(predicate)
    }
}

impl ProxyPlatform for FakePlatform {
    fn local_player(&self, uuid: &Uuid) -> Option<LocalPlayer> {
        self.players.lock().unwrap().get(uuid).cloned()
    }

    fn local_player_by_name(&self, name: &str) -> Option<LocalPlayer> {
        self.players
            .lock()
            .unwrap()
            .values()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    fn local_players(&self) -> Vec<LocalPlayer> {
        self.players.lock().unwrap().values().cloned().collect()
    }

    fn kick_local(&self, uuid: &Uuid, reason: &str) -> bool {
        if self.players.lock().unwrap().remove(uuid).is_some() {
            self.kicked.lock().unwrap().push((*uuid, reason.to_string()));
            true
        } else {
            false
        }
    }

    fn run_command(&self, command: &str) {
        self.commands.lock().unwrap().push(command.to_string());
    }

    fn notify(&self, notification: NetworkNotification) {
        self.notifications.lock().unwrap().push(notification);
    }
}

/// Authority that knows nobody.
pub struct NoAuthority;

#[async_trait]
impl IdentityAuthority for NoAuthority {
    async fn lookup_uuid(&self, _name: &str) -> Result<Option<(Uuid, String)>, ExternalLookupError> {
        Ok(None)
    }

    async fn lookup_name(&self, _uuid: &Uuid) -> Result<Option<String>, ExternalLookupError> {
        Ok(None)
    }
}
