use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

use rollcall_core::{ProxyId, RollcallError};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub proxy: ProxySettings,
    /// Shared store connection
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    /// Name <-> uuid resolution
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config build error: {0}")]
    Build(String),

    #[error("config deserialize error: {0}")]
    Deserialize(String),

    #[error("{0}")]
    Invalid(String),
}

impl From<ConfigError> for RollcallError {
    fn from(err: ConfigError) -> Self {
        RollcallError::configuration(err.to_string())
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.proxy.id.is_empty() {
            ProxyId::new(self.proxy.id.as_str())
                .map_err(|e| ConfigError::Invalid(format!("proxy.id: {e}")))?;
        }
        // Redis validations
        match self.redis.mode {
            RedisMode::Single => {
                if self.redis.url.is_empty() {
                    return Err(ConfigError::Invalid("redis.url must not be empty".into()));
                }
            }
            RedisMode::Cluster => {
                if self.redis.cluster_nodes.is_empty() {
                    return Err(ConfigError::Invalid(
                        "redis.mode=cluster requires redis.cluster_nodes".into(),
                    ));
                }
            }
        }
        if self.redis.pool_size == 0 {
            return Err(ConfigError::Invalid("redis.pool_size must be > 0".into()));
        }
        if self.redis.timeout_ms == 0 {
            return Err(ConfigError::Invalid("redis.timeout_ms must be > 0".into()));
        }
        // Presence validations
        if self.presence.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "presence.heartbeat_interval_secs must be > 0".into(),
            ));
        }
        if self.presence.staleness_secs <= self.presence.heartbeat_interval_secs {
            return Err(ConfigError::Invalid(
                "presence.staleness_secs must be greater than presence.heartbeat_interval_secs"
                    .into(),
            ));
        }
        if self.presence.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "presence.sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.presence.worker_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "presence.worker_concurrency must be > 0".into(),
            ));
        }
        // Identity validations
        if self.identity.cache_ttl_secs == 0 {
            return Err(ConfigError::Invalid("identity.cache_ttl_secs must be > 0".into()));
        }
        if self.identity.authority_url.is_empty() {
            return Err(ConfigError::Invalid(
                "identity.authority_url must not be empty".into(),
            ));
        }
        // Logging validation
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "logging.level must be one of {valid_levels:?}"
            )));
        }
        // Metrics validation
        if self.metrics.enabled {
            self.metrics.socket_addr()?;
        }
        Ok(())
    }

    /// The configured proxy id, or a freshly generated one when none was set.
    pub fn resolve_proxy_id(&self) -> Result<ProxyId, RollcallError> {
        if self.proxy.id.trim().is_empty() {
            let generated = uuid::Uuid::new_v4().to_string();
            tracing::warn!(
                proxy = %generated,
                "proxy.id is not set, generated a random id; set it to keep a stable identity"
            );
            return ProxyId::new(generated);
        }
        ProxyId::new(self.proxy.id.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Unique id of this proxy in the fleet. Empty means "generate one".
    #[serde(default)]
    pub id: String,
    /// Whether players are authenticated against the identity authority
    #[serde(default = "default_online_mode")]
    pub online_mode: bool,
}

fn default_online_mode() -> bool {
    true
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            id: String::new(),
            online_mode: default_online_mode(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RedisMode {
    Single,
    Cluster,
}

impl std::fmt::Display for RedisMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RedisMode::Single => write!(f, "single"),
            RedisMode::Cluster => write!(f, "cluster"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Single node or cluster. Must match the server's `cluster_enabled`.
    #[serde(default = "default_redis_mode")]
    pub mode: RedisMode,

    /// Redis connection URL (e.g., "redis://localhost:6379"), used in single mode
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Seed node URLs, used in cluster mode
    #[serde(default)]
    pub cluster_nodes: Vec<String>,

    /// Connection pool size
    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    /// Connection timeout in milliseconds
    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    /// Pause before the single retry of a failed operation
    #[serde(default = "default_redis_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_redis_mode() -> RedisMode {
    RedisMode::Single
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_redis_retry_backoff_ms() -> u64 {
    200
}

impl RedisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// URL used for the dedicated pub/sub connection.
    ///
    /// Cluster nodes relay published messages to every node, so any seed will do.
    pub fn pubsub_url(&self) -> Option<&str> {
        match self.mode {
            RedisMode::Single => Some(self.url.as_str()),
            RedisMode::Cluster => self.cluster_nodes.first().map(String::as_str),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            mode: default_redis_mode(),
            url: default_redis_url(),
            cluster_nodes: Vec::new(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            retry_backoff_ms: default_redis_retry_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// A proxy whose last heartbeat is older than this is considered dead
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,

    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Lifetime of entries in the per-process presence cache
    #[serde(default = "default_presence_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Maximum number of registry operations submitted by host threads running at once
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

fn default_staleness_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_presence_cache_ttl_secs() -> u64 {
    3600 // 1 hour
}

fn default_worker_concurrency() -> usize {
    64
}

impl PresenceConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            staleness_secs: default_staleness_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            cache_ttl_secs: default_presence_cache_ttl_secs(),
            worker_concurrency: default_worker_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Lifetime of a resolved name <-> uuid association
    #[serde(default = "default_identity_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// How often expired entries are purged from the shared cache. 0 disables the purge.
    #[serde(default = "default_identity_purge_interval_secs")]
    pub purge_interval_secs: u64,

    /// Base URL of the Mojang-compatible profile API
    #[serde(default = "default_authority_url")]
    pub authority_url: String,

    /// Request timeout against the authority in milliseconds
    #[serde(default = "default_authority_timeout_ms")]
    pub authority_timeout_ms: u64,
}

fn default_identity_cache_ttl_secs() -> u64 {
    3 * 24 * 3600 // 3 days
}

fn default_identity_purge_interval_secs() -> u64 {
    3600
}

fn default_authority_url() -> String {
    "https://api.mojang.com".to_string()
}

fn default_authority_timeout_ms() -> u64 {
    5000
}

impl IdentityConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn purge_interval(&self) -> Option<Duration> {
        (self.purge_interval_secs > 0).then(|| Duration::from_secs(self.purge_interval_secs))
    }

    pub fn authority_timeout(&self) -> Duration {
        Duration::from_millis(self.authority_timeout_ms)
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_identity_cache_ttl_secs(),
            purge_interval_secs: default_identity_purge_interval_secs(),
            authority_url: default_authority_url(),
            authority_timeout_ms: default_authority_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}
fn default_log_level() -> String {
    "info".into()
}
impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Address of the Prometheus scrape endpoint
    #[serde(default = "default_metrics_listen_addr")]
    pub listen_addr: String,
}

fn default_metrics_listen_addr() -> String {
    "0.0.0.0:9464".into()
}

impl MetricsConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("metrics.listen_addr: {e}")))
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_metrics_listen_addr(),
        }
    }
}

pub mod loader {
    use super::{AppConfig, ConfigError};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_PATH: &str = "rollcall.toml";

    pub fn load_config(path: Option<&str>) -> Result<AppConfig, ConfigError> {
        let mut builder = Config::builder();
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., ROLLCALL__REDIS__URL=redis://cache:6379
        builder = builder.add_source(
            Environment::with_prefix("ROLLCALL")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("redis.cluster_nodes"),
        );
        let cfg = builder
            .build()
            .map_err(|e| ConfigError::Build(e.to_string()))?;
        let merged: AppConfig = cfg
            .try_deserialize()
            .map_err(|e| ConfigError::Deserialize(e.to_string()))?;
        merged.validate()?;
        Ok(merged)
    }
}
