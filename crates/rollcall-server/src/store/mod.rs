//! Access to the shared store, independent of topology.
//!
//! Callers hand in a [`redis::Cmd`] and never branch on single node vs cluster.
//! Every operation gets at most one retry, after a fixed backoff, when the
//! failure looks like a connectivity problem. Multi-key reads fan out as
//! independent commands so they never cross hash slots.

pub mod backend;

use std::time::Duration;

use futures_util::future::try_join_all;
use redis::{Cmd, FromRedisValue};
use rollcall_core::RollcallError;
use rollcall_core::time::millis_from_store_time;

pub use backend::StoreBackend;
use backend::AttemptError;

use crate::config::{RedisConfig, RedisMode};

/// Lowest server version with every command the registry relies on.
pub const MIN_SERVER_VERSION: (u32, u32) = (6, 2);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("shared store unreachable: {0}")]
    Connectivity(String),

    #[error("store configuration error: {0}")]
    Configuration(String),

    #[error("store command failed ({kind:?}): {message}")]
    Command {
        kind: redis::ErrorKind,
        message: String,
    },

    #[error("script failed: {0}")]
    Script(String),
}

impl StoreError {
    pub fn is_connectivity(&self) -> bool {
        matches!(self, StoreError::Connectivity(_))
    }
}

impl From<StoreError> for RollcallError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Connectivity(m) => RollcallError::connectivity(m),
            StoreError::Configuration(m) => RollcallError::configuration(m),
            StoreError::Script(m) => RollcallError::script_execution(m),
            StoreError::Command { message, .. } => RollcallError::connectivity(message),
        }
    }
}

/// Facts about the store server checked at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: (u32, u32, u32),
    pub cluster_enabled: bool,
}

impl ServerInfo {
    /// Parse the text reply of `INFO`.
    pub fn parse(info: &str) -> Result<Self, StoreError> {
        let mut version = None;
        let mut cluster_enabled = false;

        for line in info.lines() {
            let line = line.trim();
            if let Some(raw) = line.strip_prefix("redis_version:") {
                let mut parts = raw.split('.').map(|p| p.parse::<u32>().unwrap_or(0));
                version = Some((
                    parts.next().unwrap_or(0),
                    parts.next().unwrap_or(0),
                    parts.next().unwrap_or(0),
                ));
            } else if let Some(raw) = line.strip_prefix("cluster_enabled:") {
                cluster_enabled = raw == "1";
            }
        }

        let version = version.ok_or_else(|| {
            StoreError::Configuration("INFO reply carries no redis_version".into())
        })?;
        Ok(Self {
            version,
            cluster_enabled,
        })
    }

    /// Reject servers that are too old or whose topology differs from `mode`.
    pub fn check_compatible(&self, mode: RedisMode) -> Result<(), StoreError> {
        let (major, minor, patch) = self.version;
        if (major, minor) < MIN_SERVER_VERSION {
            return Err(StoreError::Configuration(format!(
                "Redis {major}.{minor}.{patch} is not supported, {}.{} or newer is required",
                MIN_SERVER_VERSION.0, MIN_SERVER_VERSION.1
            )));
        }
        match (mode, self.cluster_enabled) {
            (RedisMode::Single, true) => Err(StoreError::Configuration(
                "redis.mode is single but the server has cluster mode enabled".into(),
            )),
            (RedisMode::Cluster, false) => Err(StoreError::Configuration(
                "redis.mode is cluster but the server is a standalone node".into(),
            )),
            _ => Ok(()),
        }
    }
}

/// Topology-agnostic executor with bounded retry.
#[derive(Clone, Debug)]
pub struct StoreAccess {
    backend: StoreBackend,
    retry_backoff: Duration,
}

impl StoreAccess {
    pub fn new(backend: StoreBackend, retry_backoff: Duration) -> Self {
        Self {
            backend,
            retry_backoff,
        }
    }

    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let backend = StoreBackend::connect(config).await?;
        Ok(Self::new(backend, config.retry_backoff()))
    }

    pub fn mode(&self) -> RedisMode {
        self.backend.mode()
    }

    /// Run one command, retrying once on a connectivity failure.
    pub async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, StoreError> {
        match self.backend.run(cmd).await {
            Err(e) if e.is_transient() => {
                tracing::warn!(error = ?e, backoff_ms = self.retry_backoff.as_millis() as u64, "Store operation failed, retrying once");
                crate::metrics::record_store_retry();
                tokio::time::sleep(self.retry_backoff).await;
                self.backend
                    .run(cmd)
                    .await
                    .map_err(AttemptError::into_store_error)
            }
            other => other.map_err(AttemptError::into_store_error),
        }
    }

    /// Run independent commands concurrently; fails if any of them fails.
    pub async fn query_all<T: FromRedisValue>(&self, cmds: &[Cmd]) -> Result<Vec<T>, StoreError> {
        try_join_all(cmds.iter().map(|cmd| self.query::<T>(cmd))).await
    }

    /// Current time on the store clock, in unix millis.
    pub async fn server_time_millis(&self) -> Result<i64, StoreError> {
        let (seconds, micros): (i64, i64) = self.query(&redis::cmd("TIME")).await?;
        Ok(millis_from_store_time(seconds, micros))
    }

    pub async fn server_info(&self) -> Result<ServerInfo, StoreError> {
        let reply: redis::Value = self.query(&redis::cmd("INFO")).await?;
        // Cluster connections fan INFO out and answer with one entry per node.
        let reply = match reply {
            redis::Value::Map(nodes) => nodes
                .into_iter()
                .next()
                .map(|(_, value)| value)
                .ok_or_else(|| StoreError::Configuration("INFO returned no nodes".into()))?,
            other => other,
        };
        let info = String::from_redis_value(&reply).map_err(|e| StoreError::Command {
            kind: e.kind(),
            message: e.to_string(),
        })?;
        ServerInfo::parse(&info)
    }

    /// Fail with a configuration error unless the server fits the configured mode.
    pub async fn verify_server(&self) -> Result<ServerInfo, StoreError> {
        let info = self.server_info().await?;
        info.check_compatible(self.mode())?;
        let (major, minor, patch) = info.version;
        tracing::info!(
            version = %format!("{major}.{minor}.{patch}"),
            cluster_enabled = info.cluster_enabled,
            "Store server verified"
        );
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    const STANDALONE_INFO: &str = "# Server\r\nredis_version:7.2.4\r\nredis_mode:standalone\r\n# Cluster\r\ncluster_enabled:0\r\n";

    #[test]
    fn test_parse_info() {
        let info = ServerInfo::parse(STANDALONE_INFO).unwrap();
        assert_eq!(info.version, (7, 2, 4));
        assert!(!info.cluster_enabled);
    }

    #[test]
    fn test_parse_info_without_version() {
        assert!(ServerInfo::parse("# Server\r\n").is_err());
    }

    #[test]
    fn test_mode_mismatch_is_configuration_error() {
        let info = ServerInfo {
            version: (7, 0, 0),
            cluster_enabled: true,
        };
        assert!(matches!(
            info.check_compatible(RedisMode::Single),
            Err(StoreError::Configuration(_))
        ));
        info.check_compatible(RedisMode::Cluster).unwrap();

        let standalone = ServerInfo::parse(STANDALONE_INFO).unwrap();
        assert!(standalone.check_compatible(RedisMode::Cluster).is_err());
        standalone.check_compatible(RedisMode::Single).unwrap();
    }

    #[test]
    fn test_old_server_is_rejected() {
        let info = ServerInfo {
            version: (6, 0, 16),
            cluster_enabled: false,
        };
        let err = info.check_compatible(RedisMode::Single).unwrap_err();
        assert!(err.to_string().contains("6.0.16"));

        let ok = ServerInfo {
            version: (6, 2, 0),
            cluster_enabled: false,
        };
        ok.check_compatible(RedisMode::Single).unwrap();
    }

    /// A server that accepts connections and hangs up immediately, counting them.
    async fn hang_up_server() -> (String, Arc<AtomicUsize>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("redis://{}", listener.local_addr().unwrap());
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                drop(socket);
            }
        });
        (url, accepted)
    }

    #[tokio::test]
    async fn test_connectivity_failure_is_retried_once_after_backoff() {
        let (url, accepted) = hang_up_server().await;
        let pool = deadpool_redis::Config::from_url(url)
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .unwrap();
        let backoff = Duration::from_millis(300);
        let store = StoreAccess::new(StoreBackend::SingleNode(pool), backoff);

        let started = Instant::now();
        let result: Result<String, StoreError> = store.query(&redis::cmd("PING")).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(StoreError::Connectivity(_))), "{result:?}");
        assert!(elapsed >= backoff, "gave up after {elapsed:?}");
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_store_error_maps_to_core_taxonomy() {
        let err: RollcallError = StoreError::Connectivity("refused".into()).into();
        assert!(matches!(err, RollcallError::Connectivity(_)));

        let err: RollcallError = StoreError::Script("bad".into()).into();
        assert!(matches!(err, RollcallError::ScriptExecution(_)));
    }
}
