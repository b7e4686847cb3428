//! Connection handles for the two store topologies.

use deadpool_redis::Pool;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, FromRedisValue, RedisError};

use crate::config::{RedisConfig, RedisMode};

use super::StoreError;

/// Backend chosen once at startup.
///
/// | Mode       | Handle                        | Ownership                         |
/// |------------|-------------------------------|-----------------------------------|
/// | SingleNode | pooled connection             | scoped to one operation           |
/// | Cluster    | multiplexed cluster connection| long-lived, cloned per operation  |
#[derive(Clone)]
pub enum StoreBackend {
    SingleNode(Pool),
    Cluster(ClusterConnection),
}

/// Outcome of one attempt, before retry classification.
#[derive(Debug)]
pub(super) enum AttemptError {
    /// Could not obtain a pooled connection.
    Pool(String),
    Redis(RedisError),
}

impl AttemptError {
    /// Failures worth one more try: the command may not have reached the server.
    pub(super) fn is_transient(&self) -> bool {
        match self {
            AttemptError::Pool(_) => true,
            AttemptError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_connection_dropped()
                    || e.is_timeout()
                    || matches!(
                        e.kind(),
                        redis::ErrorKind::TryAgain
                            | redis::ErrorKind::ClusterDown
                            | redis::ErrorKind::MasterDown
                    )
            }
        }
    }

    pub(super) fn into_store_error(self) -> StoreError {
        let transient = self.is_transient();
        match self {
            AttemptError::Pool(message) => StoreError::Connectivity(message),
            AttemptError::Redis(e) if transient => StoreError::Connectivity(e.to_string()),
            AttemptError::Redis(e) => StoreError::Command {
                kind: e.kind(),
                message: e.to_string(),
            },
        }
    }
}

impl StoreBackend {
    /// Build the backend for the configured mode and verify it answers.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StoreError> {
        let backend = match config.mode {
            RedisMode::Single => Self::connect_single(config)?,
            RedisMode::Cluster => Self::connect_cluster(config).await?,
        };

        let pong: String = backend
            .run(&redis::cmd("PING"))
            .await
            .map_err(AttemptError::into_store_error)?;
        tracing::info!(mode = %config.mode, reply = %pong, "Connected to shared store");

        Ok(backend)
    }

    fn connect_single(config: &RedisConfig) -> Result<Self, StoreError> {
        tracing::info!(url = %config.url, "Connecting to Redis");

        let mut pool_config = deadpool_redis::PoolConfig::new(config.pool_size);
        pool_config.timeouts.wait = Some(config.timeout());
        pool_config.timeouts.create = Some(config.timeout());
        pool_config.timeouts.recycle = Some(config.timeout());

        let mut redis_config = deadpool_redis::Config::from_url(config.url.as_str());
        redis_config.pool = Some(pool_config);

        let pool = redis_config
            .create_pool(Some(deadpool_redis::Runtime::Tokio1))
            .map_err(|e| StoreError::Configuration(format!("cannot create Redis pool: {e}")))?;

        Ok(StoreBackend::SingleNode(pool))
    }

    async fn connect_cluster(config: &RedisConfig) -> Result<Self, StoreError> {
        tracing::info!(nodes = ?config.cluster_nodes, "Connecting to Redis cluster");

        let client = ClusterClient::builder(config.cluster_nodes.clone())
            .connection_timeout(config.timeout())
            .response_timeout(config.timeout())
            .build()
            .map_err(|e| StoreError::Configuration(format!("invalid cluster settings: {e}")))?;

        let connection = client
            .get_async_connection()
            .await
            .map_err(|e| StoreError::Connectivity(format!("cluster unreachable: {e}")))?;

        Ok(StoreBackend::Cluster(connection))
    }

    pub fn mode(&self) -> RedisMode {
        match self {
            StoreBackend::SingleNode(_) => RedisMode::Single,
            StoreBackend::Cluster(_) => RedisMode::Cluster,
        }
    }

    /// One attempt of `cmd`, no retry.
    pub(super) async fn run<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T, AttemptError> {
        match self {
            StoreBackend::SingleNode(pool) => {
                // Returned to the pool when dropped.
                let mut conn = pool
                    .get()
                    .await
                    .map_err(|e| AttemptError::Pool(e.to_string()))?;
                cmd.query_async(&mut conn).await.map_err(AttemptError::Redis)
            }
            StoreBackend::Cluster(connection) => {
                let mut conn = connection.clone();
                cmd.query_async(&mut conn).await.map_err(AttemptError::Redis)
            }
        }
    }
}

impl std::fmt::Debug for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::SingleNode(pool) => f
                .debug_struct("SingleNode")
                .field("status", &pool.status())
                .finish(),
            StoreBackend::Cluster(_) => f.debug_struct("Cluster").finish_non_exhaustive(),
        }
    }
}
