//! Server-side Lua procedures, registered once and invoked by digest.
//!
//! Every built-in procedure touches exactly one key, so it can run on a cluster.

use redis::{ErrorKind, FromRedisValue, ToRedisArgs};

use crate::store::{StoreAccess, StoreError};

/// Marks a player online on one proxy and clears the stale backend server.
///
/// KEYS[1] = `player:<uuid>`, ARGV = ip, proxy
pub const JOIN_SCRIPT: &str = r#"
redis.call('HSET', KEYS[1], 'ip', ARGV[1], 'proxy', ARGV[2], 'online', '0')
redis.call('HDEL', KEYS[1], 'server')
return 1
"#;

/// Clears connection fields and stamps the last-seen time.
///
/// KEYS[1] = `player:<uuid>`, ARGV = last-seen unix millis
pub const LEAVE_SCRIPT: &str = r#"
redis.call('HDEL', KEYS[1], 'server', 'ip', 'proxy')
redis.call('HSET', KEYS[1], 'online', ARGV[1])
return 1
"#;

/// Leave cleanup that only applies while `expected` still owns the player.
///
/// KEYS[1] = `player:<uuid>`, ARGV = expected proxy, last-seen unix millis.
/// Returns 1 when released, 0 when another proxy owns the player.
pub const RELEASE_OWNER_SCRIPT: &str = r#"
local owner = redis.call('HGET', KEYS[1], 'proxy')
if owner and owner ~= ARGV[1] then
  return 0
end
redis.call('HDEL', KEYS[1], 'server', 'ip', 'proxy')
redis.call('HSET', KEYS[1], 'online', ARGV[2])
return 1
"#;

/// A registered procedure.
#[derive(Clone, Debug)]
pub struct ScriptHandle {
    name: &'static str,
    source: &'static str,
    hash: String,
    store: StoreAccess,
}

impl ScriptHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    /// Run the procedure by digest. If the store has forgotten it, resubmit the
    /// full source once and return that result.
    pub async fn invoke<T, K, A>(&self, keys: &[K], args: &[A]) -> Result<T, StoreError>
    where
        T: FromRedisValue,
        K: ToRedisArgs,
        A: ToRedisArgs,
    {
        let mut evalsha = redis::cmd("EVALSHA");
        evalsha.arg(&self.hash).arg(keys.len()).arg(keys).arg(args);

        match self.store.query(&evalsha).await {
            Err(StoreError::Command {
                kind: ErrorKind::NoScriptError,
                ..
            }) => {
                tracing::warn!(script = self.name, hash = %self.hash, "Script missing from store cache, resubmitting source");
                let mut eval = redis::cmd("EVAL");
                eval.arg(self.source).arg(keys.len()).arg(keys).arg(args);
                self.store.query(&eval).await.map_err(script_error)
            }
            other => other.map_err(script_error),
        }
    }
}

fn script_error(err: StoreError) -> StoreError {
    match err {
        StoreError::Command { message, .. } => StoreError::Script(message),
        other => other,
    }
}

/// Registers procedures with the store.
#[derive(Clone, Debug)]
pub struct ScriptCache {
    store: StoreAccess,
}

impl ScriptCache {
    pub fn new(store: StoreAccess) -> Self {
        Self { store }
    }

    pub async fn load(&self, name: &'static str, source: &'static str) -> Result<ScriptHandle, StoreError> {
        let mut cmd = redis::cmd("SCRIPT");
        cmd.arg("LOAD").arg(source);
        let hash: String = self.store.query(&cmd).await.map_err(script_error)?;
        tracing::debug!(script = name, hash = %hash, "Registered script");

        Ok(ScriptHandle {
            name,
            source,
            hash,
            store: self.store.clone(),
        })
    }
}

/// Handles for every built-in procedure.
#[derive(Clone, Debug)]
pub struct BuiltinScripts {
    pub join: ScriptHandle,
    pub leave: ScriptHandle,
    pub release_owner: ScriptHandle,
}

impl BuiltinScripts {
    pub async fn load(cache: &ScriptCache) -> Result<Self, StoreError> {
        Ok(Self {
            join: cache.load("join", JOIN_SCRIPT).await?,
            leave: cache.load("leave", LEAVE_SCRIPT).await?,
            release_owner: cache.load("release_owner", RELEASE_OWNER_SCRIPT).await?,
        })
    }
}
