//! Presence and identity records shared by every proxy in the fleet.
//!
//! The shared store layout is fixed:
//!
//! | Key                      | Type | Contents                                   |
//! |--------------------------|------|--------------------------------------------|
//! | `proxy:<id>:usersOnline` | set  | uuids attached to proxy `<id>`             |
//! | `player:<uuid>`          | hash | `server`, `ip`, `proxy`, `online`          |
//! | `uuid-cache`             | hash | lower-cased name / uuid -> identity entry  |
//! | `heartbeats`             | hash | proxy id -> heartbeat record               |

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{Result, RollcallError};

pub const UUID_CACHE_KEY: &str = "uuid-cache";
pub const HEARTBEATS_KEY: &str = "heartbeats";

/// Value of `player:<uuid>.online` while the player is connected.
pub const ONLINE_MARKER: &str = "0";

pub mod fields {
    pub const SERVER: &str = "server";
    pub const IP: &str = "ip";
    pub const PROXY: &str = "proxy";
    pub const ONLINE: &str = "online";
}

/// Key of the membership set of `proxy`.
pub fn proxy_members_key(proxy: &ProxyId) -> String {
    format!("proxy:{}:usersOnline", proxy.as_str())
}

/// Key of the presence hash of `uuid`.
pub fn player_key(uuid: &Uuid) -> String {
    format!("player:{uuid}")
}

/// Operator-assigned identifier of one proxy process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProxyId(String);

impl ProxyId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(RollcallError::InvalidProxyId("proxy id must not be empty".into()));
        }
        if id.contains(char::is_whitespace) {
            return Err(RollcallError::InvalidProxyId(format!(
                "proxy id '{id}' must not contain whitespace"
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProxyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ProxyId {
    type Error = RollcallError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ProxyId> for String {
    fn from(value: ProxyId) -> Self {
        value.0
    }
}

/// Answer to "when was this player last online".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastOnline {
    Online,
    /// Offline since the given unix millis.
    Offline(i64),
    Never,
}

impl LastOnline {
    /// Interpret the raw `online` field of `player:<uuid>`.
    pub fn from_field(uuid: &Uuid, raw: Option<&str>) -> Result<Self> {
        match raw {
            None => Ok(Self::Never),
            Some(ONLINE_MARKER) => Ok(Self::Online),
            Some(value) => value
                .parse::<i64>()
                .map(Self::Offline)
                .map_err(|e| RollcallError::invalid_data(player_key(uuid), e.to_string())),
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, Self::Online)
    }
}

/// Decoded contents of `player:<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    pub uuid: Uuid,
    pub server: Option<String>,
    pub ip: Option<IpAddr>,
    pub proxy: Option<ProxyId>,
    pub last_online: LastOnline,
}

impl PlayerRecord {
    /// Build a record from an `HGETALL` reply. An empty map means the uuid was never seen.
    pub fn from_hash(uuid: Uuid, mut hash: HashMap<String, String>) -> Result<Self> {
        let key = player_key(&uuid);
        let ip = match hash.remove(fields::IP) {
            Some(raw) => Some(
                raw.parse::<IpAddr>()
                    .map_err(|e| RollcallError::invalid_data(&key, format!("ip: {e}")))?,
            ),
            None => None,
        };
        let proxy = hash.remove(fields::PROXY).map(ProxyId::new).transpose()?;
        let last_online = LastOnline::from_field(&uuid, hash.get(fields::ONLINE).map(String::as_str))?;

        Ok(Self {
            uuid,
            server: hash.remove(fields::SERVER),
            ip,
            proxy,
            last_online,
        })
    }

    pub fn is_online(&self) -> bool {
        self.last_online.is_online()
    }
}

/// Cached name <-> uuid association, stored as JSON in `uuid-cache` and in memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityCacheEntry {
    pub name: String,
    pub uuid: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub expiry: OffsetDateTime,
}

impl IdentityCacheEntry {
    /// Create an entry valid for `ttl` from now.
    pub fn new(name: impl Into<String>, uuid: Uuid, ttl: Duration) -> Self {
        Self {
            name: name.into(),
            uuid,
            expiry: OffsetDateTime::now_utc() + ttl,
        }
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expiry
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    /// Field of `uuid-cache` holding this entry under its name.
    pub fn name_field(&self) -> String {
        self.name.to_lowercase()
    }

    pub fn uuid_field(&self) -> String {
        self.uuid.to_string()
    }
}

/// Periodic liveness signal of one proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    #[serde(rename = "senderProxy")]
    pub proxy_id: ProxyId,
    /// Unix millis on the store clock.
    #[serde(rename = "heartbeatTimestamp")]
    pub timestamp: i64,
    pub player_count: u64,
}

impl HeartbeatRecord {
    /// A heartbeat is stale once `now - timestamp` exceeds the staleness window.
    pub fn is_stale_at(&self, now_millis: i64, staleness: Duration) -> bool {
        now_millis.saturating_sub(self.timestamp) > staleness.as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid() -> Uuid {
        Uuid::parse_str("069a79f4-44e9-4726-a5be-fca90e38aaf5").unwrap()
    }

    #[test]
    fn test_key_layout() {
        let proxy = ProxyId::new("lobby-1").unwrap();
        assert_eq!(proxy_members_key(&proxy), "proxy:lobby-1:usersOnline");
        assert_eq!(
            player_key(&uuid()),
            "player:069a79f4-44e9-4726-a5be-fca90e38aaf5"
        );
    }

    #[test]
    fn test_proxy_id_validation() {
        assert!(ProxyId::new("").is_err());
        assert!(ProxyId::new("   ").is_err());
        assert!(ProxyId::new("proxy one").is_err());
        assert_eq!(ProxyId::new("proxy-1").unwrap().as_str(), "proxy-1");

        let parsed: std::result::Result<ProxyId, _> = serde_json::from_str("\"\"");
        assert!(parsed.is_err());
    }

    #[test]
    fn test_last_online_from_field() {
        assert_eq!(LastOnline::from_field(&uuid(), None).unwrap(), LastOnline::Never);
        assert_eq!(LastOnline::from_field(&uuid(), Some("0")).unwrap(), LastOnline::Online);
        assert_eq!(
            LastOnline::from_field(&uuid(), Some("1700000000123")).unwrap(),
            LastOnline::Offline(1_700_000_000_123)
        );
        assert!(LastOnline::from_field(&uuid(), Some("yesterday")).is_err());
    }

    #[test]
    fn test_player_record_from_hash() {
        let mut hash = HashMap::new();
        hash.insert("server".to_string(), "hub".to_string());
        hash.insert("ip".to_string(), "10.0.0.7".to_string());
        hash.insert("proxy".to_string(), "proxy-a".to_string());
        hash.insert("online".to_string(), "0".to_string());

        let record = PlayerRecord::from_hash(uuid(), hash).unwrap();
        assert!(record.is_online());
        assert_eq!(record.server.as_deref(), Some("hub"));
        assert_eq!(record.ip, Some("10.0.0.7".parse().unwrap()));
        assert_eq!(record.proxy, Some(ProxyId::new("proxy-a").unwrap()));
    }

    #[test]
    fn test_player_record_never_seen() {
        let record = PlayerRecord::from_hash(uuid(), HashMap::new()).unwrap();
        assert_eq!(record.last_online, LastOnline::Never);
        assert!(record.proxy.is_none());
    }

    #[test]
    fn test_identity_entry_expiry() {
        let entry = IdentityCacheEntry::new("Notch", uuid(), Duration::from_secs(60));
        assert!(!entry.is_expired());
        assert!(entry.is_expired_at(entry.expiry));
        assert!(entry.is_expired_at(entry.expiry + Duration::from_millis(1)));
        assert_eq!(entry.name_field(), "notch");
    }

    #[test]
    fn test_identity_entry_json_shape() {
        let entry = IdentityCacheEntry::new("Notch", uuid(), Duration::from_secs(60));
        let json: serde_json::Value = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["name"], "Notch");
        assert_eq!(json["uuid"], "069a79f4-44e9-4726-a5be-fca90e38aaf5");
        assert!(json["expiry"].is_string());
    }

    #[test]
    fn test_heartbeat_wire_names_and_staleness() {
        let record = HeartbeatRecord {
            proxy_id: ProxyId::new("proxy-a").unwrap(),
            timestamp: 10_000,
            player_count: 3,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["senderProxy"], "proxy-a");
        assert_eq!(json["heartbeatTimestamp"], 10_000);
        assert_eq!(json["playerCount"], 3);

        let window = Duration::from_secs(30);
        assert!(!record.is_stale_at(40_000, window));
        assert!(record.is_stale_at(40_001, window));
    }
}
