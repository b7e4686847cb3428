//! Event types carried on the shared presence channel.
//!
//! - `PresenceEvent` - player joined, left, changed server or was kicked
//! - `HeartbeatRecord` - proxy liveness (see `crate::model`)
//! - `ChannelMessage` / `ProxyCommand` - generic fan-out used by operator tooling
//! - `BusMessage` - unified enum combining all of them

use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, RollcallError};
use crate::model::{HeartbeatRecord, ProxyId};

// ============================================================================
// Presence Events
// ============================================================================

/// Tag of a presence mutation on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PresenceAction {
    Join,
    Leave,
    ServerChange,
    Kick,
}

impl PresenceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceAction::Join => "JOIN",
            PresenceAction::Leave => "LEAVE",
            PresenceAction::ServerChange => "SERVER_CHANGE",
            PresenceAction::Kick => "KICK",
        }
    }
}

impl std::fmt::Display for PresenceAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happened to the player, one variant per action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Join { ip: IpAddr },
    Leave { last_seen_at: i64 },
    ServerChange {
        new_server: String,
        old_server: Option<String>,
    },
    Kick { reason: String },
}

impl PresenceChange {
    pub fn action(&self) -> PresenceAction {
        match self {
            PresenceChange::Join { .. } => PresenceAction::Join,
            PresenceChange::Leave { .. } => PresenceAction::Leave,
            PresenceChange::ServerChange { .. } => PresenceAction::ServerChange,
            PresenceChange::Kick { .. } => PresenceAction::Kick,
        }
    }
}

/// Immutable record of one presence mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEvent {
    pub uuid: Uuid,
    pub sender_proxy: ProxyId,
    /// Unix millis at the sender.
    pub timestamp: i64,
    pub change: PresenceChange,
}

impl PresenceEvent {
    pub fn new(uuid: Uuid, sender_proxy: ProxyId, timestamp: i64, change: PresenceChange) -> Self {
        Self {
            uuid,
            sender_proxy,
            timestamp,
            change,
        }
    }

    pub fn join(uuid: Uuid, sender: ProxyId, timestamp: i64, ip: IpAddr) -> Self {
        Self::new(uuid, sender, timestamp, PresenceChange::Join { ip })
    }

    pub fn leave(uuid: Uuid, sender: ProxyId, last_seen_at: i64) -> Self {
        Self::new(uuid, sender, last_seen_at, PresenceChange::Leave { last_seen_at })
    }

    pub fn server_change(
        uuid: Uuid,
        sender: ProxyId,
        timestamp: i64,
        new_server: impl Into<String>,
        old_server: Option<String>,
    ) -> Self {
        Self::new(
            uuid,
            sender,
            timestamp,
            PresenceChange::ServerChange {
                new_server: new_server.into(),
                old_server,
            },
        )
    }

    pub fn kick(uuid: Uuid, sender: ProxyId, timestamp: i64, reason: impl Into<String>) -> Self {
        Self::new(uuid, sender, timestamp, PresenceChange::Kick { reason: reason.into() })
    }

    pub fn action(&self) -> PresenceAction {
        self.change.action()
    }
}

// Payload shapes, one per action.

#[derive(Debug, Serialize, Deserialize)]
struct JoinPayload {
    ip: IpAddr,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeavePayload {
    last_seen_at: i64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerChangePayload {
    new_server: String,
    #[serde(default)]
    old_server: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct KickPayload {
    reason: String,
}

/// Serializable presence event format for the shared channel.
///
/// The payload is kept as raw JSON until the action tag has been read.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePresenceEvent {
    pub uuid: Uuid,
    pub sender_proxy: ProxyId,
    pub action: PresenceAction,
    pub timestamp: i64,
    pub payload: serde_json::Value,
}

impl TryFrom<&PresenceEvent> for WirePresenceEvent {
    type Error = RollcallError;

    fn try_from(event: &PresenceEvent) -> Result<Self> {
        let payload = match &event.change {
            PresenceChange::Join { ip } => serde_json::to_value(JoinPayload { ip: *ip })?,
            PresenceChange::Leave { last_seen_at } => serde_json::to_value(LeavePayload {
                last_seen_at: *last_seen_at,
            })?,
            PresenceChange::ServerChange {
                new_server,
                old_server,
            } => serde_json::to_value(ServerChangePayload {
                new_server: new_server.clone(),
                old_server: old_server.clone(),
            })?,
            PresenceChange::Kick { reason } => serde_json::to_value(KickPayload {
                reason: reason.clone(),
            })?,
        };

        Ok(Self {
            uuid: event.uuid,
            sender_proxy: event.sender_proxy.clone(),
            action: event.action(),
            timestamp: event.timestamp,
            payload,
        })
    }
}

impl TryFrom<WirePresenceEvent> for PresenceEvent {
    type Error = RollcallError;

    fn try_from(wire: WirePresenceEvent) -> Result<Self> {
        let change = match wire.action {
            PresenceAction::Join => {
                let p: JoinPayload = serde_json::from_value(wire.payload)?;
                PresenceChange::Join { ip: p.ip }
            }
            PresenceAction::Leave => {
                let p: LeavePayload = serde_json::from_value(wire.payload)?;
                PresenceChange::Leave {
                    last_seen_at: p.last_seen_at,
                }
            }
            PresenceAction::ServerChange => {
                let p: ServerChangePayload = serde_json::from_value(wire.payload)?;
                PresenceChange::ServerChange {
                    new_server: p.new_server,
                    old_server: p.old_server,
                }
            }
            PresenceAction::Kick => {
                let p: KickPayload = serde_json::from_value(wire.payload)?;
                PresenceChange::Kick { reason: p.reason }
            }
        };

        Ok(PresenceEvent {
            uuid: wire.uuid,
            sender_proxy: wire.sender_proxy,
            timestamp: wire.timestamp,
            change,
        })
    }
}

// ============================================================================
// Fan-out Messages
// ============================================================================

/// Free-form message on a named sub-channel, delivered to every proxy's platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub sender_proxy: ProxyId,
    pub channel: String,
    pub message: String,
}

/// Which proxies should run a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "scope", content = "proxy")]
pub enum CommandTarget {
    All,
    Proxy(ProxyId),
}

impl CommandTarget {
    pub fn includes(&self, proxy: &ProxyId) -> bool {
        match self {
            CommandTarget::All => true,
            CommandTarget::Proxy(target) => target == proxy,
        }
    }
}

/// Command to be executed by the platform of the targeted proxies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyCommand {
    pub sender_proxy: ProxyId,
    pub target: CommandTarget,
    pub command: String,
}

// ============================================================================
// Unified Bus Message
// ============================================================================

/// Decoded message from the shared channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    Presence(PresenceEvent),
    Heartbeat(HeartbeatRecord),
    Channel(ChannelMessage),
    Command(ProxyCommand),
}

impl BusMessage {
    pub fn sender(&self) -> &ProxyId {
        match self {
            BusMessage::Presence(e) => &e.sender_proxy,
            BusMessage::Heartbeat(h) => &h.proxy_id,
            BusMessage::Channel(m) => &m.sender_proxy,
            BusMessage::Command(c) => &c.sender_proxy,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
enum WireBody {
    Presence(WirePresenceEvent),
    Heartbeat(HeartbeatRecord),
    Channel(ChannelMessage),
    Command(ProxyCommand),
}

/// Envelope written to the shared channel.
///
/// `instance` identifies the sending process so that two proxies configured
/// with the same id can be detected.
#[derive(Debug, Serialize, Deserialize)]
pub struct BusEnvelope {
    pub instance: Uuid,
    #[serde(flatten)]
    body: WireBody,
}

impl BusEnvelope {
    pub fn new(instance: Uuid, message: &BusMessage) -> Result<Self> {
        let body = match message {
            BusMessage::Presence(e) => WireBody::Presence(WirePresenceEvent::try_from(e)?),
            BusMessage::Heartbeat(h) => WireBody::Heartbeat(h.clone()),
            BusMessage::Channel(m) => WireBody::Channel(m.clone()),
            BusMessage::Command(c) => WireBody::Command(c.clone()),
        };
        Ok(Self { instance, body })
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn into_message(self) -> Result<BusMessage> {
        Ok(match self.body {
            WireBody::Presence(wire) => BusMessage::Presence(wire.try_into()?),
            WireBody::Heartbeat(h) => BusMessage::Heartbeat(h),
            WireBody::Channel(m) => BusMessage::Channel(m),
            WireBody::Command(c) => BusMessage::Command(c),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(id: &str) -> ProxyId {
        ProxyId::new(id).unwrap()
    }

    fn uuid() -> Uuid {
        Uuid::parse_str("853c80ef-3c37-49fd-aa49-938b674adae6").unwrap()
    }

    fn roundtrip(message: BusMessage) -> BusMessage {
        let envelope = BusEnvelope::new(Uuid::new_v4(), &message).unwrap();
        let raw = envelope.encode().unwrap();
        BusEnvelope::decode(&raw).unwrap().into_message().unwrap()
    }

    #[test]
    fn test_presence_wire_shape() {
        let event = PresenceEvent::server_change(
            uuid(),
            proxy("proxy-a"),
            42,
            "survival",
            Some("hub".to_string()),
        );
        let wire = WirePresenceEvent::try_from(&event).unwrap();
        let json = serde_json::to_value(&wire).unwrap();

        assert_eq!(json["uuid"], "853c80ef-3c37-49fd-aa49-938b674adae6");
        assert_eq!(json["senderProxy"], "proxy-a");
        assert_eq!(json["action"], "SERVER_CHANGE");
        assert_eq!(json["timestamp"], 42);
        assert_eq!(json["payload"]["newServer"], "survival");
        assert_eq!(json["payload"]["oldServer"], "hub");
    }

    #[test]
    fn test_leave_payload_shape() {
        let event = PresenceEvent::leave(uuid(), proxy("proxy-a"), 1_700_000_000_000);
        let wire = WirePresenceEvent::try_from(&event).unwrap();
        assert_eq!(wire.action, PresenceAction::Leave);
        assert_eq!(wire.payload["lastSeenAt"], 1_700_000_000_000i64);
    }

    #[test]
    fn test_decode_dispatches_on_action_tag() {
        let raw = r#"{
            "instance": "5f0c6a3e-3d4b-4d43-9a8e-0d4a4c1f6d11",
            "type": "presence",
            "data": {
                "uuid": "853c80ef-3c37-49fd-aa49-938b674adae6",
                "senderProxy": "proxy-b",
                "action": "KICK",
                "timestamp": 7,
                "payload": {"reason": "maintenance"}
            }
        }"#;

        let message = BusEnvelope::decode(raw).unwrap().into_message().unwrap();
        match message {
            BusMessage::Presence(event) => {
                assert_eq!(event.sender_proxy, proxy("proxy-b"));
                assert_eq!(
                    event.change,
                    PresenceChange::Kick {
                        reason: "maintenance".to_string()
                    }
                );
            }
            other => panic!("Expected presence event, got {other:?}"),
        }
    }

    #[test]
    fn test_payload_not_matching_action_is_rejected() {
        let wire = WirePresenceEvent {
            uuid: uuid(),
            sender_proxy: proxy("proxy-b"),
            action: PresenceAction::Join,
            timestamp: 1,
            payload: serde_json::json!({"reason": "wrong shape"}),
        };
        assert!(PresenceEvent::try_from(wire).is_err());
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let raw = r#"{"instance":"5f0c6a3e-3d4b-4d43-9a8e-0d4a4c1f6d11","type":"presence","data":{"uuid":"853c80ef-3c37-49fd-aa49-938b674adae6","senderProxy":"p","action":"TELEPORT","timestamp":1,"payload":{}}}"#;
        assert!(BusEnvelope::decode(raw).is_err());
    }

    #[test]
    fn test_all_message_kinds_survive_the_channel() {
        let join = BusMessage::Presence(PresenceEvent::join(
            uuid(),
            proxy("proxy-a"),
            5,
            "127.0.0.1".parse().unwrap(),
        ));
        assert_eq!(roundtrip(join.clone()), join);

        let heartbeat = BusMessage::Heartbeat(HeartbeatRecord {
            proxy_id: proxy("proxy-a"),
            timestamp: 99,
            player_count: 12,
        });
        assert_eq!(roundtrip(heartbeat.clone()), heartbeat);

        let command = BusMessage::Command(ProxyCommand {
            sender_proxy: proxy("proxy-a"),
            target: CommandTarget::All,
            command: "alert restarting".to_string(),
        });
        assert_eq!(roundtrip(command.clone()), command);
    }

    #[test]
    fn test_command_target() {
        let a = proxy("proxy-a");
        let b = proxy("proxy-b");
        assert!(CommandTarget::All.includes(&a));
        assert!(CommandTarget::Proxy(a.clone()).includes(&a));
        assert!(!CommandTarget::Proxy(a).includes(&b));
    }
}
