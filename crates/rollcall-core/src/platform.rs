//! Seam between the registry and the host proxy framework.
//!
//! An adapter translates its framework's connect, server-switch and disconnect
//! hooks into `PresenceRegistry` calls, and implements [`ProxyPlatform`] so the
//! registry can read live local state and hand notifications back.
//!
//! Implementations must be cheap and non-blocking: they are called from the
//! bus subscriber task and from read paths.

use std::net::IpAddr;

use uuid::Uuid;

use crate::events::{ChannelMessage, PresenceEvent};
use crate::model::ProxyId;

/// A player connected to this proxy, as the host framework sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPlayer {
    pub uuid: Uuid,
    pub name: String,
    pub server: Option<String>,
    pub ip: IpAddr,
}

/// Something that happened elsewhere in the fleet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkNotification {
    /// A presence mutation, including ones this proxy published itself.
    Presence(PresenceEvent),
    Channel(ChannelMessage),
    ProxyConnected(ProxyId),
    ProxyLost(ProxyId),
}

/// Live connection state and side effects of the host proxy.
pub trait ProxyPlatform: Send + Sync {
    fn local_player(&self, uuid: &Uuid) -> Option<LocalPlayer>;

    /// Case-insensitive lookup by display name.
    fn local_player_by_name(&self, name: &str) -> Option<LocalPlayer>;

    fn local_players(&self) -> Vec<LocalPlayer>;

    /// Disconnect a local player. Returns false when the player is not connected here.
    fn kick_local(&self, uuid: &Uuid, reason: &str) -> bool;

    /// Execute a console command addressed to this proxy.
    fn run_command(&self, command: &str);

    fn notify(&self, notification: NetworkNotification);
}

/// Platform with no local players, used by the standalone daemon.
///
/// It still takes part in heartbeats and reconciliation, and logs what it receives.
#[derive(Debug, Default, Clone)]
pub struct HeadlessPlatform;

impl ProxyPlatform for HeadlessPlatform {
    fn local_player(&self, _uuid: &Uuid) -> Option<LocalPlayer> {
        None
    }

    fn local_player_by_name(&self, _name: &str) -> Option<LocalPlayer> {
        None
    }

    fn local_players(&self) -> Vec<LocalPlayer> {
        Vec::new()
    }

    fn kick_local(&self, _uuid: &Uuid, _reason: &str) -> bool {
        false
    }

    fn run_command(&self, command: &str) {
        tracing::info!(command = %command, "Ignoring proxy command on headless node");
    }

    fn notify(&self, notification: NetworkNotification) {
        match notification {
            NetworkNotification::Presence(event) => {
                tracing::debug!(
                    uuid = %event.uuid,
                    proxy = %event.sender_proxy,
                    action = %event.action(),
                    "Presence change"
                );
            }
            NetworkNotification::Channel(message) => {
                tracing::debug!(
                    channel = %message.channel,
                    proxy = %message.sender_proxy,
                    "Channel message"
                );
            }
            NetworkNotification::ProxyConnected(proxy) => {
                tracing::info!(proxy = %proxy, "Proxy joined the fleet");
            }
            NetworkNotification::ProxyLost(proxy) => {
                tracing::warn!(proxy = %proxy, "Proxy left the fleet");
            }
        }
    }
}
