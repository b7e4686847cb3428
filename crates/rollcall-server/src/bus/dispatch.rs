//! Routing of decoded bus messages to local state and the platform.

use std::sync::Arc;

use rollcall_core::{
    BusEnvelope, BusMessage, NetworkNotification, PresenceChange, ProxyId, ProxyPlatform,
};
use uuid::Uuid;

use crate::heartbeat::LivenessTable;
use crate::identity::IdentityResolver;
use crate::metrics;
use crate::presence::PresenceRegistry;

pub struct BusHandler {
    proxy_id: ProxyId,
    instance: Uuid,
    registry: Arc<PresenceRegistry>,
    identity: Arc<IdentityResolver>,
    liveness: Arc<LivenessTable>,
    platform: Arc<dyn ProxyPlatform>,
}

impl BusHandler {
    pub fn new(
        proxy_id: ProxyId,
        instance: Uuid,
        registry: Arc<PresenceRegistry>,
        identity: Arc<IdentityResolver>,
        liveness: Arc<LivenessTable>,
        platform: Arc<dyn ProxyPlatform>,
    ) -> Self {
        Self {
            proxy_id,
            instance,
            registry,
            identity,
            liveness,
            platform,
        }
    }

    /// Decode and dispatch one raw channel payload. Malformed payloads are logged and dropped.
    pub async fn handle_raw(&self, payload: &str) {
        let envelope = match BusEnvelope::decode(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, payload = %payload, "Failed to decode bus message");
                return;
            }
        };
        let instance = envelope.instance;
        match envelope.into_message() {
            Ok(message) => self.handle(instance, message).await,
            Err(e) => {
                tracing::warn!(error = %e, payload = %payload, "Invalid bus message body");
            }
        }
    }

    pub async fn handle(&self, instance: Uuid, message: BusMessage) {
        if message.sender() == &self.proxy_id && instance != self.instance {
            tracing::warn!(
                proxy = %self.proxy_id,
                other_instance = %instance,
                "Another process is publishing with this proxy id; proxy ids must be unique"
            );
        }

        match message {
            BusMessage::Presence(event) => {
                metrics::record_bus_message("presence");
                tracing::debug!(
                    uuid = %event.uuid,
                    proxy = %event.sender_proxy,
                    action = %event.action(),
                    "Received presence event"
                );
                self.registry.apply_remote(&event);
                if matches!(event.change, PresenceChange::Join { .. }) {
                    self.identity.warm(&event.uuid).await;
                }
                self.platform.notify(NetworkNotification::Presence(event));
            }
            BusMessage::Heartbeat(record) => {
                metrics::record_bus_message("heartbeat");
                let proxy = record.proxy_id.clone();
                if self.liveness.observe(record) && proxy != self.proxy_id {
                    tracing::info!(proxy = %proxy, "Proxy connected to the fleet");
                    self.platform.notify(NetworkNotification::ProxyConnected(proxy));
                }
            }
            BusMessage::Channel(message) => {
                metrics::record_bus_message("channel");
                self.platform.notify(NetworkNotification::Channel(message));
            }
            BusMessage::Command(command) => {
                metrics::record_bus_message("command");
                if command.target.includes(&self.proxy_id) {
                    tracing::info!(
                        from = %command.sender_proxy,
                        command = %command.command,
                        "Running proxy command"
                    );
                    self.platform.run_command(&command.command);
                }
            }
        }
    }
}
