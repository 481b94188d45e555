// Event Bus
//
// Broadcasts typed events to every gateway instance. One channel per event
// family; each instance filters received events against its own connections.
//
// Wire format:
//   {"eventName": "HAS_NEW_ONLINE_USER", "data": {"sendToUuid": "...", "value": ...}}
//
// The fan-out form {"data": {"uuid": "<subject>", "value": ["<target>", ...]}}
// is accepted on receipt and expanded to one event per listed target.

use crate::transport::Transport;
use beacon_core::{BeaconError, BusConfig, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use std::pin::Pin;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventFamily {
    Message,
    Friend,
    Notification,
}

impl EventFamily {
    pub const ALL: [EventFamily; 3] = [
        EventFamily::Message,
        EventFamily::Friend,
        EventFamily::Notification,
    ];
}

/// What happened to the target user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// A friend came online
    Online,
    /// A friend went offline
    Offline,
    NewMessage,
    NewNotification,
}

impl EventKind {
    pub fn event_name(self) -> &'static str {
        match self {
            EventKind::Online => "HAS_NEW_ONLINE_USER",
            EventKind::Offline => "HAS_NEW_OFFLINE_USER",
            EventKind::NewMessage => "HAS_NEW_MESSAGE",
            EventKind::NewNotification => "HAS_NEW_NOTIFICATION",
        }
    }

    pub fn from_event_name(name: &str) -> Option<Self> {
        match name {
            "HAS_NEW_ONLINE_USER" => Some(EventKind::Online),
            "HAS_NEW_OFFLINE_USER" => Some(EventKind::Offline),
            "HAS_NEW_MESSAGE" => Some(EventKind::NewMessage),
            "HAS_NEW_NOTIFICATION" => Some(EventKind::NewNotification),
            _ => None,
        }
    }

    pub fn family(self) -> EventFamily {
        match self {
            EventKind::Online | EventKind::Offline => EventFamily::Friend,
            EventKind::NewMessage => EventFamily::Message,
            EventKind::NewNotification => EventFamily::Notification,
        }
    }
}

/// The unit carried on the bus: one event for one target user
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEvent {
    pub kind: EventKind,
    pub target_user_id: String,
    pub payload: JsonValue,
}

impl PresenceEvent {
    pub fn new(kind: EventKind, target_user_id: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            kind,
            target_user_id: target_user_id.into(),
            payload,
        }
    }

    /// Tell `target` that `subject` came online
    pub fn online(target: impl Into<String>, subject: &str) -> Self {
        Self::new(EventKind::Online, target, json!({ "uuid": subject }))
    }

    /// Tell `target` that `subject` went offline
    pub fn offline(target: impl Into<String>, subject: &str) -> Self {
        Self::new(EventKind::Offline, target, json!({ "uuid": subject }))
    }

    pub fn new_message(target: impl Into<String>, message: JsonValue) -> Self {
        Self::new(EventKind::NewMessage, target, message)
    }

    pub fn new_notification(target: impl Into<String>, notification: JsonValue) -> Self {
        Self::new(EventKind::NewNotification, target, notification)
    }

    pub fn to_bus_event(&self) -> BusEvent {
        BusEvent {
            event_name: self.kind.event_name().to_string(),
            data: BusData {
                send_to_uuid: Some(self.target_user_id.clone()),
                uuid: None,
                value: self.payload.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub event_name: String,
    pub data: BusData,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_to_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default)]
    pub value: JsonValue,
}

impl BusEvent {
    /// Expand into per-target events. Unknown event names yield nothing.
    pub fn into_presence_events(self) -> Vec<PresenceEvent> {
        let Some(kind) = EventKind::from_event_name(&self.event_name) else {
            tracing::debug!(event_name = %self.event_name, "Ignoring unknown bus event");
            return Vec::new();
        };

        let BusData {
            send_to_uuid,
            uuid,
            value,
        } = self.data;

        if let Some(target) = send_to_uuid {
            return vec![PresenceEvent::new(kind, target, value)];
        }

        match (uuid, value) {
            (Some(subject), JsonValue::Array(targets)) => targets
                .iter()
                .filter_map(|t| t.as_str())
                .map(|target| PresenceEvent::new(kind, target, json!({ "uuid": subject })))
                .collect(),
            (Some(target), value) => vec![PresenceEvent::new(kind, target, value)],
            (None, _) => Vec::new(),
        }
    }
}

pub type PresenceStream = Pin<Box<dyn futures_util::stream::Stream<Item = PresenceEvent> + Send>>;

#[derive(Clone)]
pub struct EventBus {
    transport: Arc<dyn Transport>,
    channels: BusConfig,
}

impl EventBus {
    pub fn new(transport: Arc<dyn Transport>, channels: BusConfig) -> Self {
        Self {
            transport,
            channels,
        }
    }

    pub fn channel_for(&self, family: EventFamily) -> &str {
        match family {
            EventFamily::Message => &self.channels.message_channel,
            EventFamily::Friend => &self.channels.friend_channel,
            EventFamily::Notification => &self.channels.notification_channel,
        }
    }

    pub fn channels(&self) -> Vec<String> {
        EventFamily::ALL
            .iter()
            .map(|family| self.channel_for(*family).to_string())
            .collect()
    }

    pub async fn publish(&self, event: &PresenceEvent) -> Result<()> {
        let channel = self.channel_for(event.kind.family());
        let payload = serde_json::to_string(&event.to_bus_event())?;
        self.transport.publish(channel, payload).await
    }

    /// Publish and forget: failures are logged, never returned
    pub async fn emit(&self, event: PresenceEvent) {
        let Err(e) = self.publish(&event).await else {
            return;
        };
        if e.is_retryable() {
            tracing::warn!(
                event_name = event.kind.event_name(),
                target = %event.target_user_id,
                transport = self.transport.name(),
                error = %e,
                "Bus publish failed, event dropped"
            );
        } else {
            tracing::error!(
                event_name = event.kind.event_name(),
                target = %event.target_user_id,
                error = %e,
                "Bus event could not be published"
            );
        }
    }

    /// True while the transport is reconnecting and events may be lost
    pub fn is_degraded(&self) -> bool {
        self.transport.is_degraded()
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    pub fn decode(channel: &str, payload: &str) -> Result<Vec<PresenceEvent>> {
        let event: BusEvent = serde_json::from_str(payload)
            .map_err(|e| BeaconError::malformed(channel, e.to_string()))?;
        Ok(event.into_presence_events())
    }

    /// Subscribe to every family. Malformed payloads are logged and skipped.
    pub async fn subscribe(&self) -> Result<PresenceStream> {
        let mut messages = self.transport.subscribe(&self.channels()).await?;

        let stream = async_stream::stream! {
            while let Some(msg) = messages.next().await {
                match EventBus::decode(&msg.channel, &msg.payload) {
                    Ok(events) => {
                        for event in events {
                            yield event;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Dropping bus message"),
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryTransport;

    fn bus() -> (MemoryTransport, EventBus) {
        let transport = MemoryTransport::new();
        let bus = EventBus::new(Arc::new(transport.clone()), BusConfig::default());
        (transport, bus)
    }

    #[test]
    fn test_wire_format() {
        let event = PresenceEvent::online("bob", "alice");
        let json = serde_json::to_value(event.to_bus_event()).unwrap();
        assert_eq!(
            json,
            json!({
                "eventName": "HAS_NEW_ONLINE_USER",
                "data": { "sendToUuid": "bob", "value": { "uuid": "alice" } }
            })
        );
    }

    #[test]
    fn test_decode_fanout_form() {
        let payload = r#"{"eventName":"HAS_NEW_OFFLINE_USER","data":{"uuid":"alice","value":["bob","carol"]}}"#;
        let events = EventBus::decode("FRIEND_CHANNEL", payload).unwrap();
        assert_eq!(
            events,
            vec![
                PresenceEvent::offline("bob", "alice"),
                PresenceEvent::offline("carol", "alice"),
            ]
        );
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let err = EventBus::decode("FRIEND_CHANNEL", "{not json").unwrap_err();
        assert!(err.to_string().contains("FRIEND_CHANNEL"));
    }

    #[test]
    fn test_decode_unknown_event_is_empty() {
        let payload = r#"{"eventName":"SOMETHING_ELSE","data":{"sendToUuid":"bob"}}"#;
        assert!(EventBus::decode("X", payload).unwrap().is_empty());
    }

    #[test]
    fn test_families_route_to_channels() {
        let (_, bus) = bus();
        assert_eq!(bus.channel_for(EventKind::Online.family()), "FRIEND_CHANNEL");
        assert_eq!(bus.channel_for(EventKind::NewMessage.family()), "MESSAGE_CHANNEL");
        assert_eq!(
            bus.channel_for(EventKind::NewNotification.family()),
            "NOTIFICATION_CHANNEL"
        );
    }

    #[tokio::test]
    async fn test_subscribe_skips_malformed_and_continues() {
        let (transport, bus) = bus();
        let mut events = bus.subscribe().await.unwrap();

        transport
            .publish("FRIEND_CHANNEL", "garbage".to_string())
            .await
            .unwrap();
        bus.publish(&PresenceEvent::new_notification("bob", json!({ "uuid": "n1" })))
            .await
            .unwrap();

        let event = events.next().await.unwrap();
        assert_eq!(event.kind, EventKind::NewNotification);
        assert_eq!(event.target_user_id, "bob");
    }

    struct DownTransport;

    #[async_trait::async_trait]
    impl Transport for DownTransport {
        fn name(&self) -> &str {
            "down"
        }

        async fn publish(&self, channel: &str, _payload: String) -> Result<()> {
            Err(BeaconError::broker_unavailable(channel, "connection refused"))
        }

        async fn subscribe(&self, _channels: &[String]) -> Result<crate::transport::MessageStream> {
            Err(BeaconError::broker_unavailable("bus", "connection refused"))
        }

        fn is_degraded(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_degraded_transport_is_reported_and_emit_swallows_failures() {
        let bus = EventBus::new(Arc::new(DownTransport), BusConfig::default());
        assert!(bus.is_degraded());
        assert_eq!(bus.transport_name(), "down");

        let err = bus.publish(&PresenceEvent::online("bob", "alice")).await.unwrap_err();
        assert!(err.is_retryable());
        bus.emit(PresenceEvent::online("bob", "alice")).await;
    }

    #[test]
    fn test_memory_bus_is_never_degraded() {
        let (_transport, bus) = bus();
        assert!(!bus.is_degraded());
    }
}
