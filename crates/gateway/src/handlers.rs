// Gateway Event Handlers
//
// `ClientHandlers` serves frames sent by an authenticated socket.
// `BrokerEventRouter` turns events pushed by backend services onto the broker
// topics into bus events, so the instance holding the target socket delivers.

use crate::auth::Identity;
use crate::presence::PresenceCoordinator;
use crate::protocol::{events, ClientRequest, OutgoingMessage, SocketFrame};
use crate::registry::FrameSender;
use beacon_broker::{BrokerEnvelope, CorrelationClient, EventBus, PresenceEvent};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const NEW_MESSAGE: &str = "NEW_MESSAGE";
pub const NEW_MESSAGE_HAS_IMAGE: &str = "NEW_MESSAGE_HAS_IMAGE";

pub struct ClientHandlers {
    coordinator: Arc<PresenceCoordinator>,
    rpc: Arc<CorrelationClient>,
    bus: EventBus,
    message_topic: String,
}

impl ClientHandlers {
    pub fn new(
        coordinator: Arc<PresenceCoordinator>,
        rpc: Arc<CorrelationClient>,
        bus: EventBus,
        message_topic: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            rpc,
            bus,
            message_topic: message_topic.into(),
        }
    }

    /// Handle one client request without blocking the socket loop.
    ///
    /// Both requests wait on the broker for up to the request timeout, so they
    /// run on their own task; a reply goes out through `reply`.
    pub fn handle(self: &Arc<Self>, identity: &Identity, request: ClientRequest, reply: FrameSender) {
        let this = Arc::clone(self);
        let user_id = identity.user_id.clone();
        match request {
            ClientRequest::GetOnlineUsers => {
                tokio::spawn(async move {
                    let frame = this.online_users(&user_id).await;
                    if reply.send(frame).await.is_err() {
                        tracing::debug!(user_id = %user_id, "Socket closed before online users reply");
                    }
                });
            }
            ClientRequest::SendMessage(message) => {
                tokio::spawn(async move { this.send_message(&user_id, message).await });
            }
        }
    }

    /// `GET_ONLINE_USERS` reply for `user_id`
    pub async fn online_users(&self, user_id: &str) -> SocketFrame {
        let online = self.coordinator.online_friends(user_id).await;
        SocketFrame::new(events::GET_ONLINE_USERS, json!(online))
    }

    /// Persist through the message service, then notify the receiver.
    ///
    /// Returns true when the receiver notification was published.
    pub async fn send_message(&self, sender: &str, mut message: OutgoingMessage) -> bool {
        message.sender_uuid = sender.to_string();
        let receiver = message.receiver_uuid.clone();
        let data = match serde_json::to_value(&message) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode message");
                return false;
            }
        };

        let response = match self
            .rpc
            .request(&self.message_topic, NEW_MESSAGE, &message.uuid, data.clone())
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(
                    message_id = %message.uuid,
                    sender,
                    error = %e,
                    "Message was not acknowledged, receiver not notified"
                );
                return false;
            }
        };

        // Prefer the stored form (ids, timestamps) when the service returns it
        let value = match response.data {
            JsonValue::Object(stored) if !stored.is_empty() => JsonValue::Object(stored),
            _ => data,
        };

        match self.bus.publish(&PresenceEvent::new_message(receiver.as_str(), value)).await {
            Ok(()) => {
                tracing::debug!(message_id = %message.uuid, receiver = %receiver, "Message delivered to bus");
                true
            }
            Err(e) => {
                tracing::warn!(message_id = %message.uuid, error = %e, "Bus publish failed");
                false
            }
        }
    }
}

/// Re-publishes unsolicited broker events on the bus
pub struct BrokerEventRouter {
    bus: EventBus,
}

impl BrokerEventRouter {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    /// Convert one envelope; None when it is not for a connected client
    pub fn to_bus_event(envelope: &BrokerEnvelope) -> Option<PresenceEvent> {
        match envelope.event_name.as_str() {
            events::HAS_NEW_NOTIFICATION => {
                let target = envelope
                    .data
                    .get("sendToUuid")
                    .and_then(|v| v.as_str())
                    .unwrap_or(envelope.uuid.as_str());
                if target.is_empty() {
                    return None;
                }
                let value = match &envelope.data {
                    JsonValue::Object(fields) if !fields.is_empty() => envelope.data.clone(),
                    _ => json!({ "uuid": target }),
                };
                Some(PresenceEvent::new_notification(target, value))
            }
            NEW_MESSAGE_HAS_IMAGE => {
                let target = envelope.data.get("receiverUuid").and_then(|v| v.as_str())?;
                Some(PresenceEvent::new_message(target, envelope.data.clone()))
            }
            _ => None,
        }
    }

    pub async fn route(&self, topic: &str, envelope: BrokerEnvelope) {
        match Self::to_bus_event(&envelope) {
            Some(event) => self.bus.emit(event).await,
            None => tracing::debug!(
                topic,
                event_name = %envelope.event_name,
                request_id = %envelope.request_id,
                "Ignoring unsolicited broker message"
            ),
        }
    }

    pub async fn run(self, mut inbound: mpsc::UnboundedReceiver<(String, BrokerEnvelope)>) {
        while let Some((topic, envelope)) = inbound.recv().await {
            self.route(&topic, envelope).await;
        }
        tracing::info!("Broker event router stopped");
    }
}
