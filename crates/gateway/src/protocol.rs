// Client Socket Protocol
//
// Every frame in either direction is a JSON object:
//   {"type": "<EVENT>", "payload": <event-specific JSON>}
//
// Client -> gateway: GET_ONLINE_USERS, SEND_MESSAGE
// Gateway -> client: GET_ONLINE_USERS (reply), HAS_NEW_MESSAGE,
//   HAS_NEW_ONLINE_USER, HAS_NEW_OFFLINE_USER, HAS_NEW_NOTIFICATION, ERROR

use beacon_broker::PresenceEvent;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

pub mod events {
    pub const GET_ONLINE_USERS: &str = "GET_ONLINE_USERS";
    pub const SEND_MESSAGE: &str = "SEND_MESSAGE";
    pub const HAS_NEW_MESSAGE: &str = "HAS_NEW_MESSAGE";
    pub const HAS_NEW_ONLINE_USER: &str = "HAS_NEW_ONLINE_USER";
    pub const HAS_NEW_OFFLINE_USER: &str = "HAS_NEW_OFFLINE_USER";
    pub const HAS_NEW_NOTIFICATION: &str = "HAS_NEW_NOTIFICATION";
    pub const ERROR: &str = "ERROR";
}

/// Close reason sent when the handshake token is missing or rejected
pub const INVALID_ACCESS_TOKEN: &str = "INVALID_ACCESS_TOKEN";

/// Wire frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SocketFrame {
    #[serde(rename = "type")]
    pub event: String,
    #[serde(default)]
    pub payload: JsonValue,
}

impl SocketFrame {
    pub fn new(event: impl Into<String>, payload: JsonValue) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }

    pub fn error(error: &ProtocolError) -> Self {
        Self::new(
            events::ERROR,
            serde_json::to_value(error).unwrap_or(JsonValue::Null),
        )
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl From<&PresenceEvent> for SocketFrame {
    fn from(event: &PresenceEvent) -> Self {
        Self::new(event.kind.event_name(), event.payload.clone())
    }
}

/// SEND_MESSAGE payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingMessage {
    /// Message id, chosen by the client
    pub uuid: String,
    /// Overwritten with the authenticated user
    #[serde(default)]
    pub sender_uuid: String,
    pub receiver_uuid: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// Attachments and anything else the client sends along
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// A decoded client request
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    GetOnlineUsers,
    SendMessage(OutgoingMessage),
}

impl ClientRequest {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let frame: SocketFrame = serde_json::from_str(text).map_err(|e| {
            ProtocolError::new(ProtocolError::INVALID_REQUEST, format!("Invalid frame: {e}"))
        })?;
        Self::from_frame(frame)
    }

    pub fn from_frame(frame: SocketFrame) -> Result<Self, ProtocolError> {
        match frame.event.as_str() {
            events::GET_ONLINE_USERS => Ok(ClientRequest::GetOnlineUsers),
            events::SEND_MESSAGE => {
                let message: OutgoingMessage = serde_json::from_value(frame.payload).map_err(|e| {
                    ProtocolError::new(
                        ProtocolError::INVALID_REQUEST,
                        format!("Invalid SEND_MESSAGE payload: {e}"),
                    )
                })?;
                if message.uuid.is_empty() || message.receiver_uuid.is_empty() || message.message.is_empty() {
                    return Err(ProtocolError::new(
                        ProtocolError::INVALID_REQUEST,
                        "SEND_MESSAGE requires uuid, receiverUuid and message",
                    ));
                }
                Ok(ClientRequest::SendMessage(message))
            }
            other => Err(ProtocolError::new(
                ProtocolError::INVALID_REQUEST,
                format!("Unknown event: {other}"),
            )),
        }
    }
}

/// Protocol error type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolError {
    /// Error code
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Additional error details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

impl ProtocolError {
    // Standard error codes
    pub const INVALID_REQUEST: &'static str = "INVALID_REQUEST";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: JsonValue) -> Self {
        self.details = Some(details);
        self
    }
}
