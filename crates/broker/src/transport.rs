// Transport Interface
//
// Publish/subscribe seam shared by the event bus and the correlation client.

use async_trait::async_trait;
use beacon_core::Result;
use std::pin::Pin;

/// A raw message received on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub channel: String,
    pub payload: String,
}

impl TransportMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

pub type MessageStream = Pin<Box<dyn futures_util::stream::Stream<Item = TransportMessage> + Send>>;

/// Unified publish/subscribe transport
#[async_trait]
pub trait Transport: Send + Sync {
    /// Backend name for logs (e.g., "redis", "memory")
    fn name(&self) -> &str;

    /// Publish a payload on a channel. Fire-and-forget: no delivery receipt.
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Subscribe to a set of channels.
    ///
    /// The subscription is active when this returns; messages published
    /// afterwards are yielded by the stream.
    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream>;

    /// True while the backend is reconnecting and deliveries may be lost
    fn is_degraded(&self) -> bool {
        false
    }
}
