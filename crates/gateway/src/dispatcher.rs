// Fan-out dispatcher
//
// Delivers bus events to the sockets this instance holds. Events for users
// with no local connection are dropped; the instance holding them delivers.

use crate::protocol::SocketFrame;
use crate::registry::ConnectionRegistry;
use beacon_broker::{PresenceEvent, PresenceStream};
use futures_util::StreamExt;
use std::sync::Arc;

pub struct Dispatcher {
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Returns the number of local sockets reached
    pub async fn deliver(&self, event: &PresenceEvent) -> usize {
        let frame = SocketFrame::from(event);
        let delivered = self.registry.deliver(&event.target_user_id, &frame).await;
        if delivered == 0 {
            tracing::trace!(
                target_user = %event.target_user_id,
                event_name = event.kind.event_name(),
                "No local connection for event"
            );
        }
        delivered
    }

    pub async fn run(self, mut events: PresenceStream) {
        tracing::info!("Dispatcher started");
        while let Some(event) = events.next().await {
            self.deliver(&event).await;
        }
        tracing::warn!("Bus subscription ended, dispatcher stopped");
    }
}
