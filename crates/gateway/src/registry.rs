// Connection Registry
//
// Per-instance table of live sockets, keyed by user. Owned by one gateway
// instance and rebuilt from scratch on restart.

use crate::protocol::SocketFrame;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Outbound frames queued for one socket
pub type FrameSender = mpsc::Sender<SocketFrame>;

/// Frames a slow socket may have queued before new ones are dropped
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Queue for a new socket
pub fn frame_channel() -> (FrameSender, mpsc::Receiver<SocketFrame>) {
    mpsc::channel(OUTBOUND_QUEUE_CAPACITY)
}

/// One live socket
#[derive(Debug, Clone)]
pub struct Connection {
    pub user_id: String,
    pub connection_id: String,
    pub instance_id: String,
    pub sender: FrameSender,
    pub connected_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(user_id: impl Into<String>, instance_id: impl Into<String>, sender: FrameSender) -> Self {
        Self {
            user_id: user_id.into(),
            connection_id: Uuid::new_v4().to_string(),
            instance_id: instance_id.into(),
            sender,
            connected_at: Utc::now(),
        }
    }

    /// Queue a frame; false when the socket is gone or too far behind
    pub fn send(&self, frame: SocketFrame) -> bool {
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                tracing::warn!(
                    user_id = %self.user_id,
                    connection_id = %self.connection_id,
                    event = %frame.event,
                    "Outbound queue full, dropping frame"
                );
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Arc<RwLock<HashMap<String, Vec<Connection>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection; returns how many the user now has here
    pub async fn register(&self, connection: Connection) -> usize {
        let mut connections = self.connections.write().await;
        let list = connections.entry(connection.user_id.clone()).or_default();
        list.push(connection);
        list.len()
    }

    /// Remove one connection; returns how many the user still has here
    pub async fn unregister(&self, user_id: &str, connection_id: &str) -> usize {
        let mut connections = self.connections.write().await;
        let Some(list) = connections.get_mut(user_id) else {
            return 0;
        };
        list.retain(|c| c.connection_id != connection_id);
        let remaining = list.len();
        if remaining == 0 {
            connections.remove(user_id);
        }
        remaining
    }

    pub async fn is_locally_online(&self, user_id: &str) -> bool {
        self.connections.read().await.contains_key(user_id)
    }

    pub async fn local_connections_for(&self, user_id: &str) -> Vec<Connection> {
        self.connections
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Queue `frame` on every local socket of `user_id`; returns the number reached
    pub async fn deliver(&self, user_id: &str, frame: &SocketFrame) -> usize {
        self.local_connections_for(user_id)
            .await
            .iter()
            .filter(|c| c.send(frame.clone()))
            .count()
    }

    pub async fn user_count(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connection(user_id: &str) -> (Connection, mpsc::Receiver<SocketFrame>) {
        let (tx, rx) = frame_channel();
        (Connection::new(user_id, "gw-1", tx), rx)
    }

    #[tokio::test]
    async fn test_register_and_unregister() {
        let registry = ConnectionRegistry::new();
        let (phone, _rx1) = connection("alice");
        let (laptop, _rx2) = connection("alice");

        assert_eq!(registry.register(phone.clone()).await, 1);
        assert_eq!(registry.register(laptop.clone()).await, 2);
        assert_eq!(registry.connection_count().await, 2);

        assert_eq!(registry.unregister("alice", &phone.connection_id).await, 1);
        assert!(registry.is_locally_online("alice").await);

        assert_eq!(registry.unregister("alice", &laptop.connection_id).await, 0);
        assert!(!registry.is_locally_online("alice").await);
        assert_eq!(registry.user_count().await, 0);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_noop() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.unregister("ghost", "c1").await, 0);
    }

    #[tokio::test]
    async fn test_deliver_reaches_every_device() {
        let registry = ConnectionRegistry::new();
        let (phone, mut rx1) = connection("alice");
        let (laptop, mut rx2) = connection("alice");
        registry.register(phone).await;
        registry.register(laptop).await;

        let frame = SocketFrame::new("HAS_NEW_NOTIFICATION", json!({ "uuid": "n1" }));
        assert_eq!(registry.deliver("alice", &frame).await, 2);
        assert_eq!(rx1.recv().await.unwrap(), frame);
        assert_eq!(rx2.recv().await.unwrap(), frame);

        assert_eq!(registry.deliver("bob", &frame).await, 0);
    }

    #[tokio::test]
    async fn test_deliver_skips_closed_sockets() {
        let registry = ConnectionRegistry::new();
        let (conn, rx) = connection("alice");
        registry.register(conn).await;
        drop(rx);

        let frame = SocketFrame::new("HAS_NEW_MESSAGE", json!({}));
        assert_eq!(registry.deliver("alice", &frame).await, 0);
    }

    #[tokio::test]
    async fn test_deliver_drops_when_queue_is_full() {
        let registry = ConnectionRegistry::new();
        let (tx, mut rx) = mpsc::channel(2);
        registry.register(Connection::new("alice", "gw-1", tx)).await;

        let frame = SocketFrame::new("HAS_NEW_MESSAGE", json!({ "message": "hi" }));
        assert_eq!(registry.deliver("alice", &frame).await, 1);
        assert_eq!(registry.deliver("alice", &frame).await, 1);
        assert_eq!(registry.deliver("alice", &frame).await, 0);

        // Draining makes room again
        rx.recv().await.unwrap();
        assert_eq!(registry.deliver("alice", &frame).await, 1);
        assert!(registry.is_locally_online("alice").await);
    }
}
