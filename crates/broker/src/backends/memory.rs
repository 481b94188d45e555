// In-process backends
//
// Share one `MemoryTransport` and one `MemoryDirectory` between several
// gateway components to simulate a fleet inside a single process.

use crate::directory::Directory;
use crate::transport::{MessageStream, Transport, TransportMessage};
use async_trait::async_trait;
use beacon_core::Result;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

const MEMORY_TRANSPORT_CAPACITY: usize = 1024;

/// Broadcast-backed transport; every subscriber sees every channel it asked for
#[derive(Clone)]
pub struct MemoryTransport {
    tx: broadcast::Sender<TransportMessage>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MEMORY_TRANSPORT_CAPACITY);
        Self { tx }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        // No subscribers is not an error: nobody is listening on this channel yet
        let _ = self.tx.send(TransportMessage::new(channel, payload));
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream> {
        let mut rx = self.tx.subscribe();
        let wanted: HashSet<String> = channels.iter().cloned().collect();

        let stream = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if wanted.contains(&msg.channel) {
                            yield msg;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Memory subscriber lagged, skipped {} messages", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

/// Directory held in process memory
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    entries: Arc<RwLock<HashMap<String, BTreeSet<String>>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn mark_online(&self, user_id: &str, connection_id: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(connection_id.to_string());
        Ok(())
    }

    async fn mark_offline(&self, user_id: &str) -> Result<()> {
        self.entries.write().await.remove(user_id);
        Ok(())
    }

    async fn mark_offline_connection(&self, user_id: &str, connection_id: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some(ids) = entries.get_mut(user_id) {
            ids.remove(connection_id);
            if ids.is_empty() {
                entries.remove(user_id);
            }
        }
        Ok(())
    }

    async fn list_online_user_ids(&self) -> Result<HashSet<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn is_online(&self, user_id: &str) -> Result<bool> {
        Ok(self.entries.read().await.contains_key(user_id))
    }

    async fn connections_for(&self, user_id: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .entries
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }
}
