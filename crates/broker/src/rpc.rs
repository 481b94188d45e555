// Correlation RPC
//
// Request/response over the broker topics. Every request carries a fresh
// requestId and owns a one-shot completion slot keyed by that id; a response
// resolves exactly the slot whose id it carries. Slots are removed on
// resolution, on timeout, and when the caller drops the request future.

use crate::transport::Transport;
use beacon_core::{BeaconError, BrokerConfig, DomainError, Result};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Message exchanged on the broker topics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerEnvelope {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub event_name: String,
    /// Subject user of the request
    #[serde(default)]
    pub uuid: String,
    /// Set by gateway instances so they can skip their own traffic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_by_producer: Option<String>,
    #[serde(default, alias = "payload")]
    pub data: JsonValue,
    /// Top-level fields other services attach to responses (e.g. `friends`)
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// What the listener did with one inbound envelope
#[derive(Debug)]
pub enum Inbound {
    /// Produced by a gateway; never a response
    OwnTraffic,
    /// Matched and resolved a pending request
    Resolved,
    /// No pending request here; may be a pushed event or another instance's response
    Unsolicited(BrokerEnvelope),
}

type PendingMap = Arc<Mutex<HashMap<String, oneshot::Sender<BrokerEnvelope>>>>;

/// Removes its slot when the request future completes or is dropped
struct PendingGuard {
    pending: PendingMap,
    request_id: String,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock(&self.pending).remove(&self.request_id);
    }
}

fn lock(pending: &PendingMap) -> MutexGuard<'_, HashMap<String, oneshot::Sender<BrokerEnvelope>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct CorrelationClient {
    transport: Arc<dyn Transport>,
    producer_tag: String,
    timeout: Duration,
    pending: PendingMap,
}

impl CorrelationClient {
    pub fn new(transport: Arc<dyn Transport>, producer_tag: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport,
            producer_tag: producer_tag.into(),
            timeout,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn from_config(transport: Arc<dyn Transport>, config: &BrokerConfig) -> Self {
        Self::new(transport, config.producer_tag.clone(), config.request_timeout())
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Publish a request on `topic` and wait for the response carrying its requestId.
    ///
    /// Returns `CorrelationTimeout` when nothing arrives within the configured bound.
    pub async fn request(
        &self,
        topic: &str,
        event_name: &str,
        uuid: &str,
        data: JsonValue,
    ) -> Result<BrokerEnvelope> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();

        // Slot exists before the request can be answered
        lock(&self.pending).insert(request_id.clone(), tx);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            request_id: request_id.clone(),
        };

        let envelope = BrokerEnvelope {
            request_id: request_id.clone(),
            event_name: event_name.to_string(),
            uuid: uuid.to_string(),
            send_by_producer: Some(self.producer_tag.clone()),
            data,
            extra: Map::new(),
        };
        self.transport
            .publish(topic, serde_json::to_string(&envelope)?)
            .await?;
        tracing::debug!(request_id = %request_id, event_name, topic, "Correlated request sent");

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BeaconError::Other(format!(
                "request {request_id} was abandoned"
            ))),
            Err(_) => {
                tracing::warn!(
                    request_id = %request_id,
                    event_name,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Correlated request timed out"
                );
                Err(DomainError::CorrelationTimeout {
                    request_id,
                    event_name: event_name.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// Route one inbound envelope to its waiter, if it has one here
    pub fn handle_inbound(&self, envelope: BrokerEnvelope) -> Inbound {
        if envelope.send_by_producer.as_deref() == Some(self.producer_tag.as_str()) {
            return Inbound::OwnTraffic;
        }

        if !envelope.request_id.is_empty() {
            let slot = lock(&self.pending).remove(&envelope.request_id);
            if let Some(tx) = slot {
                let request_id = envelope.request_id.clone();
                if tx.send(envelope).is_err() {
                    tracing::debug!(request_id = %request_id, "Waiter gone before response arrived");
                }
                return Inbound::Resolved;
            }
        }

        Inbound::Unsolicited(envelope)
    }

    /// Consume `topics` and resolve pending requests.
    ///
    /// The subscription is established before this returns, so requests issued
    /// afterwards cannot miss their response. Unmatched envelopes go to `unsolicited`.
    pub async fn run_listener(
        self: Arc<Self>,
        topics: Vec<String>,
        unsolicited: mpsc::UnboundedSender<(String, BrokerEnvelope)>,
    ) -> Result<JoinHandle<()>> {
        let mut messages = self.transport.subscribe(&topics).await?;
        tracing::info!(?topics, "Broker listener started");

        Ok(tokio::spawn(async move {
            while let Some(msg) = messages.next().await {
                let envelope = match serde_json::from_str::<BrokerEnvelope>(&msg.payload) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        tracing::warn!(channel = %msg.channel, error = %e, "Dropping malformed broker message");
                        continue;
                    }
                };

                if let Inbound::Unsolicited(envelope) = self.handle_inbound(envelope) {
                    let _ = unsolicited.send((msg.channel, envelope));
                }
            }
            tracing::info!("Broker listener stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryTransport;
    use serde_json::json;

    fn client(timeout: Duration) -> Arc<CorrelationClient> {
        Arc::new(CorrelationClient::new(
            Arc::new(MemoryTransport::new()),
            "WS_SERVER",
            timeout,
        ))
    }

    fn response(request_id: &str, data: JsonValue) -> BrokerEnvelope {
        BrokerEnvelope {
            request_id: request_id.to_string(),
            event_name: "GET_FRIEND_LIST".to_string(),
            send_by_producer: Some("FRIEND_SERVICE".to_string()),
            data,
            ..Default::default()
        }
    }

    async fn wait_for_pending(client: &CorrelationClient, n: usize) {
        while client.pending_count() < n {
            tokio::task::yield_now().await;
        }
    }

    fn pending_ids(client: &CorrelationClient) -> Vec<String> {
        lock(&client.pending).keys().cloned().collect()
    }

    #[test]
    fn test_envelope_accepts_payload_alias_and_extra_fields() {
        let raw = r#"{"requestId":"r1","eventName":"GET_FRIEND_LIST","uuid":"a","payload":{"x":1},"friends":["b"]}"#;
        let envelope: BrokerEnvelope = serde_json::from_str(raw).unwrap();
        assert_eq!(envelope.data, json!({ "x": 1 }));
        assert_eq!(envelope.extra.get("friends"), Some(&json!(["b"])));
        assert!(envelope.send_by_producer.is_none());
    }

    #[test]
    fn test_own_traffic_is_skipped() {
        let client = client(Duration::from_secs(1));
        let envelope = BrokerEnvelope {
            request_id: "r1".to_string(),
            send_by_producer: Some("WS_SERVER".to_string()),
            ..Default::default()
        };
        assert!(matches!(client.handle_inbound(envelope), Inbound::OwnTraffic));
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_independently() {
        let client = client(Duration::from_secs(30));

        let first = tokio::spawn({
            let client = client.clone();
            async move { client.request("FRIEND_TOPIC", "GET_FRIEND_LIST", "alice", json!({})).await }
        });
        wait_for_pending(&client, 1).await;
        let first_id = pending_ids(&client).remove(0);

        let second = tokio::spawn({
            let client = client.clone();
            async move { client.request("FRIEND_TOPIC", "GET_FRIEND_LIST", "bob", json!({})).await }
        });
        wait_for_pending(&client, 2).await;
        let second_id = pending_ids(&client)
            .into_iter()
            .find(|id| *id != first_id)
            .unwrap();

        // Answer the second request first; the first must stay pending
        let resolved = client.handle_inbound(response(&second_id, json!({ "for": "bob" })));
        assert!(matches!(resolved, Inbound::Resolved));
        let second = second.await.unwrap().unwrap();
        assert_eq!(second.data, json!({ "for": "bob" }));
        assert_eq!(client.pending_count(), 1);
        assert!(!first.is_finished());

        client.handle_inbound(response(&first_id, json!({ "for": "alice" })));
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.data, json!({ "for": "alice" }));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_response_for_unknown_request_is_unsolicited() {
        let client = client(Duration::from_secs(1));
        let inbound = client.handle_inbound(response("nobody-waits", JsonValue::Null));
        assert!(matches!(inbound, Inbound::Unsolicited(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_slot() {
        let client = client(Duration::from_secs(30));
        let err = client
            .request("FRIEND_TOPIC", "GET_FRIEND_LIST", "alice", json!({}))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_request_removes_slot() {
        let client = client(Duration::from_secs(30));
        let handle = tokio::spawn({
            let client = client.clone();
            async move { client.request("FRIEND_TOPIC", "GET_FRIEND_LIST", "alice", json!({})).await }
        });
        wait_for_pending(&client, 1).await;

        handle.abort();
        let _ = handle.await;
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_listener_resolves_over_transport() {
        let transport = MemoryTransport::new();
        let client = Arc::new(CorrelationClient::new(
            Arc::new(transport.clone()),
            "WS_SERVER",
            Duration::from_secs(5),
        ));
        let (tx, mut unsolicited) = mpsc::unbounded_channel();
        let _listener = client
            .clone()
            .run_listener(vec!["FRIEND_TOPIC".to_string()], tx)
            .await
            .unwrap();

        // Friend service: echo every request back as a response
        let mut requests = transport
            .subscribe(&["FRIEND_TOPIC".to_string()])
            .await
            .unwrap();
        let service = tokio::spawn({
            let transport = transport.clone();
            async move {
                while let Some(msg) = requests.next().await {
                    let request: BrokerEnvelope = serde_json::from_str(&msg.payload).unwrap();
                    if request.send_by_producer.as_deref() != Some("WS_SERVER") {
                        continue;
                    }
                    let mut reply = response(&request.request_id, JsonValue::Null);
                    reply.extra.insert("friends".to_string(), json!([request.uuid]));
                    transport
                        .publish("FRIEND_TOPIC", serde_json::to_string(&reply).unwrap())
                        .await
                        .unwrap();
                }
            }
        });

        let reply = client
            .request("FRIEND_TOPIC", "GET_FRIEND_LIST", "alice", json!({ "userId": "alice" }))
            .await
            .unwrap();
        assert_eq!(reply.extra.get("friends"), Some(&json!(["alice"])));
        assert!(unsolicited.try_recv().is_err());
        service.abort();
    }
}
