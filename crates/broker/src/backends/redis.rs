// Redis backends
//
// PUBLISH goes through a multiplexed connection with bounded retry; each
// subscription owns a pub/sub connection that reconnects with exponential
// backoff. The directory is a single hash: field = userId, value = JSON array
// of connection ids. Updates to one field run as a Lua script so concurrent
// connects and disconnects of the same user cannot drop each other's ids.

use crate::directory::{decode_connection_ids, Directory};
use crate::reliability::ExponentialBackoff;
use crate::transport::{MessageStream, Transport, TransportMessage};
use async_trait::async_trait;
use beacon_core::{BeaconError, Result};
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::AsyncCommands;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const PUBLISH_MAX_ATTEMPTS: usize = 3;
const PUBLISH_RETRY_DELAYS: &[Duration] = &[Duration::from_millis(100), Duration::from_millis(200)];

/// Open a client and a multiplexed connection, retrying at boot.
///
/// Exhausting `attempts` is the one fatal broker failure: the gateway cannot
/// start without its shared store.
pub async fn connect_with_retry(
    url: &str,
    attempts: u32,
) -> Result<(redis::Client, MultiplexedConnection)> {
    let client = redis::Client::open(url)?;
    let mut backoff = ExponentialBackoff::with_bounds(Duration::from_millis(500), Duration::from_secs(5));
    let attempts = attempts.max(1);

    for attempt in 1..=attempts {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                tracing::info!(url, "Redis connected");
                return Ok((client, conn));
            }
            Err(e) if attempt < attempts => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    attempt,
                    attempts,
                    error = %e,
                    "Redis connection failed, retrying in {:.1}s",
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(BeaconError::broker_unavailable(url, "no connection attempts made"))
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub struct RedisTransport {
    client: redis::Client,
    publisher: MultiplexedConnection,
    degraded: Arc<AtomicBool>,
}

impl RedisTransport {
    pub fn new(client: redis::Client, publisher: MultiplexedConnection) -> Self {
        Self {
            client,
            publisher,
            degraded: Arc::new(AtomicBool::new(false)),
        }
    }
}

async fn open_pubsub(client: &redis::Client, channels: &[String]) -> Result<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    for channel in channels {
        pubsub.subscribe(channel).await?;
    }
    Ok(pubsub)
}

enum ForwardOutcome {
    /// Subscriber dropped its stream
    ReceiverGone,
    /// Redis closed the pub/sub connection
    StreamEnded,
}

async fn forward_messages(
    pubsub: PubSub,
    tx: &mpsc::UnboundedSender<TransportMessage>,
) -> ForwardOutcome {
    let messages = pubsub.into_on_message();
    tokio::pin!(messages);
    loop {
        tokio::select! {
            _ = tx.closed() => return ForwardOutcome::ReceiverGone,
            msg = messages.next() => {
                let Some(msg) = msg else {
                    return ForwardOutcome::StreamEnded;
                };
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(TransportMessage { channel, payload }).is_err() {
                            return ForwardOutcome::ReceiverGone;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(channel = %channel, error = %e, "Dropping non-text pub/sub payload");
                    }
                }
            }
        }
    }
}

async fn subscription_loop(
    client: redis::Client,
    channels: Vec<String>,
    first: PubSub,
    tx: mpsc::UnboundedSender<TransportMessage>,
    degraded: Arc<AtomicBool>,
) {
    let mut backoff = ExponentialBackoff::new();
    let mut current = Some(first);

    loop {
        let pubsub = match current.take() {
            Some(pubsub) => pubsub,
            None => match open_pubsub(&client, &channels).await {
                Ok(pubsub) => {
                    degraded.store(false, Ordering::Relaxed);
                    backoff.reset();
                    tracing::info!(?channels, "Redis subscription restored");
                    pubsub
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        error = %e,
                        "Redis resubscribe failed, retrying in {:.1}s",
                        delay.as_secs_f64()
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue,
                        _ = tx.closed() => return,
                    }
                }
            },
        };

        match forward_messages(pubsub, &tx).await {
            ForwardOutcome::ReceiverGone => {
                tracing::debug!(?channels, "Subscription dropped by consumer");
                return;
            }
            ForwardOutcome::StreamEnded => {
                degraded.store(true, Ordering::Relaxed);
                tracing::warn!(?channels, "Redis subscription lost, reconnecting");
            }
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn name(&self) -> &str {
        "redis"
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let mut last_err = String::new();

        for attempt in 0..PUBLISH_MAX_ATTEMPTS {
            let mut conn = self.publisher.clone();
            let result: redis::RedisResult<i64> = conn.publish(channel, payload.as_str()).await;
            match result {
                Ok(_) => {
                    self.degraded.store(false, Ordering::Relaxed);
                    return Ok(());
                }
                Err(e) => {
                    last_err = e.to_string();
                    if let Some(delay) = PUBLISH_RETRY_DELAYS.get(attempt) {
                        tokio::time::sleep(*delay).await;
                    }
                }
            }
        }

        self.degraded.store(true, Ordering::Relaxed);
        Err(BeaconError::broker_unavailable(channel, last_err))
    }

    async fn subscribe(&self, channels: &[String]) -> Result<MessageStream> {
        let first = open_pubsub(&self.client, channels).await?;
        tracing::info!(?channels, "Redis subscribed");

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(subscription_loop(
            self.client.clone(),
            channels.to_vec(),
            first,
            tx,
            self.degraded.clone(),
        ));

        let stream = async_stream::stream! {
            while let Some(msg) = rx.recv().await {
                yield msg;
            }
        };
        Ok(Box::pin(stream))
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Directory
// ---------------------------------------------------------------------------

pub struct RedisDirectory {
    conn: MultiplexedConnection,
    key: String,
    add_script: redis::Script,
    remove_script: redis::Script,
}

impl RedisDirectory {
    pub fn new(conn: MultiplexedConnection, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
            add_script: redis::Script::new(&format!(
                "{READ_IDS_LUA}table.insert(ids, ARGV[2])\n{WRITE_IDS_LUA}"
            )),
            remove_script: redis::Script::new(&format!("{READ_IDS_LUA}{WRITE_IDS_LUA}")),
        }
    }

    async fn read_ids(&self, user_id: &str) -> Result<BTreeSet<String>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.hget(&self.key, user_id).await?;
        Ok(decode_connection_ids(user_id, raw.as_deref()))
    }

    /// Run one of the update scripts; returns the user's remaining id count
    async fn update(&self, script: &redis::Script, user_id: &str, connection_id: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let remaining: i64 = script
            .key(&self.key)
            .arg(user_id)
            .arg(connection_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(remaining.max(0) as usize)
    }
}

// KEYS[1] = directory hash, ARGV[1] = user id, ARGV[2] = connection id.
// An unreadable entry is treated as empty, like `decode_connection_ids`.
// Ids are kept sorted, as a JSON array of strings.
const READ_IDS_LUA: &str = r#"
local ids = {}
local raw = redis.call('HGET', KEYS[1], ARGV[1])
if raw then
  local ok, decoded = pcall(cjson.decode, raw)
  if ok and type(decoded) == 'table' then
    for _, id in ipairs(decoded) do
      if type(id) == 'string' and id ~= ARGV[2] then
        table.insert(ids, id)
      end
    end
  end
end
"#;

const WRITE_IDS_LUA: &str = r#"
if #ids == 0 then
  redis.call('HDEL', KEYS[1], ARGV[1])
else
  table.sort(ids)
  redis.call('HSET', KEYS[1], ARGV[1], cjson.encode(ids))
end
return #ids
"#;


#[async_trait]
impl Directory for RedisDirectory {
    async fn mark_online(&self, user_id: &str, connection_id: &str) -> Result<()> {
        self.update(&self.add_script, user_id, connection_id).await?;
        Ok(())
    }

    async fn mark_offline(&self, user_id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.hdel(&self.key, user_id).await?;
        Ok(())
    }

    async fn mark_offline_connection(&self, user_id: &str, connection_id: &str) -> Result<()> {
        let remaining = self.update(&self.remove_script, user_id, connection_id).await?;
        if remaining == 0 {
            tracing::debug!(user_id, "Last connection removed from directory");
        }
        Ok(())
    }

    async fn list_online_user_ids(&self) -> Result<HashSet<String>> {
        let mut conn = self.conn.clone();
        let users: Vec<String> = conn.hkeys(&self.key).await?;
        Ok(users.into_iter().collect())
    }

    async fn is_online(&self, user_id: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.hexists(&self.key, user_id).await?)
    }

    async fn connections_for(&self, user_id: &str) -> Result<BTreeSet<String>> {
        self.read_ids(user_id).await
    }
}
