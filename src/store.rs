//! Durable message routing over a stream-capable backend.
//!
//! Every registered chat owns three keyed objects:
//! - a stream `stream:<chatId>` of published messages
//! - a consumer group `group:<chatId>` on that stream, starting at offset 0
//! - a membership entry in the `chats:online` set
//!
//! Publishing appends to the recipient's stream. Each session drains its
//! own stream through the consumer group and acknowledges entries once
//! they are handed to the outbound writer, giving at-least-once delivery.

use std::sync::Arc;
use std::time::Duration;

use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::logger::Logger;
use crate::protocol::{ChatMessage, Payload};

/// Set holding the stream key of every registered chat.
const ONLINE_SET: &str = "chats:online";

/// Deadline for registration and publishing.
const COMMAND_DEADLINE: Duration = Duration::from_secs(30);
/// Deadline for each teardown step and for existence checks.
const STEP_DEADLINE: Duration = Duration::from_secs(5);
/// How long one subscription read blocks before polling for cancellation.
const SUBSCRIBE_BLOCK_MS: usize = 100;
/// Upper bound on entries pulled per subscription read.
const SUBSCRIBE_BATCH: usize = 16;

/// Errors from routing store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend command failed: {0}")]
    Backend(#[from] RedisError),
    #[error("backend command timed out after {0:?}")]
    Timeout(Duration),
}

/// Facade over the durable pub/sub backend.
///
/// Cheap to clone; every operation runs on a clone of the multiplexed
/// connection under its own deadline.
#[derive(Clone)]
pub struct Store {
    conn: redis::aio::MultiplexedConnection,
    logger: Arc<Logger>,
}

impl Store {
    /// Connect to the backend and verify it answers.
    pub async fn connect(url: &str, logger: Arc<Logger>) -> Result<Store, StoreError> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        logger.info("Connected to backend");

        Ok(Store { conn, logger })
    }

    /// Create the routing record for `chat_id`.
    ///
    /// Idempotent: an existing group is success, and set membership is a
    /// plain set add.
    pub async fn register(&self, chat_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let stream = stream_key(chat_id);
        let group = group_key(chat_id);

        bounded(COMMAND_DEADLINE, async {
            let created: Result<String, RedisError> =
                conn.xgroup_create_mkstream(&stream, &group, "0").await;
            match created {
                Ok(_) => {}
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(e),
            }

            let _: i64 = conn.sadd(ONLINE_SET, &stream).await?;
            Ok(())
        })
        .await?;

        self.logger.info(&format!("Created stream {stream}"));
        Ok(())
    }

    /// Tear down the routing record for `chat_id`.
    ///
    /// Every step runs even if an earlier one fails; the first failure is
    /// returned.
    pub async fn delete(&self, chat_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let stream = stream_key(chat_id);
        let group = group_key(chat_id);

        let destroyed = bounded(STEP_DEADLINE, async {
            let _: i64 = conn.xgroup_destroy(&stream, &group).await?;
            Ok(())
        })
        .await;

        let deleted = bounded(STEP_DEADLINE, async {
            let _: i64 = conn.del(&stream).await?;
            Ok(())
        })
        .await;

        let removed = bounded(STEP_DEADLINE, async {
            let _: i64 = conn.srem(ONLINE_SET, &stream).await?;
            Ok(())
        })
        .await;

        self.logger.info(&format!("Deleted stream {stream}"));
        destroyed.and(deleted).and(removed)
    }

    /// Append one JSON-encoded message to the recipient's stream.
    ///
    /// The caller is responsible for having checked membership first.
    pub async fn publish(&self, chat_id: &str, message: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let stream = stream_key(chat_id);

        bounded(COMMAND_DEADLINE, async {
            let _: String = conn.xadd(&stream, "*", &[("message", message)]).await?;
            Ok(())
        })
        .await
    }

    /// Whether `chat_id` is currently addressable. Backend trouble reads
    /// as absent.
    pub async fn exists(&self, chat_id: &str) -> bool {
        let mut conn = self.conn.clone();
        let stream = stream_key(chat_id);

        let member = bounded(STEP_DEADLINE, async {
            let member: bool = conn.sismember(ONLINE_SET, &stream).await?;
            Ok(member)
        })
        .await;

        match member {
            Ok(member) => member,
            Err(e) => {
                self.logger
                    .error(&format!("existence check for {chat_id} failed: {e}"));
                false
            }
        }
    }

    /// Drive message delivery for one session until cancellation.
    ///
    /// Streams to consume arrive on `sub`; entries read from them are
    /// decoded, forwarded on `out`, then acknowledged under the owner's
    /// group. `out` closes when the subscription ends.
    pub async fn subscribe(
        &self,
        cancel: CancellationToken,
        out: mpsc::Sender<Payload>,
        mut sub: mpsc::Receiver<String>,
        owner: String,
    ) {
        let group = group_key(&owner);
        let consumer = consumer_name();
        let mut streams: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                subscription = sub.recv() => {
                    match subscription {
                        Some(chat_id) => streams.push(stream_key(&chat_id)),
                        None => return,
                    }
                }
                batch = self.read_batch(&streams, &group, &consumer), if !streams.is_empty() => {
                    match batch {
                        Ok(reply) => {
                            if !self.deliver(reply, &group, &out).await {
                                return;
                            }
                        }
                        Err(e) => {
                            self.logger
                                .error(&format!("subscription read for {owner} failed: {e}"));
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One blocking consumer-group read across all subscribed streams.
    async fn read_batch(
        &self,
        streams: &[String],
        group: &str,
        consumer: &str,
    ) -> Result<StreamReadReply, StoreError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .block(SUBSCRIBE_BLOCK_MS)
            .count(SUBSCRIBE_BATCH);
        // `>` asks only for entries never delivered to this group.
        let ids = vec![">"; streams.len()];

        let reply: StreamReadReply = conn.xread_options(streams, &ids, &options).await?;
        Ok(reply)
    }

    /// Forward a batch on the outbound channel, acking each entry after
    /// hand-off. Returns false once the session side is gone.
    async fn deliver(
        &self,
        reply: StreamReadReply,
        group: &str,
        out: &mpsc::Sender<Payload>,
    ) -> bool {
        let mut conn = self.conn.clone();

        for stream in reply.keys {
            for entry in stream.ids {
                match decode_entry(&entry) {
                    Some(message) => {
                        if out.send(Payload::Message(message)).await.is_err() {
                            return false;
                        }
                        self.logger
                            .debug(&format!("delivered {} from {}", entry.id, stream.key));
                    }
                    // A poison entry is dropped rather than redelivered
                    // forever.
                    None => self.logger.warning(&format!(
                        "discarding malformed entry {} on {}",
                        entry.id, stream.key
                    )),
                }

                let acked: Result<i64, RedisError> =
                    conn.xack(&stream.key, group, &[&entry.id]).await;
                if let Err(e) = acked {
                    self.logger.error(&format!(
                        "ack of {} on {} failed: {e}",
                        entry.id, stream.key
                    ));
                }
            }
        }

        true
    }
}

/// Pull the JSON `message` field out of a stream entry.
fn decode_entry(entry: &StreamId) -> Option<ChatMessage> {
    let raw: String = entry.get("message")?;
    serde_json::from_str(&raw).ok()
}

fn stream_key(chat_id: &str) -> String {
    format!("stream:{chat_id}")
}

fn group_key(chat_id: &str) -> String {
    format!("group:{chat_id}")
}

fn consumer_name() -> String {
    format!("consumer:{}", Uuid::new_v4())
}

/// Run one backend operation under `deadline`.
async fn bounded<T, F>(deadline: Duration, operation: F) -> Result<T, StoreError>
where
    F: std::future::Future<Output = Result<T, RedisError>>,
{
    match time::timeout(deadline, operation).await {
        Ok(result) => result.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(deadline)),
    }
}
