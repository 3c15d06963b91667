//! Per-client FIFO of undelivered messages.
//!
//! RPUSH/LRANGE ordering per key gives strict FIFO within one queue; no
//! cross-queue ordering is promised. The queue TTL is armed by the first
//! message into an empty list and deliberately never extended by later
//! enqueues (the server-side script owns that conditional).
use palaver_common::Message;
use redis::AsyncCommands;
use std::sync::Arc;
use tracing::error;

use crate::error::Result;
use crate::keys::Keys;
use crate::pool::ConnectionPool;
use crate::scripts;

#[derive(Debug)]
pub struct MessageQueue {
    pool: Arc<ConnectionPool>,
    keys: Keys,
    message_ttl: u64,
}

impl MessageQueue {
    pub fn new(pool: Arc<ConnectionPool>, keys: Keys, message_ttl: u64) -> Self {
        Self {
            pool,
            keys,
            message_ttl,
        }
    }

    /// Append one message, assigning an id if the caller has not.
    pub async fn enqueue(&self, client_id: &str, message: &Message) -> Result<()> {
        let mut message = message.clone();
        message.ensure_id();
        let payload = serde_json::to_string(&message)?;
        let recipients = [client_id.to_string()];
        self.enqueue_encoded(&recipients, &payload).await
    }

    /// Fan one message out to every recipient queue in a single atomic batch:
    /// either all queues receive it or the error propagates and none of the
    /// partial state is trusted.
    pub async fn enqueue_batch(&self, client_ids: &[String], message: &Message) -> Result<()> {
        if client_ids.is_empty() {
            return Ok(());
        }
        let mut message = message.clone();
        message.ensure_id();
        let payload = serde_json::to_string(&message)?;
        self.enqueue_encoded(client_ids, &payload).await
    }

    async fn enqueue_encoded(&self, client_ids: &[String], payload: &str) -> Result<()> {
        let queue_keys: Vec<String> = client_ids
            .iter()
            .map(|client_id| self.keys.messages(client_id))
            .collect();
        let ttl = self.message_ttl;
        self.pool
            .with_connection(|mut conn| {
                let queue_keys = queue_keys.clone();
                let payload = payload.to_string();
                async move {
                    let script = if queue_keys.len() == 1 {
                        &scripts::ENQUEUE
                    } else {
                        &scripts::ENQUEUE_BATCH
                    };
                    let mut invocation = script.prepare_invoke();
                    for key in &queue_keys {
                        invocation.key(key);
                    }
                    invocation
                        .arg(&payload)
                        .arg(ttl)
                        .invoke_async::<i64>(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(())
    }

    /// Drain the queue: read everything and delete it in one transaction.
    /// Malformed entries are logged and dropped; the rest still deliver.
    pub async fn dequeue_all(&self, client_id: &str) -> Result<Vec<Message>> {
        let key = self.keys.messages(client_id);
        let (raw, _): (Vec<String>, i64) = self
            .pool
            .with_connection(|mut conn| {
                let key = key.clone();
                async move {
                    redis::pipe()
                        .atomic()
                        .lrange(&key, 0, -1)
                        .del(&key)
                        .query_async(&mut conn)
                        .await
                }
            })
            .await?;
        Ok(decode_entries(client_id, raw))
    }

    /// First `limit` messages without removing them.
    pub async fn peek(&self, client_id: &str, limit: usize) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let key = self.keys.messages(client_id);
        let stop = limit as isize - 1;
        let raw: Vec<String> = self
            .pool
            .with_connection(|mut conn| {
                let key = key.clone();
                async move { conn.lrange(&key, 0, stop).await }
            })
            .await?;
        Ok(decode_entries(client_id, raw))
    }

    pub async fn size(&self, client_id: &str) -> Result<usize> {
        let key = self.keys.messages(client_id);
        let len: i64 = self
            .pool
            .with_connection(|mut conn| {
                let key = key.clone();
                async move { conn.llen(&key).await }
            })
            .await?;
        Ok(len.max(0) as usize)
    }

    pub async fn clear(&self, client_id: &str) -> Result<()> {
        let key = self.keys.messages(client_id);
        self.pool
            .with_connection(|mut conn| {
                let key = key.clone();
                async move { conn.del::<_, ()>(&key).await }
            })
            .await?;
        Ok(())
    }
}

fn decode_entries(client_id: &str, raw: Vec<String>) -> Vec<Message> {
    raw.into_iter()
        .filter_map(|entry| match serde_json::from_str(&entry) {
            Ok(message) => Some(message),
            Err(err) => {
                error!(client_id, error = %err, "dropping malformed queued message");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_entries_are_dropped_not_fatal() {
        let good = serde_json::to_string(&Message::new("/a", json!("x"))).expect("encode");
        let decoded = decode_entries(
            "c1",
            vec!["not json".to_string(), good, "{\"broken\"".to_string()],
        );
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].channel, "/a");
    }

    #[test]
    fn decode_preserves_enqueue_order() {
        let first = serde_json::to_string(&Message::new("/a", json!(1))).expect("encode");
        let second = serde_json::to_string(&Message::new("/a", json!(2))).expect("encode");
        let decoded = decode_entries("c1", vec![first, second]);
        assert_eq!(decoded[0].data, json!(1));
        assert_eq!(decoded[1].data, json!(2));
    }
}
