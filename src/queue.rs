//! Redis Streams queue adapter.
//!
//! Admission produces stream entries with `XADD`; workers consume them
//! through a consumer group (`XREADGROUP`), acknowledge with `XACK`, and
//! recover abandoned entries with `XAUTOCLAIM`. The pending-idle threshold
//! plays the role of a visibility timeout, and the pending-entry delivery
//! counter plays the role of a receive count.
//!
//! Each stream entry carries the serialized [`QueueMessage`] under `body`
//! plus flat `event_id` / `correlation_id` fields so dead-lettered entries
//! can be triaged without parsing the body.

use std::collections::HashMap;

use deadpool_redis::redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamReadOptions, StreamReadReply,
};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::Pool;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::message::QueueMessage;

/// Errors raised by queue operations. All are transient: the stream either
/// was not reachable or rejected a command.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Redis(String),

    #[error("failed to serialize message: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One entry handed to the worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Redis stream entry id (e.g., "1234567890123-0")
    pub stream_id: String,

    /// Raw message body; absent when the entry is malformed
    pub body: Option<String>,

    /// Transport attributes, for triage without parsing the body
    pub event_id: Option<String>,
    pub correlation_id: Option<String>,

    /// How many times this entry has been delivered
    pub delivery_count: u64,
}

/// Queue adapter over one Redis stream.
#[derive(Clone)]
pub struct QueueClient {
    pool: Pool,
    stream: String,
}

impl QueueClient {
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Append a message to the stream.
    pub async fn send(&self, msg: &QueueMessage) -> Result<String, QueueError> {
        let body = serde_json::to_string(msg)?;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let id: String = cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("body")
            .arg(&body)
            .arg("event_id")
            .arg(&msg.event_id)
            .arg("correlation_id")
            .arg(&msg.correlation_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))?;

        debug!(
            stream_id = %id,
            event_id = %msg.event_id,
            payload_mode = msg.payload_mode.as_str(),
            "Message enqueued"
        );

        Ok(id)
    }

    /// Create the consumer group if it does not exist yet.
    pub async fn ensure_group(&self, group: &str) -> Result<(), QueueError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let created: Result<(), _> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                info!(group = %group, stream = %self.stream, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                info!(group = %group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(QueueError::Redis(e.to_string())),
        }
    }

    /// Read a batch of new entries for this consumer.
    ///
    /// Blocks up to `block_ms` and returns an empty batch on timeout. New
    /// entries start at delivery count 1.
    pub async fn read_batch(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let opts = StreamReadOptions::default()
            .group(group, consumer)
            .block(block_ms as usize)
            .count(count);

        let reply: Result<StreamReadReply, _> =
            conn.xread_options(&[&self.stream], &[">"], &opts).await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                let err_str = e.to_string();
                // Timeouts and nil replies just mean an empty poll.
                if err_str.contains("timed out") || err_str.contains("response was nil") {
                    return Ok(Vec::new());
                }
                return Err(QueueError::Redis(err_str));
            }
        };

        let mut deliveries = Vec::new();
        for stream_key in reply.keys {
            for element in stream_key.ids {
                deliveries.push(Delivery {
                    stream_id: element.id.clone(),
                    body: get_str_field(&element.map, "body"),
                    event_id: get_str_field(&element.map, "event_id"),
                    correlation_id: get_str_field(&element.map, "correlation_id"),
                    delivery_count: 1,
                });
            }
        }

        Ok(deliveries)
    }

    /// Claim entries another consumer left pending for longer than
    /// `min_idle_ms`, returning them with their true delivery counts.
    pub async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<Delivery>, QueueError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let opts = StreamAutoClaimOptions::default().count(count);
        let claimed: Result<StreamAutoClaimReply, _> = conn
            .xautoclaim_options(&self.stream, group, consumer, min_idle_ms, "0-0", opts)
            .await;

        let reply = match claimed {
            Ok(reply) => reply,
            Err(e) => {
                // XAUTOCLAIM is unavailable on older Redis servers.
                debug!(error = %e, "XAUTOCLAIM failed, skipping pending recovery");
                return Ok(Vec::new());
            }
        };

        let mut deliveries = Vec::new();
        for entry in reply.claimed {
            let delivery_count = self.delivery_count(&mut conn, group, &entry.id).await;
            deliveries.push(Delivery {
                stream_id: entry.id,
                body: get_str_field(&entry.map, "body"),
                event_id: get_str_field(&entry.map, "event_id"),
                correlation_id: get_str_field(&entry.map, "correlation_id"),
                delivery_count,
            });
        }

        if !deliveries.is_empty() {
            info!(
                count = deliveries.len(),
                "Claimed pending messages from previous consumers"
            );
        }

        Ok(deliveries)
    }

    /// Acknowledge an entry, removing it from the pending list.
    pub async fn ack(&self, group: &str, stream_id: &str) -> Result<(), QueueError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let _: i64 = conn
            .xack(&self.stream, group, &[stream_id])
            .await
            .map_err(|e| QueueError::Redis(e.to_string()))?;

        Ok(())
    }

    /// Look up the delivery counter for a pending entry.
    async fn delivery_count(
        &self,
        conn: &mut deadpool_redis::Connection,
        group: &str,
        stream_id: &str,
    ) -> u64 {
        type Pending = Vec<(String, String, u64, u64)>;

        let pending: Result<Pending, _> = cmd("XPENDING")
            .arg(&self.stream)
            .arg(group)
            .arg(stream_id)
            .arg(stream_id)
            .arg(1)
            .query_async(conn)
            .await;

        match pending {
            Ok(entries) => entries.first().map(|entry| entry.3).unwrap_or(1),
            Err(e) => {
                warn!(stream_id = %stream_id, error = %e, "XPENDING lookup failed");
                1
            }
        }
    }
}

/// Extract a string field from stream entry data.
fn get_str_field(map: &HashMap<String, RedisValue>, key: &str) -> Option<String> {
    map.get(key).and_then(|val| match val {
        RedisValue::BulkString(bytes) => {
            let s = String::from_utf8_lossy(bytes).to_string();
            if s.is_empty() {
                None
            } else {
                Some(s)
            }
        }
        RedisValue::SimpleString(s) => {
            if s.is_empty() {
                None
            } else {
                Some(s.clone())
            }
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_str_field_bulk_string() {
        let mut map = HashMap::new();
        map.insert(
            "body".to_string(),
            RedisValue::BulkString(b"{\"a\":1}".to_vec()),
        );

        assert_eq!(get_str_field(&map, "body").as_deref(), Some("{\"a\":1}"));
    }

    #[test]
    fn test_get_str_field_missing_or_empty() {
        let mut map = HashMap::new();
        map.insert("body".to_string(), RedisValue::BulkString(Vec::new()));

        assert_eq!(get_str_field(&map, "body"), None);
        assert_eq!(get_str_field(&map, "absent"), None);
    }

    #[test]
    fn test_get_str_field_non_string_value() {
        let mut map = HashMap::new();
        map.insert("count".to_string(), RedisValue::Int(3));

        assert_eq!(get_str_field(&map, "count"), None);
    }
}
