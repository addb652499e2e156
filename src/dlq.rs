//! Dead letter stream for undeliverable messages.
//!
//! Two kinds of messages land here: bodies that failed parsing (no stable
//! event identity, so no ledger row can record the failure) and messages that
//! exhausted their receive budget on retriable errors. Deterministic poison
//! failures with a known event id are recorded in the idempotency ledger
//! instead and never reach this stream.
//!
//! # Example
//!
//! ```rust,ignore
//! use fluxa::dlq::DeadLetterQueue;
//!
//! let dlq = DeadLetterQueue::new(redis_pool, "fluxa:events:dlq");
//! dlq.push(&entry).await?;
//!
//! // Later, inspect out of band
//! let dead = dlq.list(10, 0).await?;
//! ```

use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, error, info};

/// Maximum entries to keep in the dead letter stream (older entries are trimmed)
const DLQ_MAX_LEN: usize = 10_000;

/// A message being moved to the dead letter stream.
#[derive(Debug, Clone)]
pub struct DeadLetter<'a> {
    /// Raw message body as it arrived, possibly unparseable
    pub body: &'a str,

    /// Why the message was dead-lettered (e.g., "parse_error",
    /// "max_receives_exceeded")
    pub reason: &'a str,

    /// Delivery count at the time of dead-lettering
    pub delivery_count: u64,

    /// Original stream entry id
    pub original_id: &'a str,

    /// Transport attributes, when the entry carried them
    pub event_id: Option<&'a str>,
    pub correlation_id: Option<&'a str>,
}

/// Errors raised by dead letter stream operations.
#[derive(Debug, Error)]
pub enum DlqError {
    #[error("Redis connection error: {0}")]
    Connection(String),

    #[error("Redis command error: {0}")]
    Redis(String),
}

/// Dead letter stream client.
#[derive(Clone)]
pub struct DeadLetterQueue {
    pool: Pool,
    stream: String,
}

impl DeadLetterQueue {
    pub fn new(pool: Pool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }

    /// Append a dead letter, trimming the stream to its size bound.
    pub async fn push(&self, letter: &DeadLetter<'_>) -> Result<String, DlqError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for DLQ");
            DlqError::Connection(e.to_string())
        })?;

        let failed_at = chrono::Utc::now().to_rfc3339();

        let id: String = cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAX_LEN)
            .arg("*")
            .arg("body")
            .arg(letter.body)
            .arg("reason")
            .arg(letter.reason)
            .arg("delivery_count")
            .arg(letter.delivery_count)
            .arg("failed_at")
            .arg(&failed_at)
            .arg("original_id")
            .arg(letter.original_id)
            .arg("event_id")
            .arg(letter.event_id.unwrap_or(""))
            .arg("correlation_id")
            .arg(letter.correlation_id.unwrap_or(""))
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to add message to DLQ");
                DlqError::Redis(e.to_string())
            })?;

        info!(
            dlq_id = %id,
            original_id = %letter.original_id,
            event_id = ?letter.event_id,
            reason = %letter.reason,
            delivery_count = letter.delivery_count,
            "Message moved to dead letter stream"
        );

        Ok(id)
    }

    /// Number of entries currently in the dead letter stream.
    pub async fn count(&self) -> Result<u64, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let count: u64 = cmd("XLEN")
            .arg(&self.stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Redis(e.to_string()))?;

        Ok(count)
    }

    /// List entries as (stream_id, fields) pairs.
    pub async fn list(&self, count: usize, offset: usize) -> Result<Vec<(String, Value)>, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(&self.stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count + offset)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Redis(e.to_string()))?;

        let result: Vec<(String, Value)> = entries
            .into_iter()
            .skip(offset)
            .take(count)
            .map(|(id, fields)| (id, fields_to_json(fields)))
            .collect();

        debug!(count = result.len(), "Retrieved DLQ entries");
        Ok(result)
    }

    /// Fetch a single entry by stream id.
    pub async fn get(&self, id: &str) -> Result<Option<Value>, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(&self.stream)
            .arg(id)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Redis(e.to_string()))?;

        Ok(entries
            .into_iter()
            .next()
            .map(|(_, fields)| fields_to_json(fields)))
    }

    /// Remove an entry after manual review or replay.
    pub async fn remove(&self, id: &str) -> Result<bool, DlqError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DlqError::Connection(e.to_string()))?;

        let removed: u64 = cmd("XDEL")
            .arg(&self.stream)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DlqError::Redis(e.to_string()))?;

        if removed > 0 {
            info!(id = %id, "Removed entry from DLQ");
            Ok(true)
        } else {
            debug!(id = %id, "Entry not found in DLQ");
            Ok(false)
        }
    }
}

/// Render raw stream fields as a JSON object, parsing what parses.
fn fields_to_json(fields: Vec<(String, String)>) -> Value {
    let mut obj = serde_json::Map::new();
    for (key, value) in fields {
        if key == "body" {
            if let Ok(body) = serde_json::from_str::<Value>(&value) {
                obj.insert(key, body);
            } else {
                obj.insert(key, Value::String(value));
            }
        } else if key == "delivery_count" {
            if let Ok(n) = value.parse::<u64>() {
                obj.insert(key, json!(n));
            } else {
                obj.insert(key, Value::String(value));
            }
        } else {
            obj.insert(key, Value::String(value));
        }
    }
    Value::Object(obj)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fields_to_json_parses_body_and_count() {
        let fields = vec![
            ("body".to_string(), r#"{"event_id":"evt-1"}"#.to_string()),
            ("delivery_count".to_string(), "6".to_string()),
            ("reason".to_string(), "max_receives_exceeded".to_string()),
        ];

        let value = fields_to_json(fields);
        assert_eq!(value["body"]["event_id"], "evt-1");
        assert_eq!(value["delivery_count"], 6);
        assert_eq!(value["reason"], "max_receives_exceeded");
    }

    #[test]
    fn test_fields_to_json_keeps_unparseable_body_as_string() {
        let fields = vec![("body".to_string(), "not json".to_string())];

        let value = fields_to_json(fields);
        assert_eq!(value["body"], "not json");
    }
}
