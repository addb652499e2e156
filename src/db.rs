//! Postgres event store.
//!
//! Owns the `events` table: the worker writes each event at most once via
//! `INSERT ... ON CONFLICT (event_id) DO NOTHING` (the belt-and-braces layer
//! under the idempotency ledger), and the read path serves events back by
//! identifier.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;

use crate::event::Event;
use crate::message::PayloadMode;

/// Connections are recycled after this long to survive transparent failover.
const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(5 * 60);

/// Errors raised by event store operations.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("database query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("database operation timed out")]
    Timeout,

    #[error("failed to encode metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("stored payload_mode is invalid: {0}")]
    InvalidPayloadMode(String),
}

/// A persisted event, as served by the read path.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    pub event_id: String,
    pub correlation_id: String,
    pub user_id: String,
    pub amount: f64,
    pub currency: String,
    pub merchant: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    pub payload_mode: PayloadMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Raw `events` row, decoded before metadata and mode parsing.
#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: String,
    correlation_id: String,
    user_id: String,
    amount: f64,
    currency: String,
    merchant: String,
    ts: DateTime<Utc>,
    metadata_json: String,
    payload_mode: String,
    s3_key: Option<String>,
    created_at: DateTime<Utc>,
}

impl EventRow {
    fn into_record(self) -> Result<EventRecord, DbError> {
        let metadata: HashMap<String, Value> = serde_json::from_str(&self.metadata_json)?;
        let payload_mode = PayloadMode::parse(&self.payload_mode)
            .ok_or(DbError::InvalidPayloadMode(self.payload_mode.clone()))?;

        Ok(EventRecord {
            event_id: self.event_id,
            correlation_id: self.correlation_id,
            user_id: self.user_id,
            amount: self.amount,
            currency: self.currency,
            merchant: self.merchant,
            timestamp: self.ts,
            metadata: if metadata.is_empty() { None } else { Some(metadata) },
            payload_mode,
            s3_key: self.s3_key,
            created_at: self.created_at,
        })
    }
}

/// Connect a bounded pool with capped connection lifetime.
pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .max_lifetime(MAX_CONNECTION_LIFETIME)
        .connect(url)
        .await
}

/// Event store client.
#[derive(Clone)]
pub struct Db {
    pool: PgPool,
    op_timeout: Duration,
}

impl Db {
    pub fn new(pool: PgPool, op_timeout: Duration) -> Self {
        Self { pool, op_timeout }
    }

    /// The underlying pool, shared with the ledger.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert an event row.
    ///
    /// `event_id` is passed separately because the queue message's identifier
    /// is authoritative over whatever the payload carried. A duplicate insert
    /// is a no-op by the unique key, which is exactly what redelivery after a
    /// mid-flight crash needs.
    pub async fn insert_event(
        &self,
        event: &Event,
        event_id: &str,
        correlation_id: &str,
        payload_mode: PayloadMode,
        s3_key: Option<&str>,
    ) -> Result<(), DbError> {
        let metadata_json = match &event.metadata {
            Some(metadata) => serde_json::to_string(metadata)?,
            None => "{}".to_string(),
        };

        let query = sqlx::query(
            "INSERT INTO events ( \
                 event_id, correlation_id, user_id, amount, currency, merchant, \
                 ts, metadata_json, payload_mode, s3_key, created_at \
             ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
             ON CONFLICT (event_id) DO NOTHING",
        )
        .bind(event_id)
        .bind(correlation_id)
        .bind(&event.user_id)
        .bind(event.amount)
        .bind(&event.currency)
        .bind(&event.merchant)
        .bind(event.timestamp)
        .bind(&metadata_json)
        .bind(payload_mode.as_str())
        .bind(s3_key)
        .bind(Utc::now())
        .execute(&self.pool);

        tokio::time::timeout(self.op_timeout, query)
            .await
            .map_err(|_| DbError::Timeout)??;

        Ok(())
    }

    /// Fetch a persisted event by identifier.
    pub async fn get_event(&self, event_id: &str) -> Result<Option<EventRecord>, DbError> {
        let query = sqlx::query_as::<_, EventRow>(
            "SELECT event_id, correlation_id, user_id, amount, currency, merchant, \
                    ts, metadata_json, payload_mode, s3_key, created_at \
             FROM events WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool);

        let row = tokio::time::timeout(self.op_timeout, query)
            .await
            .map_err(|_| DbError::Timeout)??;

        row.map(EventRow::into_record).transpose()
    }

    /// Liveness probe used by the health endpoint.
    pub async fn ping(&self) -> Result<(), DbError> {
        let query = sqlx::query("SELECT 1").execute(&self.pool);

        tokio::time::timeout(self.op_timeout, query)
            .await
            .map_err(|_| DbError::Timeout)??;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_record_serializes_without_absent_optionals() {
        let record = EventRecord {
            event_id: "evt-1".to_string(),
            correlation_id: "corr-1".to_string(),
            user_id: "u1".to_string(),
            amount: 10.0,
            currency: "USD".to_string(),
            merchant: "m1".to_string(),
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            metadata: None,
            payload_mode: PayloadMode::Inline,
            s3_key: None,
            created_at: "2024-01-01T00:00:01Z".parse().unwrap(),
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"payload_mode\":\"INLINE\""));
        assert!(!json.contains("s3_key"));
        assert!(!json.contains("metadata"));
    }
}
