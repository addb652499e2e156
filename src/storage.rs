//! Payload store for oversized event payloads.
//!
//! Payloads too large to ride inside a queue message are written here at
//! admission time and fetched back by the worker. The [`PayloadStore`] trait
//! is the seam; the Redis-backed adapter is the production implementation and
//! [`MemoryPayloadStore`] backs tests.
//!
//! Object keys follow `raw/YYYY-MM-DD/<event_id>.json` (UTC date at write
//! time), and stored objects carry a TTL standing in for a lifecycle expiry
//! policy.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use thiserror::Error;
use tracing::{debug, error};

/// Errors raised by payload store operations.
///
/// `NotFound` is deliberately distinct from `Backend`: a missing object will
/// stay missing on every redelivery (poison), while a backend fault is
/// expected to clear (retriable).
#[derive(Debug, Error)]
pub enum PayloadStoreError {
    #[error("payload object not found")]
    NotFound,

    #[error("payload store error: {0}")]
    Backend(String),
}

/// Abstract object store for payload bytes.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Write `bytes` at `key`, overwriting any existing object.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), PayloadStoreError>;

    /// Read the object at `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, PayloadStoreError>;
}

/// Synthesize the object key for an event's payload.
pub fn object_key(event_id: &str, date: NaiveDate) -> String {
    format!("raw/{}/{}.json", date.format("%Y-%m-%d"), event_id)
}

/// Redis-backed payload store.
///
/// Objects live under `fluxa:payloads:<bucket>/<key>` string keys with a TTL
/// acting as the lifecycle expiry.
pub struct RedisPayloadStore {
    pool: Pool,
    bucket: String,
    ttl_secs: u64,
    timeout: Duration,
}

impl RedisPayloadStore {
    pub fn new(pool: Pool, bucket: impl Into<String>, ttl_secs: u64, timeout: Duration) -> Self {
        Self {
            pool,
            bucket: bucket.into(),
            ttl_secs,
            timeout,
        }
    }

    /// The logical bucket name recorded in queue messages.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn redis_key(&self, key: &str) -> String {
        format!("fluxa:payloads:{}/{}", self.bucket, key)
    }
}

#[async_trait]
impl PayloadStore for RedisPayloadStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), PayloadStoreError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for payload write");
            PayloadStoreError::Backend(e.to_string())
        })?;

        let redis_key = self.redis_key(key);
        let mut set_cmd = cmd("SET");
        set_cmd
            .arg(&redis_key)
            .arg(bytes)
            .arg("EX")
            .arg(self.ttl_secs);
        let write = set_cmd.query_async(&mut conn);

        let _: () = tokio::time::timeout(self.timeout, write)
            .await
            .map_err(|_| PayloadStoreError::Backend("write timed out".to_string()))?
            .map_err(|e| {
                error!(key = %redis_key, error = %e, "Payload write failed");
                PayloadStoreError::Backend(e.to_string())
            })?;

        debug!(key = %key, size = bytes.len(), "Payload stored");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, PayloadStoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| PayloadStoreError::Backend(e.to_string()))?;

        let redis_key = self.redis_key(key);
        let mut get_cmd = cmd("GET");
        get_cmd.arg(&redis_key);
        let read = get_cmd.query_async(&mut conn);
        let bytes: Option<Vec<u8>> = tokio::time::timeout(self.timeout, read)
            .await
            .map_err(|_| PayloadStoreError::Backend("fetch timed out".to_string()))?
            .map_err(|e| PayloadStoreError::Backend(e.to_string()))?;

        bytes.ok_or(PayloadStoreError::NotFound)
    }
}

/// In-memory payload store for tests.
#[derive(Default)]
pub struct MemoryPayloadStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryPayloadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove an object, simulating lifecycle expiry.
    pub fn expire(&self, key: &str) {
        self.objects.write().unwrap().remove(key);
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PayloadStore for MemoryPayloadStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), PayloadStoreError> {
        self.objects
            .write()
            .unwrap()
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, PayloadStoreError> {
        self.objects
            .read()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or(PayloadStoreError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key_format() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(object_key("evt-1", date), "raw/2024-03-07/evt-1.json");
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryPayloadStore::new();
        store.put("raw/2024-01-01/a.json", b"payload").await.unwrap();

        let bytes = store.get("raw/2024-01-01/a.json").await.unwrap();
        assert_eq!(bytes, b"payload");
    }

    #[tokio::test]
    async fn test_memory_store_missing_object() {
        let store = MemoryPayloadStore::new();

        assert!(matches!(
            store.get("raw/2024-01-01/missing.json").await,
            Err(PayloadStoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_memory_store_expiry() {
        let store = MemoryPayloadStore::new();
        store.put("k", b"v").await.unwrap();
        store.expire("k");

        assert!(matches!(store.get("k").await, Err(PayloadStoreError::NotFound)));
    }
}
