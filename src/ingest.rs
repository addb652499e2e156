//! Ingest admission: the write side of the pipeline.
//!
//! [`IngestService::submit`] takes a raw request body and either admits the
//! event (exactly one durable queue message, at most one payload store write)
//! or rejects it before any side effect. Admission assigns identifiers,
//! validates, canonicalizes, digests, routes the payload by size, and
//! enqueues.
//!
//! The payload router is the size gate: payloads at or under the inline
//! ceiling ride inside the queue message; larger ones are written to the
//! payload store first and referenced by coordinates.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::IngestError;
use crate::event::Event;
use crate::message::{sha256_hex, PayloadMode, QueueMessage};
use crate::queue::QueueClient;
use crate::storage::{object_key, PayloadStore};

/// Response to a successful submission.
#[derive(Debug, Clone)]
pub struct IngestReceipt {
    pub event_id: String,
    pub correlation_id: String,
}

/// An event that passed admission, ready to be routed and enqueued.
#[derive(Debug)]
struct AdmittedEvent {
    event_id: String,
    correlation_id: String,
    payload_bytes: Vec<u8>,
    digest: String,
}

/// Where the payload ended up after routing.
#[derive(Debug)]
pub enum RoutedPayload {
    /// Carried inside the queue message
    Inline(String),

    /// Written to the payload store at these coordinates
    Offloaded { bucket: String, key: String },
}

/// Parse, identify, validate, and digest a raw request body.
///
/// No side effects: everything here is reversible, so a rejection leaves no
/// trace. The digest covers the canonical bytes with the assigned `event_id`
/// already in place, which is what makes processor-side verification
/// self-consistent.
fn admit(
    raw_body: &[u8],
    caller_correlation_id: Option<String>,
) -> Result<AdmittedEvent, IngestError> {
    let mut event: Event =
        serde_json::from_slice(raw_body).map_err(IngestError::MalformedRequest)?;

    let event_id = event
        .event_id
        .take()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    event.event_id = Some(event_id.clone());

    let correlation_id = caller_correlation_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    event.validate(Utc::now())?;

    let payload_bytes = event
        .canonical_bytes()
        .map_err(IngestError::Serialization)?;
    let digest = sha256_hex(&payload_bytes);

    Ok(AdmittedEvent {
        event_id,
        correlation_id,
        payload_bytes,
        digest,
    })
}

/// Choose a disposition for the payload bytes and place them.
///
/// Writes to the store only in the offloaded case; a write failure aborts
/// admission before any queue message exists.
pub async fn route_payload(
    store: &dyn PayloadStore,
    bucket: &str,
    max_inline_bytes: usize,
    event_id: &str,
    bytes: &[u8],
) -> Result<RoutedPayload, IngestError> {
    if bytes.len() <= max_inline_bytes {
        return Ok(RoutedPayload::Inline(
            String::from_utf8_lossy(bytes).into_owned(),
        ));
    }

    let key = object_key(event_id, Utc::now().date_naive());
    store
        .put(&key, bytes)
        .await
        .map_err(IngestError::StoreWrite)?;

    debug!(event_id = %event_id, key = %key, size = bytes.len(), "Payload offloaded");

    Ok(RoutedPayload::Offloaded {
        bucket: bucket.to_string(),
        key,
    })
}

/// The admission service held by the HTTP server.
#[derive(Clone)]
pub struct IngestService {
    queue: QueueClient,
    store: Arc<dyn PayloadStore>,
    bucket: String,
    max_inline_bytes: usize,
}

impl IngestService {
    pub fn new(
        queue: QueueClient,
        store: Arc<dyn PayloadStore>,
        bucket: impl Into<String>,
        max_inline_bytes: usize,
    ) -> Self {
        Self {
            queue,
            store,
            bucket: bucket.into(),
            max_inline_bytes,
        }
    }

    /// Admit one event for asynchronous processing.
    ///
    /// On success exactly one queue message exists. A caller retrying after
    /// an infrastructure error may resubmit with the same `event_id`; the
    /// ledger deduplicates downstream.
    pub async fn submit(
        &self,
        raw_body: &[u8],
        caller_correlation_id: Option<String>,
    ) -> Result<IngestReceipt, IngestError> {
        let started = Instant::now();

        let result = self.submit_inner(raw_body, caller_correlation_id).await;

        match &result {
            Ok(receipt) => {
                counter!("ingest_success_total").increment(1);
                info!(
                    event_id = %receipt.event_id,
                    correlation_id = %receipt.correlation_id,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Event enqueued"
                );
            }
            Err(err) => {
                counter!("ingest_failure_total", "error" => err.kind()).increment(1);
            }
        }
        histogram!("ingest_latency_ms").record(started.elapsed().as_millis() as f64);

        result
    }

    async fn submit_inner(
        &self,
        raw_body: &[u8],
        caller_correlation_id: Option<String>,
    ) -> Result<IngestReceipt, IngestError> {
        let admitted = admit(raw_body, caller_correlation_id)?;

        let routed = route_payload(
            self.store.as_ref(),
            &self.bucket,
            self.max_inline_bytes,
            &admitted.event_id,
            &admitted.payload_bytes,
        )
        .await?;

        let message = match routed {
            RoutedPayload::Inline(payload) => {
                counter!("payload_inline_total").increment(1);
                QueueMessage {
                    event_id: admitted.event_id.clone(),
                    correlation_id: admitted.correlation_id.clone(),
                    payload_mode: PayloadMode::Inline,
                    payload_sha256: admitted.digest,
                    payload_inline: Some(payload),
                    s3_bucket: None,
                    s3_key: None,
                    received_at: Utc::now(),
                }
            }
            RoutedPayload::Offloaded { bucket, key } => {
                counter!("payload_offloaded_total").increment(1);
                QueueMessage {
                    event_id: admitted.event_id.clone(),
                    correlation_id: admitted.correlation_id.clone(),
                    payload_mode: PayloadMode::S3,
                    payload_sha256: admitted.digest,
                    payload_inline: None,
                    s3_bucket: Some(bucket),
                    s3_key: Some(key),
                    received_at: Utc::now(),
                }
            }
        };

        self.queue
            .send(&message)
            .await
            .map_err(IngestError::QueueSend)?;

        Ok(IngestReceipt {
            event_id: admitted.event_id,
            correlation_id: admitted.correlation_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryPayloadStore;

    fn valid_body() -> Vec<u8> {
        format!(
            r#"{{
                "user_id": "u1",
                "amount": 10,
                "currency": "USD",
                "merchant": "m1",
                "timestamp": "{}"
            }}"#,
            Utc::now().to_rfc3339()
        )
        .into_bytes()
    }

    #[test]
    fn test_admit_assigns_event_id_when_absent() {
        let admitted = admit(&valid_body(), None).unwrap();

        assert!(!admitted.event_id.is_empty());
        assert!(Uuid::parse_str(&admitted.event_id).is_ok());
    }

    #[test]
    fn test_admit_keeps_caller_event_id() {
        let body = serde_json::json!({
            "event_id": "caller-chosen",
            "user_id": "u1",
            "amount": 10,
            "currency": "USD",
            "merchant": "m1",
            "timestamp": Utc::now().to_rfc3339(),
        });

        let admitted = admit(body.to_string().as_bytes(), None).unwrap();
        assert_eq!(admitted.event_id, "caller-chosen");
    }

    #[test]
    fn test_admit_keeps_caller_correlation_id() {
        let admitted = admit(&valid_body(), Some("corr-7".to_string())).unwrap();
        assert_eq!(admitted.correlation_id, "corr-7");
    }

    #[test]
    fn test_admit_rejects_malformed_json() {
        assert!(matches!(
            admit(b"not json", None),
            Err(IngestError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_admit_rejects_invalid_event() {
        let body = String::from_utf8(valid_body())
            .unwrap()
            .replace("\"amount\": 10", "\"amount\": 0");

        assert!(matches!(
            admit(body.as_bytes(), None),
            Err(IngestError::Validation(_))
        ));
    }

    #[test]
    fn test_admit_digest_covers_canonical_bytes() {
        let admitted = admit(&valid_body(), None).unwrap();

        assert_eq!(admitted.digest, sha256_hex(&admitted.payload_bytes));
        // Canonical bytes already carry the assigned id.
        let text = String::from_utf8(admitted.payload_bytes).unwrap();
        assert!(text.contains(&admitted.event_id));
    }

    #[tokio::test]
    async fn test_route_payload_at_threshold_stays_inline() {
        let store = MemoryPayloadStore::new();
        let bytes = vec![b'x'; 262_144];

        let routed = route_payload(&store, "bucket", 262_144, "evt-1", &bytes)
            .await
            .unwrap();

        assert!(matches!(routed, RoutedPayload::Inline(_)));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_route_payload_past_threshold_offloads() {
        let store = MemoryPayloadStore::new();
        let bytes = vec![b'x'; 262_145];

        let routed = route_payload(&store, "bucket", 262_144, "evt-1", &bytes)
            .await
            .unwrap();

        match routed {
            RoutedPayload::Offloaded { bucket, key } => {
                assert_eq!(bucket, "bucket");
                assert!(key.starts_with("raw/"));
                assert!(key.ends_with("/evt-1.json"));
                assert_eq!(store.get(&key).await.unwrap(), bytes);
            }
            other => panic!("expected offloaded payload, got {other:?}"),
        }
    }
}
