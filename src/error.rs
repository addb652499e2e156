//! Failure taxonomy for the pipeline.
//!
//! Every failure the core can produce maps to one variant here. The split
//! that matters operationally is retriable vs poison: a retriable failure is
//! expected to resolve on redelivery (network, transient DB lock, payload
//! store hiccup), while a poison failure will fail identically forever
//! (malformed body, digest mismatch, validation violation). The worker batch
//! loop is the only place this classification is turned into transport
//! actions; individual steps never ack or nack on their own.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::db::DbError;
use crate::event::ValidationError;
use crate::ledger::LedgerError;
use crate::queue::QueueError;
use crate::storage::PayloadStoreError;

/// Failures surfaced by ingest admission.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Request body is not valid JSON for an event
    #[error("invalid JSON: {0}")]
    MalformedRequest(#[source] serde_json::Error),

    /// Event parsed but violated an admission rule
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Canonical serialization of the event failed
    #[error("failed to serialize event: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Oversized payload could not be written to the payload store
    #[error("payload store write failed: {0}")]
    StoreWrite(#[source] PayloadStoreError),

    /// Queue send failed after the payload was routed
    #[error("queue send failed: {0}")]
    QueueSend(#[source] QueueError),
}

impl IngestError {
    /// Short label used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestError::MalformedRequest(_) => "parse_error",
            IngestError::Validation(_) => "validation_error",
            IngestError::Serialization(_) => "serialization_error",
            IngestError::StoreWrite(_) => "store_error",
            IngestError::QueueSend(_) => "queue_error",
        }
    }
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let status = match &self {
            IngestError::MalformedRequest(_) | IngestError::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            IngestError::Serialization(_)
            | IngestError::StoreWrite(_)
            | IngestError::QueueSend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Infrastructure detail stays in the logs, not the response body.
        let body = match &self {
            IngestError::Validation(violation) => json!({
                "error": self.to_string(),
                "field": violation.field,
                "code": violation.code,
            }),
            IngestError::MalformedRequest(_) => json!({ "error": self.to_string() }),
            _ => json!({ "error": "internal server error" }),
        };

        (status, Json(body)).into_response()
    }
}

/// Deterministic failure reasons recorded in the ledger.
///
/// The string form is stored in `idempotency_keys.error_reason` and must stay
/// stable; operators triage dead letters by these values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonReason {
    /// Message body failed to parse or lacked required fields
    ParseError,
    /// INLINE message without inline payload bytes
    MissingPayload,
    /// S3 message without an object key
    MissingObjectKey,
    /// Disposition tag was neither INLINE nor S3
    InvalidPayloadMode,
    /// Fetched payload bytes do not hash to the carried digest
    HashMismatch,
    /// Payload bytes are not a deserializable event
    UnmarshalError,
    /// Event deserialized but failed re-validation
    ValidationFailed,
    /// Offloaded payload object no longer exists in the store
    PayloadGone,
}

impl PoisonReason {
    /// Stable reason string recorded in the ledger.
    pub fn as_str(&self) -> &'static str {
        match self {
            PoisonReason::ParseError => "parse_error",
            PoisonReason::MissingPayload => "missing_payload",
            PoisonReason::MissingObjectKey => "missing_s3_key",
            PoisonReason::InvalidPayloadMode => "invalid_payload_mode",
            PoisonReason::HashMismatch => "hash_mismatch",
            PoisonReason::UnmarshalError => "unmarshal_error",
            PoisonReason::ValidationFailed => "validation_error",
            PoisonReason::PayloadGone => "payload_gone",
        }
    }
}

impl std::fmt::Display for PoisonReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failures surfaced by the per-message processing core.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Ledger transaction failed (deadlock, connection loss, timeout)
    #[error("ledger operation failed: {0}")]
    LedgerTransient(#[source] LedgerError),

    /// Event insert failed transiently
    #[error("event insert failed: {0}")]
    PersistTransient(#[source] DbError),

    /// Offloaded payload fetch failed transiently
    #[error("payload fetch failed: {0}")]
    StoreFetch(#[source] PayloadStoreError),

    /// Deterministic failure; the ledger has been marked `failed`
    #[error("poison message: {0}")]
    Poison(PoisonReason),
}

impl ProcessError {
    /// Whether redelivering the same message can plausibly succeed.
    ///
    /// The worker loop acks poison outcomes and leaves retriable ones pending
    /// for redelivery; nothing else in the pipeline makes that call.
    pub fn is_retriable(&self) -> bool {
        !matches!(self, ProcessError::Poison(_))
    }

    /// Short label used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessError::LedgerTransient(_) => "ledger_error",
            ProcessError::PersistTransient(_) => "db_error",
            ProcessError::StoreFetch(_) => "store_fetch_error",
            ProcessError::Poison(reason) => reason.as_str(),
        }
    }
}
