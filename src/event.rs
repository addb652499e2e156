//! Core event types for Fluxa.
//!
//! The [`Event`] struct represents a transaction event flowing through the
//! system. Events are ingested via HTTP, queued in Redis Streams, and
//! persisted by workers.
//!
//! # Example
//!
//! ```json
//! {
//!   "user_id": "u-1042",
//!   "amount": 19.99,
//!   "currency": "USD",
//!   "merchant": "acme-store",
//!   "timestamp": "2024-01-01T00:00:00Z",
//!   "metadata": {"channel": "web"}
//! }
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Upper bound on how far in the future an event timestamp may lie.
const MAX_FUTURE_SKEW_MINUTES: i64 = 5;

/// Upper bound on the number of metadata keys.
const MAX_METADATA_KEYS: usize = 10;

/// A transaction event submitted by a client.
///
/// `event_id` is optional on the way in; admission assigns one when the
/// caller omitted it. All other fields are required and checked by
/// [`Event::validate`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier, assigned at admission when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,

    /// Identifier of the user the transaction belongs to
    pub user_id: String,

    /// Transaction amount, strictly positive
    pub amount: f64,

    /// Currency code (e.g., "USD")
    pub currency: String,

    /// Merchant identifier
    pub merchant: String,

    /// When the transaction happened (RFC 3339)
    pub timestamp: DateTime<Utc>,

    /// Optional free-form metadata, at most ten keys
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
}

/// Machine-readable validation failure code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValidationCode {
    #[serde(rename = "MISSING_FIELD")]
    MissingField,

    #[serde(rename = "INVALID_VALUE")]
    InvalidValue,
}

/// A single validation failure: the offending field plus a code and reason.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("invalid event: {field} {reason}")]
pub struct ValidationError {
    pub field: &'static str,
    pub code: ValidationCode,
    pub reason: &'static str,
}

impl ValidationError {
    fn missing(field: &'static str, reason: &'static str) -> Self {
        Self {
            field,
            code: ValidationCode::MissingField,
            reason,
        }
    }

    fn invalid(field: &'static str, reason: &'static str) -> Self {
        Self {
            field,
            code: ValidationCode::InvalidValue,
            reason,
        }
    }
}

impl Event {
    /// Validate the event against the admission rules.
    ///
    /// Returns the first violation found. The check is total: an event that
    /// passes here is accepted everywhere downstream, and the processor runs
    /// the same check again after deserializing from the queue.
    ///
    /// `now` is passed in so the future-skew bound is testable.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        if self.user_id.is_empty() {
            return Err(ValidationError::missing("user_id", "cannot be empty"));
        }
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(ValidationError::invalid("amount", "must be greater than 0"));
        }
        if self.currency.is_empty() {
            return Err(ValidationError::missing("currency", "cannot be empty"));
        }
        if self.merchant.is_empty() {
            return Err(ValidationError::missing("merchant", "cannot be empty"));
        }
        if self.timestamp == DateTime::<Utc>::UNIX_EPOCH {
            return Err(ValidationError::missing("timestamp", "must be set"));
        }
        if self.timestamp > now + Duration::minutes(MAX_FUTURE_SKEW_MINUTES) {
            return Err(ValidationError::invalid(
                "timestamp",
                "must not be more than 5 minutes in the future",
            ));
        }
        if let Some(metadata) = &self.metadata {
            if metadata.len() > MAX_METADATA_KEYS {
                return Err(ValidationError::invalid(
                    "metadata",
                    "must not have more than 10 keys",
                ));
            }
        }
        Ok(())
    }

    /// Canonical serialized form of the event.
    ///
    /// Admission hashes exactly these bytes, and the processor verifies the
    /// fetched payload against that digest, so both sides must call this
    /// after `event_id` assignment.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_event() -> Event {
        Event {
            event_id: Some("evt-1".to_string()),
            user_id: "u1".to_string(),
            amount: 10.0,
            currency: "USD".to_string(),
            merchant: "m1".to_string(),
            timestamp: "2024-01-01T00:00:00Z".parse().unwrap(),
            metadata: None,
        }
    }

    fn now() -> DateTime<Utc> {
        "2024-01-01T00:01:00Z".parse().unwrap()
    }

    #[test]
    fn test_valid_event_passes() {
        assert!(valid_event().validate(now()).is_ok());
    }

    #[test]
    fn test_empty_user_id_rejected() {
        let mut event = valid_event();
        event.user_id = String::new();

        let err = event.validate(now()).unwrap_err();
        assert_eq!(err.field, "user_id");
        assert_eq!(err.code, ValidationCode::MissingField);
    }

    #[test]
    fn test_zero_amount_rejected() {
        let mut event = valid_event();
        event.amount = 0.0;

        let err = event.validate(now()).unwrap_err();
        assert_eq!(err.field, "amount");
        assert_eq!(err.code, ValidationCode::InvalidValue);
    }

    #[test]
    fn test_negative_amount_rejected() {
        let mut event = valid_event();
        event.amount = -3.5;

        assert_eq!(event.validate(now()).unwrap_err().field, "amount");
    }

    #[test]
    fn test_nan_amount_rejected() {
        let mut event = valid_event();
        event.amount = f64::NAN;

        assert_eq!(event.validate(now()).unwrap_err().field, "amount");
    }

    #[test]
    fn test_epoch_timestamp_rejected() {
        let mut event = valid_event();
        event.timestamp = DateTime::<Utc>::UNIX_EPOCH;

        let err = event.validate(now()).unwrap_err();
        assert_eq!(err.field, "timestamp");
        assert_eq!(err.code, ValidationCode::MissingField);
    }

    #[test]
    fn test_timestamp_at_future_bound_accepted() {
        let mut event = valid_event();
        event.timestamp = now() + Duration::minutes(5);

        assert!(event.validate(now()).is_ok());
    }

    #[test]
    fn test_timestamp_past_future_bound_rejected() {
        let mut event = valid_event();
        event.timestamp = now() + Duration::minutes(5) + Duration::nanoseconds(1);

        let err = event.validate(now()).unwrap_err();
        assert_eq!(err.field, "timestamp");
        assert_eq!(err.code, ValidationCode::InvalidValue);
    }

    #[test]
    fn test_metadata_at_key_bound_accepted() {
        let mut event = valid_event();
        let metadata: HashMap<String, Value> =
            (0..10).map(|i| (format!("k{i}"), json!(i))).collect();
        event.metadata = Some(metadata);

        assert!(event.validate(now()).is_ok());
    }

    #[test]
    fn test_metadata_past_key_bound_rejected() {
        let mut event = valid_event();
        let metadata: HashMap<String, Value> =
            (0..11).map(|i| (format!("k{i}"), json!(i))).collect();
        event.metadata = Some(metadata);

        assert_eq!(event.validate(now()).unwrap_err().field, "metadata");
    }

    #[test]
    fn test_deserialize_without_event_id() {
        let event: Event = serde_json::from_str(
            r#"{
                "user_id": "u1",
                "amount": 10,
                "currency": "USD",
                "merchant": "m1",
                "timestamp": "2024-01-01T00:00:00Z"
            }"#,
        )
        .unwrap();

        assert!(event.event_id.is_none());
        assert_eq!(event.user_id, "u1");
    }

    #[test]
    fn test_missing_required_field_fails_deserialize() {
        let result: Result<Event, _> = serde_json::from_str(
            r#"{"user_id": "u1", "amount": 10, "currency": "USD", "merchant": "m1"}"#,
        );

        assert!(result.is_err());
    }

    #[test]
    fn test_canonical_bytes_include_event_id() {
        let event = valid_event();
        let bytes = event.canonical_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.contains("\"event_id\":\"evt-1\""));
    }

    #[test]
    fn test_canonical_bytes_omit_absent_optionals() {
        let mut event = valid_event();
        event.event_id = None;
        event.metadata = None;
        let text = String::from_utf8(event.canonical_bytes().unwrap()).unwrap();

        assert!(!text.contains("event_id"));
        assert!(!text.contains("metadata"));
    }
}
