//! Queue message wire format.
//!
//! A [`QueueMessage`] is the JSON body carried through the event stream. It
//! references its payload either inline or by payload-store coordinates, and
//! always carries the SHA-256 digest of the canonical payload bytes so the
//! consumer can verify integrity end to end.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Where the payload bytes live relative to the queue message.
///
/// Unknown values deserialize to [`PayloadMode::Unknown`] instead of failing,
/// so the processor can record the poison reason against the event's ledger
/// entry rather than discarding the whole message as unparseable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PayloadMode {
    /// Payload bytes are carried in `payload_inline`
    #[serde(rename = "INLINE")]
    Inline,

    /// Payload bytes live in the payload store at `s3_bucket` / `s3_key`
    #[serde(rename = "S3")]
    S3,

    /// Unrecognized disposition tag
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl<'de> Deserialize<'de> for PayloadMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tag = String::deserialize(deserializer)?;
        Ok(Self::parse(&tag).unwrap_or(PayloadMode::Unknown))
    }
}

impl PayloadMode {
    /// Wire / database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadMode::Inline => "INLINE",
            PayloadMode::S3 => "S3",
            PayloadMode::Unknown => "UNKNOWN",
        }
    }

    /// Parse the database representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INLINE" => Some(PayloadMode::Inline),
            "S3" => Some(PayloadMode::S3),
            _ => None,
        }
    }
}

/// The message enqueued by admission and consumed by the worker.
///
/// Exactly one of `payload_inline` / (`s3_bucket`, `s3_key`) is populated,
/// matching `payload_mode`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub event_id: String,
    pub correlation_id: String,
    pub payload_mode: PayloadMode,

    /// Hex-encoded SHA-256 of the canonical payload bytes
    pub payload_sha256: String,

    /// Canonicalized event JSON, present iff mode is INLINE
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_inline: Option<String>,

    /// Payload store coordinates, present iff mode is S3
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3_key: Option<String>,

    /// When admission accepted the event (RFC 3339 UTC)
    pub received_at: DateTime<Utc>,
}

/// Errors raised while decoding a queue message body.
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("failed to decode message body: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("message is missing required field: {0}")]
    MissingField(&'static str),
}

impl QueueMessage {
    /// Parse and check a raw message body.
    ///
    /// This is the single place message-shape requirements are enforced; a
    /// body that fails here has no stable event identity and is dead-lettered
    /// without a ledger entry.
    pub fn parse(body: &str) -> Result<Self, MessageError> {
        let msg: QueueMessage = serde_json::from_str(body)?;

        if msg.event_id.is_empty() {
            return Err(MessageError::MissingField("event_id"));
        }
        if msg.correlation_id.is_empty() {
            return Err(MessageError::MissingField("correlation_id"));
        }
        if msg.payload_sha256.is_empty() {
            return Err(MessageError::MissingField("payload_sha256"));
        }

        Ok(msg)
    }
}

/// Hex-encoded SHA-256 digest of `bytes` (64 lowercase hex chars).
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inline_body() -> String {
        r#"{
            "event_id": "evt-1",
            "correlation_id": "corr-1",
            "payload_mode": "INLINE",
            "payload_sha256": "abc",
            "payload_inline": "{}",
            "received_at": "2024-01-01T00:00:00Z"
        }"#
        .to_string()
    }

    #[test]
    fn test_parse_inline_message() {
        let msg = QueueMessage::parse(&inline_body()).unwrap();

        assert_eq!(msg.event_id, "evt-1");
        assert_eq!(msg.payload_mode, PayloadMode::Inline);
        assert_eq!(msg.payload_inline.as_deref(), Some("{}"));
        assert!(msg.s3_key.is_none());
    }

    #[test]
    fn test_parse_rejects_missing_event_id() {
        let body = inline_body().replace("evt-1", "");

        match QueueMessage::parse(&body) {
            Err(MessageError::MissingField("event_id")) => {}
            other => panic!("expected missing event_id, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        assert!(matches!(
            QueueMessage::parse("not json"),
            Err(MessageError::Decode(_))
        ));
    }

    #[test]
    fn test_unknown_payload_mode_parses_as_unknown() {
        let body = inline_body().replace("INLINE", "CARRIER_PIGEON");
        let msg = QueueMessage::parse(&body).unwrap();

        assert_eq!(msg.payload_mode, PayloadMode::Unknown);
    }

    #[test]
    fn test_serialize_skips_absent_coordinates() {
        let msg = QueueMessage::parse(&inline_body()).unwrap();
        let json = serde_json::to_string(&msg).unwrap();

        assert!(!json.contains("s3_bucket"));
        assert!(!json.contains("s3_key"));
        assert!(json.contains("payload_inline"));
    }

    #[test]
    fn test_payload_mode_round_trip() {
        assert_eq!(PayloadMode::parse("INLINE"), Some(PayloadMode::Inline));
        assert_eq!(PayloadMode::parse("S3"), Some(PayloadMode::S3));
        assert_eq!(PayloadMode::parse("FTP"), None);
        assert_eq!(PayloadMode::Inline.as_str(), "INLINE");
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        // sha256("") is the well-known empty-input digest
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(sha256_hex(b"hello").len(), 64);
    }
}
