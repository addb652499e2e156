//! # Fluxa Event Pipeline
//!
//! An exactly-once ingestion pipeline for transaction events.
//!
//! ## Architecture
//!
//! ```text
//! Client -> HTTP API -> Redis Stream -> Worker -> Postgres (+ notification webhook)
//!                          |                ^
//!                          v                |
//!                     payload store (oversized payloads)
//! ```
//!
//! The HTTP front door validates and admits events, the stream decouples
//! producers from consumers, and the worker persists each event exactly once
//! behind a two-phase idempotency ledger.
//!
//! ## Modules
//!
//! - [`event`]: Event model and validation
//! - [`message`]: Queue message wire format and payload digest
//! - [`error`]: Failure taxonomy (retriable vs poison)
//! - [`ledger`]: Idempotency ledger (claim / commit primitives)
//! - [`ingest`]: Admission, payload routing, enqueue
//! - [`processor`]: Per-message processing core
//! - [`queue`] / [`dlq`]: Redis Streams transport adapter and dead-letter stream
//! - [`storage`]: Payload store for offloaded payloads
//! - [`notify`]: Post-persistence notification publisher

pub mod config;
pub mod db;
pub mod dlq;
pub mod error;
pub mod event;
pub mod ingest;
pub mod ledger;
pub mod message;
pub mod notify;
pub mod processor;
pub mod queue;
pub mod shutdown;
pub mod storage;

pub use error::{IngestError, PoisonReason, ProcessError};
pub use event::Event;
pub use message::{PayloadMode, QueueMessage};

/// Default Redis stream name for admitted events.
pub const DEFAULT_EVENT_STREAM: &str = "fluxa:events";

/// Default consumer group name for workers.
pub const DEFAULT_CONSUMER_GROUP: &str = "fluxa_workers";

/// Default Redis stream name for dead-lettered messages.
pub const DEFAULT_DLQ_STREAM: &str = "fluxa:events:dlq";

/// Inline payload ceiling: payloads up to and including this many bytes ride
/// inside the queue message; larger ones are offloaded to the payload store.
pub const MAX_INLINE_BYTES: usize = 262_144;

/// Register descriptions for every metric the pipeline emits.
///
/// Call once at startup in each binary. Emission works without a recorder
/// installed; this only improves exposition output.
pub fn register_metrics() {
    use metrics::{describe_counter, describe_histogram};

    describe_counter!("ingest_success_total", "Events admitted and enqueued");
    describe_counter!("ingest_failure_total", "Admission failures by error kind");
    describe_counter!("payload_inline_total", "Payloads carried inline in the queue message");
    describe_counter!("payload_offloaded_total", "Payloads offloaded to the payload store");
    describe_histogram!("ingest_latency_ms", "Wall time of a single admission");
    describe_counter!("processed_success_total", "Events persisted and committed");
    describe_counter!("processed_duplicate_total", "Deliveries skipped as already done");
    describe_counter!("processed_failure_total", "Processing failures by error kind");
    describe_counter!("dead_lettered_total", "Messages moved to the dead-letter stream");
    describe_histogram!("process_latency_ms", "Wall time of a single message");
    describe_histogram!("db_latency_ms", "Wall time of the event insert");
}
