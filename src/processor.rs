//! Per-message processing core.
//!
//! For each queue message the processor runs: ledger claim → payload
//! materialization → digest verification → deserialize → re-validate →
//! persist → ledger commit → best-effort notification. The outcome is either
//! [`Processed`] or a [`ProcessError`] that the worker loop maps to a
//! transport action; the processor itself never acks, nacks, or retries.
//!
//! Ordering guarantees per event: the event row is persisted before the
//! ledger records `success`, and a poison verdict is recorded in the ledger
//! before the error that triggers the ack is returned.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use metrics::{counter, histogram};
use tracing::{info, warn};

use crate::db::Db;
use crate::error::{PoisonReason, ProcessError};
use crate::event::Event;
use crate::ledger::{Claim, Ledger};
use crate::message::{sha256_hex, PayloadMode, QueueMessage};
use crate::notify::{Notification, Notifier};
use crate::storage::{PayloadStore, PayloadStoreError};

/// Successful outcomes of processing a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// Event persisted and committed by this invocation
    Completed,

    /// Ledger answered "already done"; no side effects
    AlreadyDone,
}

/// The event processing core.
pub struct Processor {
    db: Db,
    ledger: Ledger,
    store: Arc<dyn PayloadStore>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl Processor {
    pub fn new(
        db: Db,
        ledger: Ledger,
        store: Arc<dyn PayloadStore>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            db,
            ledger,
            store,
            notifier,
        }
    }

    /// Process one parsed queue message to completion.
    ///
    /// Deterministic failures mark the ledger `failed` before returning
    /// [`ProcessError::Poison`]; if that mark itself fails transiently the
    /// error is surfaced as retriable so the poison verdict is recorded on a
    /// later delivery rather than lost.
    pub async fn process(&self, msg: &QueueMessage) -> Result<Processed, ProcessError> {
        let started = Instant::now();

        match self
            .ledger
            .claim(&msg.event_id)
            .await
            .map_err(ProcessError::LedgerTransient)?
        {
            Claim::AlreadyDone => {
                info!(
                    event_id = %msg.event_id,
                    correlation_id = %msg.correlation_id,
                    "Event already processed, skipping"
                );
                counter!("processed_duplicate_total").increment(1);
                return Ok(Processed::AlreadyDone);
            }
            Claim::Fresh | Claim::Retry => {}
        }

        let result = self.run(msg).await;

        match &result {
            Ok(Processed::Completed) => {
                counter!("processed_success_total").increment(1);
                info!(
                    event_id = %msg.event_id,
                    correlation_id = %msg.correlation_id,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Event processed"
                );
            }
            Ok(Processed::AlreadyDone) => {}
            Err(err) => {
                counter!("processed_failure_total", "error" => err.kind()).increment(1);
                if let ProcessError::Poison(reason) = err {
                    // Record the verdict before the worker acks the message.
                    self.ledger
                        .mark_failed(&msg.event_id, reason.as_str())
                        .await
                        .map_err(ProcessError::LedgerTransient)?;
                }
            }
        }
        histogram!("process_latency_ms").record(started.elapsed().as_millis() as f64);

        result
    }

    async fn run(&self, msg: &QueueMessage) -> Result<Processed, ProcessError> {
        let payload = self.materialize_payload(msg).await?;

        let digest = sha256_hex(&payload);
        if digest != msg.payload_sha256 {
            warn!(
                event_id = %msg.event_id,
                expected = %msg.payload_sha256,
                calculated = %digest,
                "Payload digest mismatch"
            );
            return Err(ProcessError::Poison(PoisonReason::HashMismatch));
        }

        let event: Event = serde_json::from_slice(&payload)
            .map_err(|_| ProcessError::Poison(PoisonReason::UnmarshalError))?;

        // The queue is untrusted relative to the ingest-time validator.
        if let Err(violation) = event.validate(Utc::now()) {
            warn!(event_id = %msg.event_id, error = %violation, "Re-validation failed");
            return Err(ProcessError::Poison(PoisonReason::ValidationFailed));
        }

        let s3_key = match msg.payload_mode {
            PayloadMode::S3 => msg.s3_key.as_deref(),
            _ => None,
        };

        let db_started = Instant::now();
        // The message's event_id is authoritative; a no-op on conflict is the
        // crash-recovery path working as intended.
        self.db
            .insert_event(
                &event,
                &msg.event_id,
                &msg.correlation_id,
                msg.payload_mode,
                s3_key,
            )
            .await
            .map_err(ProcessError::PersistTransient)?;
        histogram!("db_latency_ms").record(db_started.elapsed().as_millis() as f64);

        if let Err(e) = self.ledger.mark_success(&msg.event_id).await {
            // Non-fatal: the event row exists, and redelivery re-enters with
            // a retry claim, no-ops the insert, and commits again.
            warn!(event_id = %msg.event_id, error = %e, "Failed to mark ledger success");
        }

        if let Some(notifier) = &self.notifier {
            let notification = Notification::processed(&msg.event_id, &msg.correlation_id);
            if let Err(e) = notifier.publish(&notification).await {
                warn!(event_id = %msg.event_id, error = %e, "Notification emit failed");
            }
        }

        Ok(Processed::Completed)
    }

    /// Produce the payload bytes named by the message.
    async fn materialize_payload(&self, msg: &QueueMessage) -> Result<Vec<u8>, ProcessError> {
        match msg.payload_mode {
            PayloadMode::Inline => msg
                .payload_inline
                .as_ref()
                .map(|payload| payload.clone().into_bytes())
                .ok_or(ProcessError::Poison(PoisonReason::MissingPayload)),

            PayloadMode::S3 => {
                let Some(key) = msg.s3_key.as_deref() else {
                    return Err(ProcessError::Poison(PoisonReason::MissingObjectKey));
                };

                match self.store.get(key).await {
                    Ok(bytes) => Ok(bytes),
                    Err(PayloadStoreError::NotFound) => {
                        warn!(event_id = %msg.event_id, key = %key, "Offloaded payload is gone");
                        Err(ProcessError::Poison(PoisonReason::PayloadGone))
                    }
                    Err(err) => Err(ProcessError::StoreFetch(err)),
                }
            }

            PayloadMode::Unknown => {
                Err(ProcessError::Poison(PoisonReason::InvalidPayloadMode))
            }
        }
    }
}
