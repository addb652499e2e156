//! Idempotency ledger: the basis of exactly-once processing.
//!
//! Every event's processing status lives in one `idempotency_keys` row with
//! status `processing`, `success`, or `failed`. [`Ledger::claim`] is the
//! atomic admission gate: at most one caller observes [`Claim::Fresh`] or
//! [`Claim::Retry`] for a given event within the liveness window, and after a
//! successful commit every future claim answers [`Claim::AlreadyDone`].
//!
//! State machine:
//!
//! ```text
//! (absent)    -> processing(attempts=1)    fresh claim
//! processing  -> success                   mark_success
//! processing  -> failed(reason)            mark_failed
//! processing  -> processing(attempts+1)    stale claim past the liveness window
//! failed      -> processing(attempts+1)    retry of a prior poison
//! success     -> success                   terminal
//! ```

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;
use tracing::{debug, warn};

/// Bounded restarts when a fresh insert races another worker's insert.
const INSERT_RACE_RETRIES: u32 = 3;

/// Error reasons are truncated to this many characters before storage.
const MAX_ERROR_REASON_LEN: usize = 500;

/// Errors raised by ledger operations. All of them are transient from the
/// caller's point of view; the ledger never converts a transaction failure
/// into a processing verdict.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger query failed: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("ledger operation timed out")]
    Timeout,

    #[error("ledger row has invalid status: {0}")]
    InvalidStatus(String),

    #[error("claim insert kept colliding after {0} attempts")]
    InsertRace(u32),
}

/// Processing status of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    Processing,
    Success,
    Failed,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Processing => "processing",
            LedgerStatus::Success => "success",
            LedgerStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Result<Self, LedgerError> {
        match s {
            "processing" => Ok(LedgerStatus::Processing),
            "success" => Ok(LedgerStatus::Success),
            "failed" => Ok(LedgerStatus::Failed),
            other => Err(LedgerError::InvalidStatus(other.to_string())),
        }
    }
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// First time this event has been seen; caller must process it
    Fresh,

    /// Event is done, or a live peer is processing it; caller must skip
    AlreadyDone,

    /// Prior attempt failed or went stale; caller must process it
    Retry,
}

/// A row from the `idempotency_keys` table.
#[derive(Debug, Clone)]
pub struct LedgerEntry {
    pub event_id: String,
    pub status: LedgerStatus,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub attempts: i32,
    pub error_reason: Option<String>,
}

/// The idempotency ledger over Postgres.
#[derive(Clone)]
pub struct Ledger {
    pool: PgPool,
    liveness_window: chrono::Duration,
    op_timeout: Duration,
}

impl Ledger {
    /// Create a ledger handle.
    ///
    /// `liveness_window` is how long a `processing` claim shields the event
    /// from concurrent reprocessing; it must stay below the transport's
    /// visibility timeout.
    pub fn new(pool: PgPool, liveness_window: Duration, op_timeout: Duration) -> Self {
        Self {
            pool,
            liveness_window: chrono::Duration::from_std(liveness_window)
                .unwrap_or_else(|_| chrono::Duration::seconds(60)),
            op_timeout,
        }
    }

    /// Atomically claim an event for processing.
    ///
    /// Runs a single transaction: the row is locked with `SELECT ... FOR
    /// UPDATE`, then inserted or transitioned according to the state machine.
    /// An insert that collides with a concurrent claim restarts the
    /// transaction (bounded).
    pub async fn claim(&self, event_id: &str) -> Result<Claim, LedgerError> {
        tokio::time::timeout(self.op_timeout, self.claim_inner(event_id))
            .await
            .map_err(|_| LedgerError::Timeout)?
    }

    async fn claim_inner(&self, event_id: &str) -> Result<Claim, LedgerError> {
        for attempt in 0..INSERT_RACE_RETRIES {
            let mut tx = self.pool.begin().await?;
            let now = Utc::now();

            let row: Option<(String, DateTime<Utc>, i32)> = sqlx::query_as(
                "SELECT status, last_seen_at, attempts \
                 FROM idempotency_keys WHERE event_id = $1 FOR UPDATE",
            )
            .bind(event_id)
            .fetch_optional(&mut *tx)
            .await?;

            let Some((status, last_seen_at, _attempts)) = row else {
                let inserted = sqlx::query(
                    "INSERT INTO idempotency_keys \
                     (event_id, status, first_seen_at, last_seen_at, attempts) \
                     VALUES ($1, 'processing', $2, $2, 1)",
                )
                .bind(event_id)
                .bind(now)
                .execute(&mut *tx)
                .await;

                match inserted {
                    Ok(_) => {
                        tx.commit().await?;
                        return Ok(Claim::Fresh);
                    }
                    Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                        // Lost the insert race; re-run against the winner's row.
                        debug!(event_id = %event_id, attempt = attempt, "Claim insert raced, restarting");
                        drop(tx);
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            };

            let status = LedgerStatus::parse(&status)?;

            match status {
                LedgerStatus::Success => {
                    sqlx::query(
                        "UPDATE idempotency_keys SET last_seen_at = $1 WHERE event_id = $2",
                    )
                    .bind(now)
                    .bind(event_id)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    return Ok(Claim::AlreadyDone);
                }
                LedgerStatus::Processing
                    if now.signed_duration_since(last_seen_at) < self.liveness_window =>
                {
                    // A live peer holds this event.
                    tx.commit().await?;
                    return Ok(Claim::AlreadyDone);
                }
                LedgerStatus::Processing | LedgerStatus::Failed => {
                    sqlx::query(
                        "UPDATE idempotency_keys \
                         SET status = 'processing', last_seen_at = $1, attempts = attempts + 1 \
                         WHERE event_id = $2",
                    )
                    .bind(now)
                    .bind(event_id)
                    .execute(&mut *tx)
                    .await?;
                    tx.commit().await?;
                    return Ok(Claim::Retry);
                }
            }
        }

        Err(LedgerError::InsertRace(INSERT_RACE_RETRIES))
    }

    /// Record that the event's effects are fully committed.
    pub async fn mark_success(&self, event_id: &str) -> Result<(), LedgerError> {
        let query = sqlx::query(
            "UPDATE idempotency_keys SET status = 'success', last_seen_at = $1 \
             WHERE event_id = $2",
        )
        .bind(Utc::now())
        .bind(event_id)
        .execute(&self.pool);

        tokio::time::timeout(self.op_timeout, query)
            .await
            .map_err(|_| LedgerError::Timeout)??;

        Ok(())
    }

    /// Record a deterministic failure with its reason.
    pub async fn mark_failed(&self, event_id: &str, reason: &str) -> Result<(), LedgerError> {
        let reason = truncate_reason(reason);

        let query = sqlx::query(
            "UPDATE idempotency_keys \
             SET status = 'failed', last_seen_at = $1, error_reason = $2 \
             WHERE event_id = $3",
        )
        .bind(Utc::now())
        .bind(&reason)
        .bind(event_id)
        .execute(&self.pool);

        tokio::time::timeout(self.op_timeout, query)
            .await
            .map_err(|_| LedgerError::Timeout)??;

        warn!(event_id = %event_id, reason = %reason, "Ledger entry marked failed");
        Ok(())
    }

    /// Fetch the ledger entry for an event, if any.
    pub async fn get(&self, event_id: &str) -> Result<Option<LedgerEntry>, LedgerError> {
        let query = sqlx::query_as::<
            _,
            (String, String, DateTime<Utc>, DateTime<Utc>, i32, Option<String>),
        >(
            "SELECT event_id, status, first_seen_at, last_seen_at, attempts, error_reason \
             FROM idempotency_keys WHERE event_id = $1",
        )
        .bind(event_id)
        .fetch_optional(&self.pool);

        let row = tokio::time::timeout(self.op_timeout, query)
            .await
            .map_err(|_| LedgerError::Timeout)??;

        row.map(
            |(event_id, status, first_seen_at, last_seen_at, attempts, error_reason)| {
                Ok(LedgerEntry {
                    event_id,
                    status: LedgerStatus::parse(&status)?,
                    first_seen_at,
                    last_seen_at,
                    attempts,
                    error_reason,
                })
            },
        )
        .transpose()
    }
}

/// Truncate an error reason to the storable length.
fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_ERROR_REASON_LEN {
        return reason.to_string();
    }

    // Cut on a char boundary at or below the limit.
    let mut end = MAX_ERROR_REASON_LEN;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}
