//! Integration tests for the idempotency ledger state machine.

use std::time::Duration;

use fluxa::ledger::{Claim, Ledger, LedgerStatus};
use sqlx::PgPool;
use uuid::Uuid;

/// Ledger with the default liveness window.
fn ledger(pool: PgPool) -> Ledger {
    Ledger::new(pool, Duration::from_secs(60), Duration::from_secs(5))
}

/// Ledger whose liveness window has effectively elapsed for every entry,
/// so `processing` claims are always treated as stale.
fn stale_ledger(pool: PgPool) -> Ledger {
    Ledger::new(pool, Duration::ZERO, Duration::from_secs(5))
}

fn event_id() -> String {
    format!("test-{}", Uuid::new_v4())
}

// --- claim ---

#[sqlx::test(migrations = "./migrations")]
async fn test_first_claim_is_fresh(pool: PgPool) {
    let ledger = ledger(pool);
    let id = event_id();

    assert_eq!(ledger.claim(&id).await.unwrap(), Claim::Fresh);

    let entry = ledger.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Processing);
    assert_eq!(entry.attempts, 1);
    assert!(entry.error_reason.is_none());
}

#[sqlx::test(migrations = "./migrations")]
async fn test_claim_after_success_is_already_done(pool: PgPool) {
    let ledger = ledger(pool);
    let id = event_id();

    ledger.claim(&id).await.unwrap();
    ledger.mark_success(&id).await.unwrap();

    assert_eq!(ledger.claim(&id).await.unwrap(), Claim::AlreadyDone);

    // Success is terminal: attempts unchanged, status untouched.
    let entry = ledger.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Success);
    assert_eq!(entry.attempts, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_claim_within_liveness_window_is_already_done(pool: PgPool) {
    let ledger = ledger(pool);
    let id = event_id();

    // First claim holds the event; a concurrent redelivery inside the
    // window must be deduplicated.
    ledger.claim(&id).await.unwrap();
    assert_eq!(ledger.claim(&id).await.unwrap(), Claim::AlreadyDone);

    let entry = ledger.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.attempts, 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_stale_processing_claim_is_retried(pool: PgPool) {
    let ledger = stale_ledger(pool);
    let id = event_id();

    ledger.claim(&id).await.unwrap();

    // Window elapsed: redelivery must re-enter processing.
    assert_eq!(ledger.claim(&id).await.unwrap(), Claim::Retry);

    let entry = ledger.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Processing);
    assert_eq!(entry.attempts, 2);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_failed_entry_is_retriable(pool: PgPool) {
    let ledger = ledger(pool);
    let id = event_id();

    ledger.claim(&id).await.unwrap();
    ledger.mark_failed(&id, "hash_mismatch").await.unwrap();

    assert_eq!(ledger.claim(&id).await.unwrap(), Claim::Retry);

    let entry = ledger.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Processing);
    assert_eq!(entry.attempts, 2);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_attempts_strictly_increase_across_retries(pool: PgPool) {
    let ledger = stale_ledger(pool);
    let id = event_id();

    ledger.claim(&id).await.unwrap();
    for expected_attempts in 2..=5 {
        assert_eq!(ledger.claim(&id).await.unwrap(), Claim::Retry);
        let entry = ledger.get(&id).await.unwrap().unwrap();
        assert_eq!(entry.attempts, expected_attempts);
    }
}

// --- terminal transitions ---

#[sqlx::test(migrations = "./migrations")]
async fn test_mark_failed_records_reason(pool: PgPool) {
    let ledger = ledger(pool);
    let id = event_id();

    ledger.claim(&id).await.unwrap();
    ledger.mark_failed(&id, "unmarshal_error").await.unwrap();

    let entry = ledger.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Failed);
    assert_eq!(entry.error_reason.as_deref(), Some("unmarshal_error"));
}

#[sqlx::test(migrations = "./migrations")]
async fn test_mark_failed_truncates_long_reason(pool: PgPool) {
    let ledger = ledger(pool);
    let id = event_id();

    ledger.claim(&id).await.unwrap();
    let long_reason = "x".repeat(800);
    ledger.mark_failed(&id, &long_reason).await.unwrap();

    let entry = ledger.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.error_reason.unwrap().len(), 500);
}

#[sqlx::test(migrations = "./migrations")]
async fn test_success_after_retry_of_failure(pool: PgPool) {
    let ledger = ledger(pool);
    let id = event_id();

    ledger.claim(&id).await.unwrap();
    ledger.mark_failed(&id, "payload_gone").await.unwrap();
    assert_eq!(ledger.claim(&id).await.unwrap(), Claim::Retry);
    ledger.mark_success(&id).await.unwrap();

    assert_eq!(ledger.claim(&id).await.unwrap(), Claim::AlreadyDone);
    let entry = ledger.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.status, LedgerStatus::Success);
}

// --- lookup ---

#[sqlx::test(migrations = "./migrations")]
async fn test_get_unknown_event_is_none(pool: PgPool) {
    let ledger = ledger(pool);

    assert!(ledger.get(&event_id()).await.unwrap().is_none());
}

// --- concurrency ---

#[sqlx::test(migrations = "./migrations")]
async fn test_concurrent_claims_admit_exactly_one(pool: PgPool) {
    let ledger = ledger(pool);
    let id = event_id();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let ledger = ledger.clone();
        let id = id.clone();
        handles.push(tokio::spawn(async move { ledger.claim(&id).await }));
    }

    let mut fresh = 0;
    let mut already_done = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Claim::Fresh => fresh += 1,
            Claim::AlreadyDone => already_done += 1,
            Claim::Retry => panic!("no claim should observe a stale entry here"),
        }
    }

    assert_eq!(fresh, 1);
    assert_eq!(already_done, 9);

    let entry = ledger.get(&id).await.unwrap().unwrap();
    assert_eq!(entry.attempts, 1);
}
