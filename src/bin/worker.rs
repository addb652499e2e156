//! Fluxa worker: the queue-consuming half of the pipeline.
//!
//! The worker reads batches from the event stream through a consumer group,
//! runs each message through the [`Processor`], and maps the outcome to a
//! transport action. This loop is the only place that mapping happens:
//!
//! - success or duplicate: acknowledge.
//! - poison: the ledger already records the verdict; acknowledge. Bodies
//!   that failed parsing have no ledger row and are copied to the
//!   dead-letter stream first.
//! - retriable: leave the entry pending. It is reclaimed after the
//!   pending-idle threshold and dead-lettered once its delivery count
//!   exceeds `max_receives`.
//!
//! ## Configuration
//!
//! Environment variables:
//! - `FLUXA_CONFIG`: Path to the TOML config (default: "config/fluxa.toml")
//! - `FLUXA_WORKER_NAME`: Unique consumer name (default: hostname or UUID)
//! - `RUST_LOG`: Logging level (default: "info")

use std::env;
use std::sync::Arc;
use std::time::Duration;

use deadpool_redis::{Config, Runtime};
use metrics::counter;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use fluxa::config::FluxaConfig;
use fluxa::db::{self, Db};
use fluxa::dlq::{DeadLetter, DeadLetterQueue};
use fluxa::ledger::Ledger;
use fluxa::notify::{Notifier, WebhookNotifier};
use fluxa::processor::{Processed, Processor};
use fluxa::queue::{Delivery, QueueClient};
use fluxa::shutdown::ShutdownSignal;
use fluxa::storage::RedisPayloadStore;
use fluxa::QueueMessage;

/// Get the consumer name from environment or derive one.
fn get_worker_name(configured: Option<&str>) -> String {
    if let Some(name) = configured {
        return name.to_string();
    }

    if let Ok(name) = env::var("FLUXA_WORKER_NAME") {
        return name;
    }

    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return format!("worker-{}", name);
        }
    }

    format!("worker-{}", uuid::Uuid::new_v4())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    dotenvy::dotenv().ok();

    let config = FluxaConfig::load()?;
    fluxa::register_metrics();

    let worker_name = get_worker_name(config.worker.name.as_deref());
    let consumer_group = config.redis.consumer_group.clone();

    info!(
        worker_name = %worker_name,
        consumer_group = %consumer_group,
        stream = %config.redis.stream,
        "Fluxa worker starting"
    );

    let redis_cfg = Config::from_url(config.redis.url.clone());
    let redis_pool = redis_cfg
        .create_pool(Some(Runtime::Tokio1))
        .expect("Failed to create Redis pool");

    let pg_pool = db::connect(&config.database.url, config.database.max_connections).await?;
    let database = Db::new(pg_pool.clone(), config.database.op_timeout());
    let ledger = Ledger::new(
        pg_pool,
        config.worker.liveness_window(),
        config.database.op_timeout(),
    );

    let store = Arc::new(RedisPayloadStore::new(
        redis_pool.clone(),
        config.storage.bucket.clone(),
        config.storage.ttl_secs,
        Duration::from_millis(config.storage.timeout_ms),
    ));

    let notifier: Option<Arc<dyn Notifier>> = config.notifier.webhook_url.as_ref().map(|url| {
        Arc::new(
            WebhookNotifier::new(url)
                .with_timeout(Duration::from_millis(config.notifier.timeout_ms))
                .with_retries(config.notifier.retries),
        ) as Arc<dyn Notifier>
    });

    let processor = Processor::new(database, ledger, store, notifier);
    let queue = QueueClient::new(redis_pool.clone(), config.redis.stream.clone());
    let dlq = DeadLetterQueue::new(redis_pool.clone(), config.redis.dlq_stream.clone());

    queue.ensure_group(&consumer_group).await?;

    let shutdown = ShutdownSignal::new();
    let mut shutdown_receiver = shutdown.subscribe();

    info!(stream = %queue.stream(), "Listening for events");

    let mut events_processed: u64 = 0;
    let mut events_failed: u64 = 0;

    loop {
        if shutdown_receiver.try_recv().is_ok() {
            break;
        }

        // Recover entries abandoned by crashed or stalled consumers.
        let stale = match queue
            .claim_stale(
                &consumer_group,
                &worker_name,
                config.worker.pending_idle_ms,
                config.worker.batch_size,
            )
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "Failed to claim stale messages");
                Vec::new()
            }
        };

        let fresh = tokio::select! {
            _ = shutdown.wait() => {
                info!("Shutdown signal received during read, finishing...");
                break;
            }
            batch = queue.read_batch(
                &consumer_group,
                &worker_name,
                config.worker.batch_size,
                config.worker.block_ms,
            ) => match batch {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "Stream read failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            }
        };

        for delivery in stale.into_iter().chain(fresh) {
            // Exhausted receive budget: dead-letter instead of processing.
            if delivery.delivery_count > config.worker.max_receives {
                dead_letter(&queue, &dlq, &consumer_group, &delivery, "max_receives_exceeded")
                    .await;
                events_failed += 1;
                continue;
            }

            match handle_delivery(&processor, &delivery).await {
                Outcome::Ack => {
                    events_processed += 1;
                    ack(&queue, &consumer_group, &delivery.stream_id).await;
                }
                Outcome::AckPoisoned => {
                    events_failed += 1;
                    ack(&queue, &consumer_group, &delivery.stream_id).await;
                }
                Outcome::DeadLetter(reason) => {
                    events_failed += 1;
                    dead_letter(&queue, &dlq, &consumer_group, &delivery, reason).await;
                }
                Outcome::Retry => {
                    // No ack: the entry stays pending and is redelivered
                    // after the idle threshold.
                    events_failed += 1;
                }
            }
        }

        if events_processed > 0 && events_processed % 100 == 0 {
            info!(
                events_processed = events_processed,
                events_failed = events_failed,
                "Worker statistics"
            );
        }
    }

    info!(
        events_processed = events_processed,
        events_failed = events_failed,
        "Worker shutting down gracefully"
    );
    Ok(())
}

/// Transport action decided for one delivery.
enum Outcome {
    Ack,
    AckPoisoned,
    DeadLetter(&'static str),
    Retry,
}

async fn handle_delivery(processor: &Processor, delivery: &Delivery) -> Outcome {
    let Some(body) = delivery.body.as_deref() else {
        warn!(stream_id = %delivery.stream_id, "Delivery has no body");
        return Outcome::DeadLetter("parse_error");
    };

    let msg = match QueueMessage::parse(body) {
        Ok(msg) => msg,
        Err(e) => {
            // No stable event identity, so no ledger row can hold the
            // verdict; the dead-letter entry is the only trace.
            warn!(stream_id = %delivery.stream_id, error = %e, "Unparseable message body");
            return Outcome::DeadLetter("parse_error");
        }
    };

    debug!(
        stream_id = %delivery.stream_id,
        event_id = %msg.event_id,
        correlation_id = %msg.correlation_id,
        delivery_count = delivery.delivery_count,
        "Processing message"
    );

    match processor.process(&msg).await {
        Ok(Processed::Completed) | Ok(Processed::AlreadyDone) => Outcome::Ack,
        Err(err) if err.is_retriable() => {
            warn!(
                stream_id = %delivery.stream_id,
                event_id = %msg.event_id,
                error = %err,
                delivery_count = delivery.delivery_count,
                "Transient failure, leaving message pending"
            );
            Outcome::Retry
        }
        Err(err) => {
            warn!(
                stream_id = %delivery.stream_id,
                event_id = %msg.event_id,
                error = %err,
                "Poison message acknowledged"
            );
            Outcome::AckPoisoned
        }
    }
}

async fn ack(queue: &QueueClient, group: &str, stream_id: &str) {
    if let Err(e) = queue.ack(group, stream_id).await {
        error!(stream_id = %stream_id, error = %e, "Failed to ACK message");
    }
}

async fn dead_letter(
    queue: &QueueClient,
    dlq: &DeadLetterQueue,
    group: &str,
    delivery: &Delivery,
    reason: &str,
) {
    let letter = DeadLetter {
        body: delivery.body.as_deref().unwrap_or(""),
        reason,
        delivery_count: delivery.delivery_count,
        original_id: &delivery.stream_id,
        event_id: delivery.event_id.as_deref(),
        correlation_id: delivery.correlation_id.as_deref(),
    };

    match dlq.push(&letter).await {
        Ok(_) => {
            counter!("dead_lettered_total").increment(1);
            ack(queue, group, &delivery.stream_id).await;
        }
        Err(e) => {
            // Leave unacked so the entry is retried and dead-lettered again.
            error!(
                stream_id = %delivery.stream_id,
                error = %e,
                "Failed to dead-letter message"
            );
        }
    }
}
