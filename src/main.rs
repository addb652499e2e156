use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Request, State};
use axum::http::{header::HeaderName, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::{Extension, Router};
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config, Pool, Runtime};
use serde_json::{json, Value};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use fluxa::config::FluxaConfig;
use fluxa::db::{self, Db};
use fluxa::ingest::IngestService;
use fluxa::queue::QueueClient;
use fluxa::storage::RedisPayloadStore;
use fluxa::IngestError;

const CORRELATION_HEADER: HeaderName = HeaderName::from_static("x-correlation-id");

#[derive(Clone)]
struct AppState {
    ingest: IngestService,
    db: Db,
    redis_pool: Pool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    dotenvy::dotenv().ok();

    let config = FluxaConfig::load().expect("Failed to load configuration");
    fluxa::register_metrics();

    // Redis pool shared by the queue adapter and the payload store.
    let redis_cfg = Config::from_url(config.redis.url.clone());
    let redis_pool = redis_cfg
        .create_pool(Some(Runtime::Tokio1))
        .expect("Failed to create Redis pool");

    let pg_pool = db::connect(&config.database.url, config.database.max_connections)
        .await
        .expect("Failed to connect to PostgreSQL");
    let db = Db::new(pg_pool, config.database.op_timeout());

    let store = Arc::new(RedisPayloadStore::new(
        redis_pool.clone(),
        config.storage.bucket.clone(),
        config.storage.ttl_secs,
        std::time::Duration::from_millis(config.storage.timeout_ms),
    ));
    let queue = QueueClient::new(redis_pool.clone(), config.redis.stream.clone());
    let ingest = IngestService::new(
        queue,
        store,
        config.storage.bucket.clone(),
        config.payload.max_inline_bytes,
    );

    let state = Arc::new(AppState {
        ingest,
        db,
        redis_pool,
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/events", post(submit_event))
        .route("/events/{event_id}", get(get_event))
        .layer(middleware::from_fn(correlation_middleware))
        .with_state(state);

    let addr: SocketAddr = format!("0.0.0.0:{}", config.server.port)
        .parse()
        .expect("Invalid address");

    info!("Fluxa server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");
    axum::serve(listener, app).await.expect("Server error");
}

/// Accept or assign a correlation id and echo it on every response.
async fn correlation_middleware(mut req: Request, next: Next) -> Response {
    let correlation_id = req
        .headers()
        .get(&CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(CorrelationId(correlation_id.clone()));

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }

    response
}

#[derive(Clone)]
struct CorrelationId(String);

async fn submit_event(
    State(state): State<Arc<AppState>>,
    Extension(CorrelationId(correlation_id)): Extension<CorrelationId>,
    body: Bytes,
) -> Result<impl IntoResponse, IngestError> {
    let receipt = state
        .ingest
        .submit(&body, Some(correlation_id))
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "event_id": receipt.event_id,
            "status": "enqueued",
        })),
    ))
}

async fn get_event(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
) -> Response {
    match state.db.get_event(&event_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("Event not found: {event_id}") })),
        )
            .into_response(),
        Err(e) => {
            error!(event_id = %event_id, error = %e, "Failed to query event");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal server error" })),
            )
                .into_response()
        }
    }
}

async fn health(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!(error = %e, "Failed to get Redis connection");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let _: String = cmd("PING").query_async(&mut conn).await.map_err(|e| {
        error!(error = %e, "Redis PING failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    state.db.ping().await.map_err(|e| {
        error!(error = %e, "Postgres ping failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Ok(Json(json!({ "status": "healthy" })))
}
