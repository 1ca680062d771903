//! HTTP front: webhook intake plus health/readiness/metrics endpoints.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use super::WebhookProvider;

/// Outcome of one webhook intake, mapped onto HTTP responses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Enqueued for the given number of matched platforms.
    Accepted { matched: usize },
    /// Signature or token verification failed.
    Unauthorized,
    /// Payload could not be parsed.
    BadRequest(String),
}

/// Intake behind the routes; the production implementation is the GitOps
/// coordinator.
#[async_trait]
pub trait WebhookIngest: Send + Sync {
    async fn ingest(
        &self,
        provider: WebhookProvider,
        headers: &HeaderMap,
        body: &[u8],
    ) -> IngestOutcome;
}

/// Reconcile/webhook counters surfaced on `/metrics`.
#[derive(Default)]
pub struct EngineMetrics {
    pub reconciles: AtomicU64,
    pub reconcile_errors: AtomicU64,
    pub webhooks_accepted: AtomicU64,
    pub webhooks_rejected: AtomicU64,
}

#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<dyn WebhookIngest>,
    pub metrics: Arc<EngineMetrics>,
}

/// Build the HTTP router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .route("/webhook/{provider}", post(webhook_handler))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(30))),
        )
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "platform-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(_state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ready",
        "service": "platform-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    let m = &state.metrics;
    Json(json!({
        "service": "platform-controller",
        "version": env!("CARGO_PKG_VERSION"),
        "reconciles": m.reconciles.load(Ordering::Relaxed),
        "reconcile_errors": m.reconcile_errors.load(Ordering::Relaxed),
        "webhooks_accepted": m.webhooks_accepted.load(Ordering::Relaxed),
        "webhooks_rejected": m.webhooks_rejected.load(Ordering::Relaxed),
    }))
}

async fn webhook_handler(
    Path(provider): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let Some(provider) = WebhookProvider::from_path(&provider) else {
        return Err(StatusCode::NOT_FOUND);
    };

    match state.ingest.ingest(provider, &headers, &body).await {
        IngestOutcome::Accepted { matched } => {
            state
                .metrics
                .webhooks_accepted
                .fetch_add(1, Ordering::Relaxed);
            info!(provider = provider.as_str(), matched, "webhook accepted");
            Ok((
                StatusCode::ACCEPTED,
                Json(json!({ "status": "accepted", "matched": matched })),
            ))
        }
        IngestOutcome::Unauthorized => {
            state
                .metrics
                .webhooks_rejected
                .fetch_add(1, Ordering::Relaxed);
            Err(StatusCode::UNAUTHORIZED)
        }
        IngestOutcome::BadRequest(reason) => Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "rejected", "reason": reason })),
        )),
    }
}

/// Header lookup closure over an axum `HeaderMap`.
#[must_use]
pub fn header_resolver(headers: &HeaderMap) -> impl Fn(&str) -> Option<String> + '_ {
    move |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(ToString::to_string)
    }
}
