//! KudosBot Status & Administration API
//!
//! HTTP endpoints for:
//! - Health and Kubernetes probes (liveness/readiness)
//! - Queue, circuit-breaker, and pool status reports
//! - Configuration hot-reload
//! - Circuit reset (administrative escape hatch)
//! - Event injection for development and integration testing

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use tracing::info;

use kb_common::{
    CircuitSnapshot, CoreConfig, Event, EventKind, HealthStatus, PoolStats, QueueStatus,
    StatusReport,
};
use kb_core::EventDispatcher;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct ApiState {
    pub dispatcher: Arc<EventDispatcher>,
}

/// Simple health response for basic health checks.
#[derive(Serialize)]
pub struct SimpleHealthResponse {
    /// Health status: UP, DEGRADED
    pub status: String,
    pub version: String,
}

/// Kubernetes probe response.
#[derive(Serialize)]
pub struct ProbeResponse {
    pub status: String,
}

/// Response after a configuration reload.
#[derive(Serialize)]
pub struct ReloadResponse {
    pub success: bool,
}

/// Request to inject an inbound event.
#[derive(Debug, Deserialize)]
pub struct InjectEventRequest {
    pub kind: EventKind,
    pub chat_id: i64,
    pub actor_id: i64,
    #[serde(default)]
    pub message_id: Option<i64>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Response after accepting an injected event.
#[derive(Serialize)]
pub struct InjectEventResponse {
    pub event_id: String,
}

/// Create the full router with all endpoints.
pub fn create_router(dispatcher: Arc<EventDispatcher>) -> Router {
    let state = ApiState { dispatcher };

    Router::new()
        .route("/health", get(health_handler))
        .route("/health/live", get(liveness_probe))
        .route("/health/ready", get(readiness_probe))
        .route("/api/monitoring", get(monitoring_handler))
        .route("/api/monitoring/queue", get(queue_status_handler))
        .route("/api/monitoring/circuits", get(circuit_status_handler))
        .route("/api/monitoring/circuits/:operation/reset", post(reset_circuit_handler))
        .route("/api/monitoring/pools", get(pool_status_handler))
        .route("/api/config/reload", post(reload_config_handler))
        .route("/api/events", post(inject_event_handler))
        .with_state(state)
}

async fn health_handler(State(state): State<ApiState>) -> Json<SimpleHealthResponse> {
    let report = state.dispatcher.context().status();
    let status = match report.status {
        HealthStatus::Healthy | HealthStatus::Warning => "UP",
        HealthStatus::Degraded => "DEGRADED",
    };
    Json(SimpleHealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn liveness_probe() -> Json<ProbeResponse> {
    Json(ProbeResponse { status: "LIVE".to_string() })
}

async fn readiness_probe(State(state): State<ApiState>) -> (StatusCode, Json<ProbeResponse>) {
    // Not ready once the pools have started draining for shutdown.
    if state.dispatcher.context().general_pool.is_running() {
        (StatusCode::OK, Json(ProbeResponse { status: "READY".to_string() }))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(ProbeResponse { status: "NOT_READY".to_string() }))
    }
}

async fn monitoring_handler(State(state): State<ApiState>) -> Json<StatusReport> {
    Json(state.dispatcher.context().status())
}

async fn queue_status_handler(State(state): State<ApiState>) -> Json<QueueStatus> {
    Json(state.dispatcher.context().queue.status())
}

async fn circuit_status_handler(State(state): State<ApiState>) -> Json<Vec<CircuitSnapshot>> {
    Json(state.dispatcher.context().breaker.snapshot())
}

async fn reset_circuit_handler(
    State(state): State<ApiState>,
    Path(operation): Path<String>,
) -> Json<ReloadResponse> {
    info!(operation = %operation, "Circuit reset requested via API");
    state.dispatcher.context().breaker.reset(&operation);
    Json(ReloadResponse { success: true })
}

async fn pool_status_handler(State(state): State<ApiState>) -> Json<Vec<PoolStats>> {
    let ctx = state.dispatcher.context();
    Json(vec![ctx.general_pool.stats(), ctx.persist_pool.stats()])
}

async fn reload_config_handler(
    State(state): State<ApiState>,
    Json(config): Json<CoreConfig>,
) -> Json<ReloadResponse> {
    info!("Configuration reload requested via API");
    state.dispatcher.context().reload(config);
    Json(ReloadResponse { success: true })
}

async fn inject_event_handler(
    State(state): State<ApiState>,
    Json(request): Json<InjectEventRequest>,
) -> (StatusCode, Json<InjectEventResponse>) {
    let mut event = Event::new(request.kind, request.chat_id, request.actor_id);
    event.message_id = request.message_id;
    event.text = request.text;
    event.payload = request.payload;
    let event_id = event.id.clone();

    state.dispatcher.on_event(event);

    (StatusCode::ACCEPTED, Json(InjectEventResponse { event_id }))
}
