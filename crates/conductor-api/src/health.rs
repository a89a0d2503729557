// Health HTTP routes: liveness, readiness, per-component detail

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use conductor_bus::{KvStore, MessageBus};
use conductor_storage::WorkflowStore;

/// App state for health routes
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn WorkflowStore>,
    pub kv: Arc<dyn KvStore>,
    pub bus: Arc<dyn MessageBus>,
    pub worker_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub worker_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ComponentHealth {
    pub ok: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub database: ComponentHealth,
    pub kv: ComponentHealth,
    pub bus: ComponentHealth,
}

/// Create health routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/health/ready", get(readiness))
        .route("/health/detailed", get(detailed))
        .with_state(state)
}

/// GET /health - Liveness
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Process is alive", body = HealthResponse)),
    tag = "health"
)]
pub async fn liveness(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        worker_id: state.worker_id,
    })
}

/// GET /health/ready - Dependency readiness
#[utoipa::path(
    get,
    path = "/health/ready",
    responses(
        (status = 200, description = "All dependencies healthy", body = ReadinessResponse),
        (status = 503, description = "A dependency is unhealthy", body = ReadinessResponse)
    ),
    tag = "health"
)]
pub async fn readiness(
    State(state): State<AppState>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let report = probe(&state).await;
    let status = if report.database.ok && report.kv.ok && report.bus.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// GET /health/detailed - Per-component health with latencies
#[utoipa::path(
    get,
    path = "/health/detailed",
    responses((status = 200, description = "Per-component health", body = ReadinessResponse)),
    tag = "health"
)]
pub async fn detailed(State(state): State<AppState>) -> Json<ReadinessResponse> {
    Json(probe(&state).await)
}

async fn probe(state: &AppState) -> ReadinessResponse {
    let started = Instant::now();
    let database = match state.store.health().await {
        Ok(()) => ComponentHealth {
            ok: true,
            latency_ms: started.elapsed().as_millis() as u64,
            error: None,
        },
        Err(e) => ComponentHealth {
            ok: false,
            latency_ms: started.elapsed().as_millis() as u64,
            error: Some(e.to_string()),
        },
    };

    let kv = match state.kv.health().await {
        Ok(health) => ComponentHealth {
            ok: health.ok,
            latency_ms: health.latency_ms,
            error: None,
        },
        Err(e) => ComponentHealth {
            ok: false,
            latency_ms: 0,
            error: Some(e.to_string()),
        },
    };

    let bus = match state.bus.health().await {
        Ok(health) => ComponentHealth {
            ok: health.ok,
            latency_ms: health.latency_ms,
            error: None,
        },
        Err(e) => ComponentHealth {
            ok: false,
            latency_ms: 0,
            error: Some(e.to_string()),
        },
    };

    let all_ok = database.ok && kv.ok && bus.ok;
    ReadinessResponse {
        status: if all_ok { "ready" } else { "degraded" },
        database,
        kv,
        bus,
    }
}
