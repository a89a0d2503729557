// Parked-result (dead letter) HTTP routes

use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use conductor_core::WorkflowService;
use conductor_storage::Page;

use crate::common::{api_error, ErrorResponse, ListResponse};

/// App state for parked-result routes
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<WorkflowService>,
}

/// A dead-lettered result as exposed to operators
#[derive(Debug, Serialize, ToSchema)]
pub struct ParkedResultView {
    pub id: Uuid,
    pub payload: serde_json::Value,
    pub reason: String,
    pub error_history: Vec<String>,
    pub parked_at: DateTime<Utc>,
}

/// Query parameters for listing parked results
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListParkedParams {
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

/// Create parked-result routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/parked-results", get(list_parked))
        .with_state(state)
}

/// GET /api/v1/parked-results - Results that failed validation past the
/// retry budget
#[utoipa::path(
    get,
    path = "/api/v1/parked-results",
    params(
        ("limit" = Option<i64>, Query, description = "Max number of results (default 20)"),
        ("offset" = Option<i64>, Query, description = "Offset for pagination")
    ),
    responses(
        (status = 200, description = "Parked results")
    ),
    tag = "parked"
)]
pub async fn list_parked(
    State(state): State<AppState>,
    Query(params): Query<ListParkedParams>,
) -> Result<Json<ListResponse<ParkedResultView>>, (StatusCode, Json<ErrorResponse>)> {
    let parked = state
        .service
        .list_parked(Page {
            limit: params.limit,
            offset: params.offset,
        })
        .await
        .map_err(api_error)?;

    Ok(Json(ListResponse::new(
        parked
            .into_iter()
            .map(|p| ParkedResultView {
                id: p.id,
                payload: p.payload,
                reason: p.reason,
                error_history: p.error_history,
                parked_at: p.parked_at,
            })
            .collect(),
    )))
}
