// Workflow HTTP routes

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use utoipa::ToSchema;
use uuid::Uuid;

use conductor_contracts::{Priority, Workflow, WorkflowStatus, WorkflowType};
use conductor_core::{CreateWorkflowRequest, WorkflowService};
use conductor_storage::{Page, WorkflowFilter};

use crate::common::{api_error, ErrorResponse, ListResponse};

/// App state for workflow routes
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<WorkflowService>,
}

/// Request to create a workflow
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateWorkflowBody {
    #[serde(rename = "type")]
    pub workflow_type: WorkflowType,
    pub name: String,
    pub description: Option<String>,
    /// Client requirements handed to every stage through the workflow context
    #[serde(default)]
    pub requirements: serde_json::Value,
    pub priority: Option<Priority>,
}

/// Request to cancel a workflow
#[derive(Debug, Deserialize, ToSchema)]
pub struct CancelWorkflowBody {
    #[serde(default = "default_cancel_reason")]
    pub reason: String,
}

fn default_cancel_reason() -> String {
    "cancelled by client".to_string()
}

/// Request to resolve a pending decision gate
#[derive(Debug, Deserialize, ToSchema)]
pub struct ResolveDecisionBody {
    pub approved: bool,
    pub decided_by: String,
}

/// Query parameters for listing workflows
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListWorkflowsParams {
    pub status: Option<WorkflowStatus>,
    #[serde(rename = "type")]
    pub workflow_type: Option<WorkflowType>,
    pub created_after: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    20
}

/// Create workflow routes
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/workflows", get(list_workflows).post(create_workflow))
        .route("/api/v1/workflows/:workflow_id", get(get_workflow))
        .route("/api/v1/workflows/:workflow_id/cancel", post(cancel_workflow))
        .route(
            "/api/v1/workflows/:workflow_id/decision",
            post(resolve_decision),
        )
        .with_state(state)
}

/// POST /api/v1/workflows - Create a workflow
#[utoipa::path(
    post,
    path = "/api/v1/workflows",
    request_body = CreateWorkflowBody,
    params(
        ("x-trace-id" = Option<String>, Header, description = "External trace id; honored when well-formed")
    ),
    responses(
        (status = 201, description = "Workflow created", body = Workflow),
        (status = 400, description = "Validation failure", body = ErrorResponse),
        (status = 503, description = "Dependency unavailable", body = ErrorResponse)
    ),
    tag = "workflows"
)]
pub async fn create_workflow(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateWorkflowBody>,
) -> Result<(StatusCode, Json<Workflow>), (StatusCode, Json<ErrorResponse>)> {
    let trace_id = headers
        .get("x-trace-id")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());

    let workflow = state
        .service
        .create_workflow(CreateWorkflowRequest {
            workflow_type: body.workflow_type,
            name: body.name,
            description: body.description,
            requirements: body.requirements,
            priority: body.priority,
            trace_id,
        })
        .await
        .map_err(api_error)?;

    Ok((StatusCode::CREATED, Json(workflow)))
}

/// GET /api/v1/workflows/{workflow_id}
#[utoipa::path(
    get,
    path = "/api/v1/workflows/{workflow_id}",
    params(
        ("workflow_id" = Uuid, Path, description = "Workflow ID")
    ),
    responses(
        (status = 200, description = "Workflow found", body = Workflow),
        (status = 404, description = "Workflow not found", body = ErrorResponse)
    ),
    tag = "workflows"
)]
pub async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
) -> Result<Json<Workflow>, (StatusCode, Json<ErrorResponse>)> {
    let workflow = state
        .service
        .get_workflow(workflow_id)
        .await
        .map_err(api_error)?;
    Ok(Json(workflow))
}

/// GET /api/v1/workflows - Paged list with filters
#[utoipa::path(
    get,
    path = "/api/v1/workflows",
    params(
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("type" = Option<String>, Query, description = "Filter by workflow type"),
        ("created_after" = Option<String>, Query, description = "Only workflows created after this instant"),
        ("limit" = Option<i64>, Query, description = "Max number of results (default 20)"),
        ("offset" = Option<i64>, Query, description = "Offset for pagination")
    ),
    responses(
        (status = 200, description = "List of workflows")
    ),
    tag = "workflows"
)]
pub async fn list_workflows(
    State(state): State<AppState>,
    Query(params): Query<ListWorkflowsParams>,
) -> Result<Json<ListResponse<Workflow>>, (StatusCode, Json<ErrorResponse>)> {
    let workflows = state
        .service
        .list_workflows(
            WorkflowFilter {
                status: params.status,
                workflow_type: params.workflow_type,
                created_after: params.created_after,
            },
            Page {
                limit: params.limit,
                offset: params.offset,
            },
        )
        .await
        .map_err(api_error)?;

    Ok(Json(ListResponse::new(workflows)))
}

/// POST /api/v1/workflows/{workflow_id}/cancel
#[utoipa::path(
    post,
    path = "/api/v1/workflows/{workflow_id}/cancel",
    params(
        ("workflow_id" = Uuid, Path, description = "Workflow ID")
    ),
    request_body = CancelWorkflowBody,
    responses(
        (status = 200, description = "Workflow cancelled", body = Workflow),
        (status = 404, description = "Workflow not found", body = ErrorResponse),
        (status = 409, description = "Workflow already terminal", body = ErrorResponse)
    ),
    tag = "workflows"
)]
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(body): Json<CancelWorkflowBody>,
) -> Result<Json<Workflow>, (StatusCode, Json<ErrorResponse>)> {
    let workflow = state
        .service
        .cancel_workflow(workflow_id, &body.reason)
        .await
        .map_err(api_error)?;
    Ok(Json(workflow))
}

/// POST /api/v1/workflows/{workflow_id}/decision
#[utoipa::path(
    post,
    path = "/api/v1/workflows/{workflow_id}/decision",
    params(
        ("workflow_id" = Uuid, Path, description = "Workflow ID")
    ),
    request_body = ResolveDecisionBody,
    responses(
        (status = 202, description = "Decision accepted"),
        (status = 404, description = "Workflow not found", body = ErrorResponse),
        (status = 409, description = "Workflow not awaiting a decision", body = ErrorResponse)
    ),
    tag = "workflows"
)]
pub async fn resolve_decision(
    State(state): State<AppState>,
    Path(workflow_id): Path<Uuid>,
    Json(body): Json<ResolveDecisionBody>,
) -> Result<StatusCode, (StatusCode, Json<ErrorResponse>)> {
    state
        .service
        .resolve_decision(workflow_id, body.approved, &body.decided_by)
        .await
        .map_err(api_error)?;
    Ok(StatusCode::ACCEPTED)
}
