// Common DTOs and error mapping for the public API

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use conductor_core::ServiceError;
use conductor_storage::StoreError;

/// Response wrapper for list endpoints.
/// All list endpoints return responses wrapped in a `data` field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

impl<T> ListResponse<T> {
    pub fn new(data: Vec<T>) -> Self {
        Self { data }
    }
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(data: Vec<T>) -> Self {
        Self { data }
    }
}

/// Error body returned alongside non-2xx statuses.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Map a service error to the documented status codes: 400 schema failure,
/// 404 unknown workflow, 409 state conflict, 503 unhealthy dependency.
pub fn status_for(error: &ServiceError) -> StatusCode {
    match error {
        ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
        ServiceError::Store(StoreError::WorkflowNotFound(_))
        | ServiceError::Store(StoreError::TaskNotFound(_)) => StatusCode::NOT_FOUND,
        ServiceError::Conflict(_) => StatusCode::CONFLICT,
        ServiceError::Bus(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Kv(e) if e.is_transient() => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn api_error(error: ServiceError) -> (StatusCode, Json<ErrorResponse>) {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::error!(%error, "request failed");
    }
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_contracts::ValidationError;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&ServiceError::Validation(ValidationError::new(
                "agent_result",
                "1.0.0",
                "stage",
                "bad"
            ))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&ServiceError::Store(StoreError::WorkflowNotFound(
                Uuid::now_v7()
            ))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&ServiceError::Conflict("terminal".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&ServiceError::Bus(conductor_bus::BusError::Transport(
                "down".into()
            ))),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }
}
