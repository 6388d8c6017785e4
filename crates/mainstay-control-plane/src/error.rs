//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mainstay_core::ExecutionError;
use serde_json::json;

/// Error payload returned by every endpoint.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub detail: String,
}

impl ApiError {
    pub fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, detail)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, detail = %self.detail, "request failed");
        }
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        let status = match &err {
            ExecutionError::WorkflowNotFound { .. }
            | ExecutionError::ContextNotFound { .. }
            | ExecutionError::TaskNotFound { .. }
            | ExecutionError::WorkerNotFound { .. }
            | ExecutionError::ScheduleNotFound { .. }
            | ExecutionError::SecretMissing { .. } => StatusCode::NOT_FOUND,
            ExecutionError::WorkflowAlreadyExists { .. }
            | ExecutionError::InvalidTransition { .. } => StatusCode::CONFLICT,
            ExecutionError::InvalidSchedule { .. } | ExecutionError::Serialization(_) => {
                StatusCode::BAD_REQUEST
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}
