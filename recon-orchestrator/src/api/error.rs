//! API Error Handling
//!
//! Unified error type and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::error::OrchestratorError;
use crate::policy::PolicyError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    InternalError(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Unavailable(msg) => {
                tracing::warn!("Service unavailable: {}", msg);
                (StatusCode::SERVICE_UNAVAILABLE, msg)
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::JobNotFound(_) | OrchestratorError::ScheduleNotFound(_) => {
                ApiError::NotFound(err.to_string())
            }
            OrchestratorError::InvalidRequest(msg) => ApiError::BadRequest(msg),
            OrchestratorError::InvalidState(msg) => ApiError::Conflict(msg),
            OrchestratorError::ShuttingDown => ApiError::Unavailable(err.to_string()),
            OrchestratorError::Persistence(e) => {
                tracing::error!("Persistence error: {:?}", e);
                ApiError::InternalError("Internal server error".to_string())
            }
        }
    }
}

impl From<PolicyError> for ApiError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::StaleVersion { .. } | PolicyError::VersionConflict(_) => {
                ApiError::Conflict(err.to_string())
            }
            PolicyError::Parse(_) | PolicyError::Invalid(_) | PolicyError::NoSource => {
                ApiError::BadRequest(err.to_string())
            }
            PolicyError::Io { .. } => ApiError::InternalError(err.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
