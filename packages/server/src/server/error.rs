//! HTTP error mapping for the core error taxonomy.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{error, warn};

use crate::common::CoreError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthorized(reason) => (StatusCode::UNAUTHORIZED, reason.clone()),
            ApiError::Core(core) => match core {
                CoreError::Validation(reason) => (StatusCode::BAD_REQUEST, reason.clone()),
                CoreError::NotFound => (StatusCode::NOT_FOUND, "Job not found".to_string()),
                CoreError::Forbidden => {
                    // Cross-tenant access attempt: log it, leak nothing.
                    warn!("cross-tenant access rejected");
                    (StatusCode::FORBIDDEN, "Forbidden".to_string())
                }
                CoreError::Conflict(reason) => (StatusCode::CONFLICT, reason.clone()),
                CoreError::InvalidStateTransition { .. } => {
                    (StatusCode::CONFLICT, core.to_string())
                }
                CoreError::Transient(reason) => {
                    error!(error = %reason, "infrastructure error surfaced to API");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Service temporarily unavailable".to_string(),
                    )
                }
                CoreError::Handler(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal error".to_string(),
                ),
            },
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
