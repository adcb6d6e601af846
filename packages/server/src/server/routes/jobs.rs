//! Job management endpoints.

use axum::extract::{Extension, Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::kernel::jobs::{StatusView, SubmitRequest};
use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::server::middleware::AuthContext;

fn default_job_type() -> String {
    "mock".to_string()
}

#[derive(Debug, Deserialize)]
pub struct JobCreateRequest {
    #[serde(rename = "type", default = "default_job_type")]
    pub job_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    /// Stage at which the mock pipeline fails deterministically (testing).
    #[serde(default)]
    pub fail_at: Option<String>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct JobCreateResponse {
    pub job_id: Uuid,
}

/// Create a job and queue it for background processing.
///
/// The job row, its initial event, and the outbox message commit atomically;
/// the dispatcher publishes to the broker afterwards. Re-submitting a
/// logically identical request returns the existing job id.
pub async fn create_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<JobCreateRequest>,
) -> Result<Json<JobCreateResponse>, ApiError> {
    let mut submit = SubmitRequest::new(request.job_type, request.payload);
    submit.fail_at = request.fail_at;
    submit.idempotency_key = request.idempotency_key;
    submit.max_attempts = request.max_attempts;

    let outcome = state
        .ingest
        .submit(auth.org_id, Some(auth.user_id), submit)
        .await?;

    Ok(Json(JobCreateResponse {
        job_id: outcome.job_id(),
    }))
}

/// Poll a job's status. 404 for unknown ids, 403 across tenants.
pub async fn get_job_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(job_id): Path<Uuid>,
) -> Result<Json<StatusView>, ApiError> {
    let view = state.status.get_status(job_id, auth.org_id).await?;
    Ok(Json(view))
}
