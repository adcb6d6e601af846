//! Vector endpoints: embedding jobs through the outbox, search at query time.
//!
//! Embedding requests submit jobs through ingest with operation-specific
//! idempotency payloads and respond immediately with the job id. Search
//! bypasses the job core entirely: the query is embedded inline and matched
//! against the caller's tenant slice of the index.

use axum::extract::{Extension, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::common::CoreError;
use crate::kernel::jobs::SubmitRequest;
use crate::kernel::vector::SearchHit;
use crate::server::app::AppState;
use crate::server::error::ApiError;
use crate::server::middleware::AuthContext;

#[derive(Debug, Deserialize)]
pub struct MockEmbeddingRequest {
    pub asset_id: String,
    pub segment_id: String,
}

#[derive(Debug, Serialize)]
pub struct EmbeddingJobResponse {
    pub job_id: Uuid,
    pub asset_id: String,
    pub segment_id: String,
}

/// Queue a deterministic mock-embedding job ("hello write" flow).
///
/// Idempotent per `(org, asset, segment)`: repeat calls return the same
/// job id, and the worker's deterministic point id makes the upsert
/// idempotent too.
pub async fn create_mock_embedding(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<MockEmbeddingRequest>,
) -> Result<Json<EmbeddingJobResponse>, ApiError> {
    validate_identity(&request.asset_id, &request.segment_id)?;

    let payload = json!({
        "asset_id": request.asset_id,
        "segment_id": request.segment_id,
    })
    .as_object()
    .cloned()
    .expect("object literal");

    let outcome = state
        .ingest
        .submit(
            auth.org_id,
            Some(auth.user_id),
            SubmitRequest::new("mock_embedding", payload),
        )
        .await?;

    Ok(Json(EmbeddingJobResponse {
        job_id: outcome.job_id(),
        asset_id: request.asset_id,
        segment_id: request.segment_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct EmbedTextRequest {
    pub asset_id: String,
    pub segment_id: String,
    pub text: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub model_ver: Option<String>,
}

/// Queue a real embedding job.
///
/// The job key includes the content hash, so re-submitting the same segment
/// with changed text creates a new job while unchanged text deduplicates.
/// The raw text rides only in the outbox payload.
pub async fn embed_text(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<EmbedTextRequest>,
) -> Result<Json<EmbeddingJobResponse>, ApiError> {
    validate_identity(&request.asset_id, &request.segment_id)?;
    if request.text.trim().is_empty() {
        return Err(CoreError::Validation("text cannot be empty".to_string()).into());
    }

    let model = request
        .model
        .unwrap_or_else(|| state.kernel.embedder.name().to_string());
    let model_ver = request
        .model_ver
        .unwrap_or_else(|| state.kernel.embedder.version().to_string());

    let payload = json!({
        "asset_id": request.asset_id,
        "segment_id": request.segment_id,
        "text": request.text,
        "model": model,
        "model_ver": model_ver,
    })
    .as_object()
    .cloned()
    .expect("object literal");

    let outcome = state
        .ingest
        .submit(
            auth.org_id,
            Some(auth.user_id),
            SubmitRequest::new("embed_text", payload),
        )
        .await?;

    Ok(Json(EmbeddingJobResponse {
        job_id: outcome.job_id(),
        asset_id: request.asset_id,
        segment_id: request.segment_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub text: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    5
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
}

/// Similarity search over the caller's tenant slice of the index.
pub async fn search_vectors(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, ApiError> {
    if request.text.trim().is_empty() {
        return Err(CoreError::Validation("text cannot be empty".to_string()).into());
    }

    let query = state.kernel.embedder.embed(&request.text)?;
    let hits = state
        .kernel
        .vectors
        .search(auth.org_id, &query, request.limit.clamp(1, 100))
        .await?;

    Ok(Json(SearchResponse { hits }))
}

fn validate_identity(asset_id: &str, segment_id: &str) -> Result<(), ApiError> {
    if asset_id.is_empty() {
        return Err(CoreError::Validation("asset_id cannot be empty".to_string()).into());
    }
    if segment_id.is_empty() {
        return Err(CoreError::Validation("segment_id cannot be empty".to_string()).into());
    }
    Ok(())
}
