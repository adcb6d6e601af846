//! HTTP application assembly.

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use chrono::{DateTime, Utc};
use tower_http::trace::TraceLayer;

use crate::kernel::jobs::{IngestService, StatusReader};
use crate::kernel::Kernel;

use super::middleware::{require_auth, JwtVerifier};
use super::routes::{health, jobs, vectors};

/// Shared state threaded through every route.
#[derive(Clone)]
pub struct AppState {
    pub kernel: Arc<Kernel>,
    pub ingest: Arc<IngestService>,
    pub status: Arc<StatusReader>,
    pub started_at: DateTime<Utc>,
}

/// Build the API router over a kernel.
///
/// Job and vector routes require a bearer token; health probes do not.
pub fn build_app(kernel: Arc<Kernel>) -> Router {
    let verifier = Arc::new(JwtVerifier::new(&kernel.config.auth_jwt_secret));

    let state = AppState {
        ingest: Arc::new(kernel.ingest()),
        status: Arc::new(kernel.status_reader()),
        kernel,
        started_at: Utc::now(),
    };

    let protected = Router::new()
        .route("/jobs", post(jobs::create_job))
        .route("/jobs/:id", get(jobs::get_job_status))
        .route("/vectors/mock", post(vectors::create_mock_embedding))
        .route("/vectors/embed", post(vectors::embed_text))
        .route("/vectors/search", post(vectors::search_vectors))
        .route_layer(axum::middleware::from_fn_with_state(
            verifier,
            require_auth,
        ));

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
