//! Liveness and readiness probes.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::server::app::AppState;

const SERVICE_NAME: &str = "conveyor-api";

#[derive(Serialize)]
pub struct HealthResponse {
    ok: bool,
    service: &'static str,
    version: &'static str,
    env: String,
    started_at: String,
}

/// Liveness: the process is up. No dependency checks.
pub async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        service: SERVICE_NAME,
        version: env!("CARGO_PKG_VERSION"),
        env: state.kernel.config.app_env.clone(),
        started_at: state.started_at.to_rfc3339(),
    })
}

#[derive(Serialize)]
pub struct DepHealth {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    ready: bool,
    service: &'static str,
    database: DepHealth,
    broker: DepHealth,
}

/// Readiness: probes the ledger store and the broker with a bounded wait.
///
/// Returns 503 with per-dependency detail when anything is unreachable.
pub async fn readyz(State(state): State<AppState>) -> (StatusCode, Json<ReadinessResponse>) {
    let timeout = std::time::Duration::from_secs(5);

    let database = probe(tokio::time::timeout(timeout, state.kernel.store.ping()).await);
    let broker = probe(tokio::time::timeout(timeout, state.kernel.broker.ping()).await);

    let ready = database.ok && broker.ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            service: SERVICE_NAME,
            database,
            broker,
        }),
    )
}

fn probe<E: std::fmt::Display>(
    outcome: Result<Result<(), E>, tokio::time::error::Elapsed>,
) -> DepHealth {
    match outcome {
        Ok(Ok(())) => DepHealth {
            ok: true,
            error: None,
        },
        Ok(Err(e)) => DepHealth {
            ok: false,
            error: Some(e.to_string()),
        },
        Err(_) => DepHealth {
            ok: false,
            error: Some("probe timeout (>5s)".to_string()),
        },
    }
}
