use axum::{extract::Extension, http::StatusCode, Json};
use serde::Serialize;

use crate::server::app::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    active_jobs: usize,
    uptime_secs: u64,
}

/// Health check endpoint
///
/// The control plane holds job state in process, so reachability plus the
/// active job count is the whole story. Worker reachability is reported by
/// the worker's own health surface, not proxied here.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            active_jobs: state.orchestrator.active_count(),
            uptime_secs: state.started_at.elapsed().as_secs(),
        }),
    )
}

/// Worker health probe endpoint
///
/// Returns 200 when the analysis worker answers its health check, 503 when
/// the probe fails or the circuit is open.
pub async fn worker_health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<crate::jobs::WorkerHealth>) {
    let health = state.orchestrator.worker_health().await;
    let status_code = if health.available {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status_code, Json(health))
}
