//! HTTP surface for worker callbacks.
//!
//! Signature verification runs against the raw request body, before any
//! JSON parsing, so handlers take `Bytes` rather than `Json` extractors.

use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Extension},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use crate::server::app::AppState;
use crate::server::receiver::CallbackOutcome;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// First hop of `x-forwarded-for` when present, otherwise the peer address
/// of the connection so direct connections cannot dodge the IP allowlist.
fn client_ip(headers: &HeaderMap, peer: Option<&ConnectInfo<SocketAddr>>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|ip| ip.trim().to_string())
        .or_else(|| peer.map(|info| info.0.ip().to_string()))
}

/// Attach the caller's request id to the response, minting one when the
/// caller did not send any.
fn with_request_id(headers: &HeaderMap, response: Response) -> Response {
    let mut response = response;
    match headers.get(REQUEST_ID_HEADER) {
        Some(id) => {
            response
                .headers_mut()
                .insert(REQUEST_ID_HEADER, id.clone());
        }
        None => {
            if let Ok(id) = uuid::Uuid::new_v4().to_string().parse() {
                response.headers_mut().insert(REQUEST_ID_HEADER, id);
            }
        }
    }
    response
}

/// POST /callback/analysis
pub async fn analysis_callback_handler(
    Extension(state): Extension<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = std::time::Instant::now();
    let ip = client_ip(&headers, peer.as_ref());
    let outcome = state
        .receiver
        .handle_analysis_callback(&headers, ip.as_deref(), &body)
        .await;
    let processing_time = started.elapsed().as_secs_f64();

    let response = match outcome {
        CallbackOutcome::Accepted {
            analysis_id,
            status,
            callback_id,
        } => (
            StatusCode::OK,
            Json(json!({
                "status": "success",
                "analysis_id": analysis_id,
                "callback_status": status,
                "callback_id": callback_id,
                "processing_time": processing_time,
            })),
        ),
        CallbackOutcome::DuplicateIgnored {
            analysis_id,
            callback_id,
        } => (
            StatusCode::OK,
            Json(json!({
                "status": "duplicate_ignored",
                "analysis_id": analysis_id,
                "callback_id": callback_id,
                "processing_time": processing_time,
            })),
        ),
        CallbackOutcome::Unauthorized { reason } => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "status": "error", "error": reason })),
        ),
        CallbackOutcome::Invalid { message } => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "error": message })),
        ),
        CallbackOutcome::UnknownJob { analysis_id } => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "status": "error",
                "error": format!("no job found for analysis {analysis_id}"),
            })),
        ),
        CallbackOutcome::Error { message } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "status": "error",
                "error": message,
                "processing_time": processing_time,
            })),
        ),
    };

    with_request_id(&headers, response.into_response())
}

#[derive(Debug, Deserialize)]
struct DocumentCallback {
    document_id: String,
    status: String,
    #[serde(default)]
    processing_info: Option<serde_json::Value>,
}

/// POST /callback/document
///
/// Document-level progress from the worker's preprocessing stage. Logged
/// for observability; it carries no job state.
pub async fn document_callback_handler(
    Extension(state): Extension<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = client_ip(&headers, peer.as_ref());
    if let Err(reason) = state
        .receiver
        .validate_request(&headers, ip.as_deref(), &body)
    {
        return with_request_id(
            &headers,
            (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "status": "error", "error": reason })),
            )
                .into_response(),
        );
    }

    let response = match serde_json::from_slice::<DocumentCallback>(&body) {
        Ok(callback) => {
            tracing::info!(
                document_id = %callback.document_id,
                status = %callback.status,
                has_processing_info = callback.processing_info.is_some(),
                "document callback received"
            );
            (StatusCode::OK, Json(json!({ "status": "success" })))
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "error": format!("malformed callback body: {e}") })),
        ),
    };

    with_request_id(&headers, response.into_response())
}

/// GET /callback/health
pub async fn callback_health_handler(
    Extension(state): Extension<AppState>,
) -> impl IntoResponse {
    let metrics = state.receiver.metrics.snapshot();
    Json(json!({
        "status": "healthy",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "callbacks": {
            "received": metrics.total_received,
            "processed": metrics.successful_processed,
            "rejected": metrics.invalid_signatures,
        },
    }))
}

/// GET /callback/metrics
pub async fn callback_metrics_handler(
    Extension(state): Extension<AppState>,
) -> impl IntoResponse {
    Json(state.receiver.metrics.snapshot())
}
