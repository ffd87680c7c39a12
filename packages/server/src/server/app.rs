//! Application setup and server configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::Extension,
    http::{
        header::{AUTHORIZATION, CONTENT_TYPE},
        Method,
    },
    routing::{get, post},
    Router,
};
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use analyzer_client::{AnalyzerClient, CallbackConfig, InvokeError, TokenSource};

use crate::auth::TokenService;
use crate::config::Config;
use crate::jobs::{ExternalUpdate, InMemoryJobStore, JobOrchestrator, LogNotifier};
use crate::server::receiver::CallbackReceiver;
use crate::server::routes::{
    analysis_callback_handler, callback_health_handler, callback_metrics_handler,
    document_callback_handler, health_handler, worker_health_handler,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub receiver: Arc<CallbackReceiver>,
    pub orchestrator: Arc<JobOrchestrator>,
    pub tokens: Arc<TokenService>,
    pub started_at: std::time::Instant,
}

/// Bridges the worker client's token needs onto the local token service:
/// the control plane mints its own service tokens because both sides share
/// the signing secret.
struct ServiceTokenSource {
    tokens: Arc<TokenService>,
}

#[async_trait]
impl TokenSource for ServiceTokenSource {
    async fn fetch(&self) -> Result<(String, Duration), InvokeError> {
        let token = self
            .tokens
            .issue_service_token("api-server", &["analysis:execute"])
            .map_err(|e| InvokeError::Token(e.to_string()))?;
        // Tokens live an hour; hand back a slightly shorter lease so the
        // cache rolls over before the worker sees an expired credential.
        Ok((token, Duration::from_secs(3300)))
    }
}

/// Wire up the full application state from configuration.
pub fn build_state(config: &Config) -> Result<AppState> {
    let tokens = Arc::new(TokenService::new(
        &config.jwt_secret,
        config.jwt_issuer.clone(),
        config.jwt_audience.clone(),
    ));

    let client = AnalyzerClient::new(
        config.analyzer_url.clone(),
        Arc::new(ServiceTokenSource {
            tokens: tokens.clone(),
        }),
    )
    .context("Failed to create analyzer client")?;

    let callback = config.public_url.as_ref().map(|base| CallbackConfig {
        callback_url: format!("{}/callback/analysis", base.trim_end_matches('/')),
        callback_events: vec![
            "processing".to_string(),
            "progress_update".to_string(),
            "completed".to_string(),
            "failed".to_string(),
        ],
        callback_secret: Some(config.webhook_secret.clone()),
    });

    let orchestrator = Arc::new(JobOrchestrator::new(
        Arc::new(InMemoryJobStore::new()),
        Arc::new(client),
        Arc::new(LogNotifier),
        callback,
        config.job_timeout,
    ));

    let receiver = Arc::new(CallbackReceiver::new(
        orchestrator.clone() as Arc<dyn ExternalUpdate>,
        config.webhook_secret.clone(),
        config.callback_token.clone(),
        config.callback_allowed_ips.clone(),
        config.timestamp_tolerance(),
    ));

    Ok(AppState {
        receiver,
        orchestrator,
        tokens,
        started_at: std::time::Instant::now(),
    })
}

/// Build the Axum application router
///
/// Rate limiting can be disabled for tests, where requests arrive without
/// the connection metadata the governor keys on.
pub fn build_app(state: AppState, rate_limiting_enabled: bool) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE]);

    let mut router = Router::new()
        .route("/callback/analysis", post(analysis_callback_handler))
        .route("/callback/document", post(document_callback_handler))
        .route("/callback/health", get(callback_health_handler))
        .route("/callback/metrics", get(callback_metrics_handler));

    if rate_limiting_enabled {
        // Callback burst from a busy worker stays well under this.
        let rate_limit_config = Arc::new(
            GovernorConfigBuilder::default()
                .per_second(10)
                .burst_size(20)
                .use_headers()
                .finish()
                .expect("Rate limiter configuration is valid and should never fail"),
        );
        router = router.layer(GovernorLayer {
            config: rate_limit_config,
        });
    }

    router
        // Health checks (no rate limit)
        .route("/health", get(health_handler))
        .route("/health/worker", get(worker_health_handler))
        .layer(Extension(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
