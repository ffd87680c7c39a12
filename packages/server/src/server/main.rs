// Main entry point for the analysis control plane

use std::time::Duration;

use anyhow::{Context, Result};
use server_core::server::{build_app, build_state};
use server_core::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,analyzer_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Conforma analysis control plane");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(environment = %config.environment, "Configuration loaded");

    // Build application state
    let state = build_state(&config)?;

    // Time out jobs orphaned by a previous process, then keep sweeping
    let reconciled = state.orchestrator.sweep_timeouts().await?;
    if reconciled > 0 {
        tracing::warn!(reconciled, "timed out jobs left over from previous run");
    }
    state
        .orchestrator
        .clone()
        .spawn_timeout_sweeper(Duration::from_secs(10));

    let app = build_app(state, config.rate_limiting_enabled);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Callback endpoint: http://localhost:{}/callback/analysis", config.port);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}
