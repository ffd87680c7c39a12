use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub environment: String,
    pub analyzer_url: String,
    /// Externally reachable base URL of this server, advertised to the
    /// worker as the callback target.
    pub public_url: Option<String>,
    pub jwt_secret: String,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    pub webhook_secret: String,
    /// Bearer token the worker presents on callback requests, if configured.
    pub callback_token: Option<String>,
    /// IPs allowed to post callbacks; empty means no IP filtering.
    pub callback_allowed_ips: Vec<String>,
    pub job_timeout: Duration,
    pub rate_limiting_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("PORT must be a valid number")?,
            environment,
            analyzer_url: env::var("ANALYZER_URL").context("ANALYZER_URL must be set")?,
            public_url: env::var("PUBLIC_URL").ok(),
            jwt_secret: env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            jwt_issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "conforma-api".to_string()),
            jwt_audience: env::var("JWT_AUDIENCE")
                .unwrap_or_else(|_| "analysis-worker".to_string()),
            webhook_secret: env::var("WEBHOOK_SECRET").context("WEBHOOK_SECRET must be set")?,
            callback_token: env::var("CALLBACK_TOKEN").ok(),
            callback_allowed_ips: env::var("CALLBACK_ALLOWED_IPS")
                .map(|s| {
                    s.split(',')
                        .map(|ip| ip.trim().to_string())
                        .filter(|ip| !ip.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            job_timeout: Duration::from_secs(
                env::var("JOB_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .context("JOB_TIMEOUT_SECS must be a valid number")?,
            ),
            rate_limiting_enabled: env::var("RATE_LIMITING_ENABLED")
                .map(|v| v == "true")
                .unwrap_or(true),
        })
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// How far a callback timestamp may drift from the receiver clock.
    /// Production runs a tighter window than development.
    pub fn timestamp_tolerance(&self) -> Duration {
        if self.is_production() {
            Duration::from_secs(300)
        } else {
            Duration::from_secs(600)
        }
    }
}
