//! HTTP client for the document analysis worker.
//!
//! Every call goes through a circuit breaker and an exponential-backoff
//! retry loop, with bearer tokens drawn from a single-flight cache. The
//! breaker sees one outcome per logical call, not per attempt, so a burst
//! of retries against a dying worker counts as a single failure.

pub mod circuit;
pub mod error;
pub mod retry;
pub mod token;
pub mod types;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

pub use circuit::{Admission, BreakerState, CircuitBreaker};
pub use error::InvokeError;
pub use retry::RetryPolicy;
pub use token::{CachedTokenProvider, TokenSource};
pub use types::{
    AnalysisResults, AnalyzeRequest, AnalyzeResponse, CallbackConfig, DocumentMetadata,
    HealthResponse,
};

/// Operations the analysis worker exposes.
#[async_trait]
pub trait AnalyzerApi: Send + Sync {
    async fn analyze(&self, request: &AnalyzeRequest) -> Result<AnalyzeResponse, InvokeError>;
    async fn health(&self) -> Result<HealthResponse, InvokeError>;
}

/// Resilient client for the analysis worker.
pub struct AnalyzerClient {
    http: reqwest::Client,
    base_url: String,
    tokens: CachedTokenProvider,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl AnalyzerClient {
    pub fn new(base_url: String, source: Arc<dyn TokenSource>) -> Result<Self, InvokeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            tokens: CachedTokenProvider::new(source),
            breaker: CircuitBreaker::default(),
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Drive one logical call: breaker admission, then up to
    /// `max_retries` retries of the attempt closure, then a single breaker
    /// outcome for the whole chain.
    async fn execute<T, F, Fut>(&self, op: &str, call: F) -> Result<T, InvokeError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, InvokeError>>,
    {
        if self.breaker.try_acquire() == Admission::Rejected {
            tracing::warn!(op, "rejecting call, circuit breaker open");
            return Err(InvokeError::CircuitOpen {
                service: "analysis-worker".to_string(),
            });
        }

        match self.run_attempts(op, &call).await {
            Ok(value) => {
                self.breaker.record_success();
                Ok(value)
            }
            Err(e) => {
                self.breaker.record_failure();
                Err(e)
            }
        }
    }

    async fn run_attempts<T, F, Fut>(&self, op: &str, call: &F) -> Result<T, InvokeError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, InvokeError>>,
    {
        let mut attempt = 0u32;
        let mut refreshed_auth = false;

        loop {
            let token = self.tokens.token().await?;

            match call(token).await {
                Ok(value) => return Ok(value),
                Err(InvokeError::Status { status, message })
                    if status == reqwest::StatusCode::UNAUTHORIZED =>
                {
                    if refreshed_auth {
                        return Err(InvokeError::Auth(message));
                    }
                    // One forced refresh per call; does not consume a retry.
                    refreshed_auth = true;
                    self.tokens.invalidate().await;
                    tracing::warn!(op, "worker rejected token, refreshing and retrying");
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying worker call"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, InvokeError> {
    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(InvokeError::Status { status, message });
    }
    response
        .json()
        .await
        .map_err(|e| InvokeError::Decode(e.to_string()))
}

#[async_trait]
impl AnalyzerApi for AnalyzerClient {
    async fn analyze(&self, request: &AnalyzeRequest) -> Result<AnalyzeResponse, InvokeError> {
        let url = format!("{}/analyze", self.base_url);
        self.execute("analyze", |token| {
            let url = url.clone();
            async move {
                let response = self
                    .http
                    .post(&url)
                    .bearer_auth(token)
                    .json(request)
                    .send()
                    .await?;
                read_json(response).await
            }
        })
        .await
    }

    async fn health(&self) -> Result<HealthResponse, InvokeError> {
        let url = format!("{}/health", self.base_url);
        self.execute("health", |token| {
            let url = url.clone();
            async move {
                let response = self.http.get(&url).bearer_auth(token).send().await?;
                read_json(response).await
            }
        })
        .await
    }
}
