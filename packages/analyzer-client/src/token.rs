use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::InvokeError;

/// Produces bearer tokens for calls to the analysis worker.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Fetch a fresh token and its lifetime.
    async fn fetch(&self) -> Result<(String, Duration), InvokeError>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Token cache with single-flight refresh.
///
/// Concurrent callers that find the cache empty or expired serialize on the
/// refresh lock, so the underlying source sees at most one fetch per expiry.
/// Tokens are refreshed slightly before their actual expiry to avoid handing
/// out a credential that dies in transit.
pub struct CachedTokenProvider {
    source: Arc<dyn TokenSource>,
    cached: Mutex<Option<CachedToken>>,
    refresh_margin: Duration,
}

impl CachedTokenProvider {
    pub fn new(source: Arc<dyn TokenSource>) -> Self {
        Self {
            source,
            cached: Mutex::new(None),
            refresh_margin: Duration::from_secs(30),
        }
    }

    /// Current token, refreshing through the source if needed.
    pub async fn token(&self) -> Result<String, InvokeError> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if Instant::now() + self.refresh_margin < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let (value, ttl) = self.source.fetch().await?;
        let token = CachedToken {
            value: value.clone(),
            expires_at: Instant::now() + ttl,
        };
        *cached = Some(token);

        tracing::debug!(ttl_secs = ttl.as_secs(), "refreshed worker token");
        Ok(value)
    }

    /// Drop the cached token so the next call fetches a fresh one.
    /// Used after a 401 to force re-authentication.
    pub async fn invalidate(&self) {
        let mut cached = self.cached.lock().await;
        *cached = None;
    }
}
