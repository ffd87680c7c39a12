use thiserror::Error;

/// Failure modes for calls routed through the resilient invoker.
#[derive(Debug, Error)]
pub enum InvokeError {
    /// Circuit breaker is open; the call was rejected without hitting the wire.
    #[error("circuit breaker is open, rejecting call to {service}")]
    CircuitOpen { service: String },

    /// Transport-level failure (connect, timeout, body read).
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// Authentication was rejected even after a forced token refresh.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The token source itself failed to produce a credential.
    #[error("token acquisition failed: {0}")]
    Token(String),

    /// Non-success HTTP status from the remote service.
    #[error("service returned {status}: {message}")]
    Status {
        status: reqwest::StatusCode,
        message: String,
    },

    /// The response body could not be decoded.
    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl InvokeError {
    /// Whether a retry has any chance of succeeding.
    ///
    /// Network and timeout failures are retryable, as are 5xx responses,
    /// 429 (rate limited) and 408 (request timeout). Everything else,
    /// including auth rejections and other 4xx statuses, is fatal.
    pub fn is_retryable(&self) -> bool {
        match self {
            InvokeError::Transport(e) => {
                e.is_timeout() || e.is_connect() || e.is_request() || e.is_body()
            }
            InvokeError::Status { status, .. } => {
                status.is_server_error()
                    || *status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || *status == reqwest::StatusCode::REQUEST_TIMEOUT
            }
            _ => false,
        }
    }
}
