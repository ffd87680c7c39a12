//! Callback receiver: validates, deduplicates and applies status callbacks
//! posted by the analysis worker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use analyzer_client::AnalysisResults;

use crate::auth::webhook::{derive_callback_secret, verify_webhook_signature, SignatureError};
use crate::jobs::{ExternalUpdate, JobError, JobStatus, JobUpdate};

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";

/// Status values the worker may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallbackStatus {
    Processing,
    ProgressUpdate,
    Completed,
    Failed,
}

impl CallbackStatus {
    fn as_str(&self) -> &'static str {
        match self {
            CallbackStatus::Processing => "processing",
            CallbackStatus::ProgressUpdate => "progress_update",
            CallbackStatus::Completed => "completed",
            CallbackStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackProgress {
    pub percentage: f64,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub estimated_completion: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackError {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
    #[serde(default)]
    pub details: Option<Value>,
}

/// Callback body posted by the worker. Unknown fields are preserved so
/// worker-side additions never break parsing.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackEnvelope {
    pub analysis_id: String,
    pub document_id: String,
    pub organization_id: String,
    pub status: CallbackStatus,
    #[serde(default)]
    pub progress: Option<CallbackProgress>,
    #[serde(default)]
    pub results: Option<AnalysisResults>,
    #[serde(default)]
    pub error: Option<CallbackError>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub processing_time: Option<f64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// How a callback was disposed of. The HTTP layer maps these to responses.
/// `callback_id` is the dedup fingerprint, echoed so the worker can
/// correlate retries with their first delivery.
#[derive(Debug)]
pub enum CallbackOutcome {
    Accepted {
        analysis_id: Uuid,
        status: CallbackStatus,
        callback_id: String,
    },
    DuplicateIgnored {
        analysis_id: Uuid,
        callback_id: String,
    },
    Unauthorized {
        reason: String,
    },
    Invalid {
        message: String,
    },
    UnknownJob {
        analysis_id: Uuid,
    },
    Error {
        message: String,
    },
}

/// Rolling counters exposed on the metrics endpoint.
#[derive(Default)]
pub struct CallbackMetrics {
    pub total_received: AtomicU64,
    pub successful_processed: AtomicU64,
    pub failed_processed: AtomicU64,
    pub invalid_signatures: AtomicU64,
    pub duplicate_callbacks: AtomicU64,
    mean_processing_time: Mutex<(f64, u64)>,
    error_codes: Mutex<HashMap<String, u64>>,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub total_received: u64,
    pub successful_processed: u64,
    pub failed_processed: u64,
    pub invalid_signatures: u64,
    pub duplicate_callbacks: u64,
    pub average_processing_time: f64,
    pub error_codes: HashMap<String, u64>,
}

impl CallbackMetrics {
    fn record_processing_time(&self, seconds: f64) {
        let mut guard = match self.mean_processing_time.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let (mean, count) = *guard;
        let count = count + 1;
        *guard = (mean + (seconds - mean) / count as f64, count);
    }

    fn record_error_code(&self, code: &str) {
        let mut guard = match self.error_codes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard.entry(code.to_string()).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let average = match self.mean_processing_time.lock() {
            Ok(guard) => guard.0,
            Err(poisoned) => poisoned.into_inner().0,
        };
        let error_codes = match self.error_codes.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        MetricsSnapshot {
            total_received: self.total_received.load(Ordering::Relaxed),
            successful_processed: self.successful_processed.load(Ordering::Relaxed),
            failed_processed: self.failed_processed.load(Ordering::Relaxed),
            invalid_signatures: self.invalid_signatures.load(Ordering::Relaxed),
            duplicate_callbacks: self.duplicate_callbacks.load(Ordering::Relaxed),
            average_processing_time: average,
            error_codes,
        }
    }
}

// Ledger bounds: at the cap the oldest half is evicted in one sweep.
const LEDGER_CAP: usize = 1000;
const LEDGER_KEEP: usize = 500;

#[derive(Default)]
struct FingerprintLedger {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl FingerprintLedger {
    fn contains(&self, fingerprint: &str) -> bool {
        self.seen.contains(fingerprint)
    }

    /// Record a delivered callback. Only called once the callback has
    /// actually been applied (or confirmed as a replay): recording earlier
    /// would make the worker's retry of a transient failure look like a
    /// duplicate and lose the state change.
    fn record(&mut self, fingerprint: String) {
        if self.seen.contains(&fingerprint) {
            return;
        }
        if self.order.len() >= LEDGER_CAP {
            while self.order.len() > LEDGER_KEEP {
                if let Some(old) = self.order.pop_front() {
                    self.seen.remove(&old);
                }
            }
        }
        self.seen.insert(fingerprint.clone());
        self.order.push_back(fingerprint);
    }
}

pub struct CallbackReceiver {
    jobs: Arc<dyn ExternalUpdate>,
    webhook_secret: String,
    callback_token: Option<String>,
    allowed_ips: Vec<String>,
    timestamp_tolerance: Duration,
    ledger: Mutex<FingerprintLedger>,
    pub metrics: CallbackMetrics,
}

impl CallbackReceiver {
    pub fn new(
        jobs: Arc<dyn ExternalUpdate>,
        webhook_secret: String,
        callback_token: Option<String>,
        allowed_ips: Vec<String>,
        timestamp_tolerance: Duration,
    ) -> Self {
        Self {
            jobs,
            webhook_secret,
            callback_token,
            allowed_ips,
            timestamp_tolerance,
            ledger: Mutex::new(FingerprintLedger::default()),
            metrics: CallbackMetrics::default(),
        }
    }

    /// Full pipeline for an analysis callback: security checks, schema
    /// validation, dedup, then dispatch into the job state machine.
    pub async fn handle_analysis_callback(
        &self,
        headers: &HeaderMap,
        client_ip: Option<&str>,
        body: &[u8],
    ) -> CallbackOutcome {
        self.metrics.total_received.fetch_add(1, Ordering::Relaxed);

        if let Err(reason) = self.validate_security(headers, client_ip, body) {
            self.metrics
                .invalid_signatures
                .fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                client_ip = client_ip.unwrap_or("unknown"),
                reason,
                "rejected callback with invalid credentials"
            );
            return CallbackOutcome::Unauthorized {
                reason: reason.to_string(),
            };
        }

        let envelope: CallbackEnvelope = match serde_json::from_slice(body) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.metrics
                    .failed_processed
                    .fetch_add(1, Ordering::Relaxed);
                return CallbackOutcome::Invalid {
                    message: format!("malformed callback body: {e}"),
                };
            }
        };

        let analysis_id = match Uuid::parse_str(&envelope.analysis_id) {
            Ok(id) => id,
            Err(_) => {
                self.metrics
                    .failed_processed
                    .fetch_add(1, Ordering::Relaxed);
                return CallbackOutcome::Invalid {
                    message: "analysis_id is not a valid job id".to_string(),
                };
            }
        };

        let callback_id = fingerprint(
            &envelope.analysis_id,
            envelope.status.as_str(),
            envelope.timestamp.as_deref().unwrap_or(""),
        );
        if self.seen_before(&callback_id) {
            self.metrics
                .duplicate_callbacks
                .fetch_add(1, Ordering::Relaxed);
            tracing::info!(%analysis_id, status = envelope.status.as_str(), "duplicate callback ignored");
            return CallbackOutcome::DuplicateIgnored {
                analysis_id,
                callback_id,
            };
        }

        let update = match Self::to_update(&envelope) {
            Ok(update) => update,
            Err(message) => {
                self.metrics
                    .failed_processed
                    .fetch_add(1, Ordering::Relaxed);
                return CallbackOutcome::Invalid { message };
            }
        };

        match self.jobs.apply_external(analysis_id, update).await {
            Ok(_) => {
                self.record_fingerprint(callback_id.clone());
                self.metrics
                    .successful_processed
                    .fetch_add(1, Ordering::Relaxed);
                match envelope.status {
                    CallbackStatus::Completed => {
                        if let Some(seconds) = envelope.processing_time {
                            self.metrics.record_processing_time(seconds);
                        }
                    }
                    CallbackStatus::Failed => {
                        let code = envelope
                            .error
                            .as_ref()
                            .and_then(|e| e.code.as_deref())
                            .unwrap_or("unknown");
                        self.metrics.record_error_code(code);
                    }
                    _ => {}
                }
                tracing::info!(%analysis_id, status = envelope.status.as_str(), "callback applied");
                CallbackOutcome::Accepted {
                    analysis_id,
                    status: envelope.status,
                    callback_id,
                }
            }
            // A callback for a finished job is a replay, not an error.
            Err(JobError::TerminalState { .. }) => {
                self.record_fingerprint(callback_id.clone());
                self.metrics
                    .duplicate_callbacks
                    .fetch_add(1, Ordering::Relaxed);
                CallbackOutcome::DuplicateIgnored {
                    analysis_id,
                    callback_id,
                }
            }
            Err(JobError::NotFound(_)) => {
                self.metrics
                    .failed_processed
                    .fetch_add(1, Ordering::Relaxed);
                CallbackOutcome::UnknownJob { analysis_id }
            }
            Err(JobError::Validation(message)) => {
                self.metrics
                    .failed_processed
                    .fetch_add(1, Ordering::Relaxed);
                CallbackOutcome::Invalid { message }
            }
            Err(e) => {
                self.metrics
                    .failed_processed
                    .fetch_add(1, Ordering::Relaxed);
                tracing::error!(%analysis_id, error = %e, "callback processing failed");
                CallbackOutcome::Error {
                    message: "internal error".to_string(),
                }
            }
        }
    }

    /// Security checks alone, for callback routes that do their own body
    /// handling. Counts failures against the invalid-signature metric.
    pub fn validate_request(
        &self,
        headers: &HeaderMap,
        client_ip: Option<&str>,
        body: &[u8],
    ) -> Result<(), String> {
        self.validate_security(headers, client_ip, body).map_err(|reason| {
            self.metrics
                .invalid_signatures
                .fetch_add(1, Ordering::Relaxed);
            reason.to_string()
        })
    }

    fn validate_security(
        &self,
        headers: &HeaderMap,
        client_ip: Option<&str>,
        body: &[u8],
    ) -> Result<(), &'static str> {
        if !self.allowed_ips.is_empty() {
            let ip = client_ip.ok_or("client ip unavailable")?;
            if !self.allowed_ips.iter().any(|allowed| allowed == ip) {
                return Err("ip not allowed");
            }
        }

        if let Some(expected) = &self.callback_token {
            let presented = headers
                .get(axum::http::header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .ok_or("missing bearer token")?;
            if presented != expected {
                return Err("bad bearer token");
            }
        }

        let timestamp = headers
            .get(TIMESTAMP_HEADER)
            .and_then(|v| v.to_str().ok());

        if let Some(ts) = timestamp {
            let ts_secs: i64 = ts.parse().map_err(|_| "unparseable timestamp")?;
            let now = chrono::Utc::now().timestamp();
            if (now - ts_secs).unsigned_abs() > self.timestamp_tolerance.as_secs() {
                return Err("timestamp outside tolerance");
            }
        }

        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or("missing signature")?;

        let result = verify_webhook_signature(&self.webhook_secret, body, signature, timestamp);

        // Workers given a per-job secret sign with that instead of the
        // shared one. Re-derive it from the analysis id in the body and
        // try again before rejecting.
        let result = match result {
            Err(SignatureError::Mismatch) => match Self::analysis_id_hint(body) {
                Some(id) => {
                    let derived = derive_callback_secret(&self.webhook_secret, &id);
                    verify_webhook_signature(&derived, body, signature, timestamp)
                }
                None => Err(SignatureError::Mismatch),
            },
            other => other,
        };

        result.map_err(|e| match e {
            SignatureError::Missing => "missing signature",
            SignatureError::BadEncoding => "signature not hex",
            SignatureError::Mismatch => "signature mismatch",
        })
    }

    /// Best-effort read of the analysis id from an unverified body, used
    /// only to pick the right verification secret.
    fn analysis_id_hint(body: &[u8]) -> Option<String> {
        serde_json::from_slice::<Value>(body)
            .ok()?
            .get("analysis_id")?
            .as_str()
            .map(|s| s.to_string())
    }

    fn seen_before(&self, fingerprint: &str) -> bool {
        let ledger = match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ledger.contains(fingerprint)
    }

    fn record_fingerprint(&self, fingerprint: String) {
        let mut ledger = match self.ledger.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ledger.record(fingerprint)
    }

    fn to_update(envelope: &CallbackEnvelope) -> Result<JobUpdate, String> {
        match envelope.status {
            CallbackStatus::Processing => Ok(JobUpdate {
                status: Some(JobStatus::Processing),
                progress: Some(5),
                current_step: Some("analysis started".to_string()),
                ..Default::default()
            }),
            CallbackStatus::ProgressUpdate => {
                let progress = envelope
                    .progress
                    .as_ref()
                    .ok_or("progress_update callback is missing progress")?;
                if !(0.0..=100.0).contains(&progress.percentage) {
                    return Err(format!(
                        "progress percentage {} out of range",
                        progress.percentage
                    ));
                }
                Ok(JobUpdate {
                    status: Some(JobStatus::Processing),
                    progress: Some(progress.percentage as u8),
                    current_step: progress.current_step.clone(),
                    ..Default::default()
                })
            }
            CallbackStatus::Completed => Ok(JobUpdate::completed(envelope.results.clone())),
            CallbackStatus::Failed => {
                let message = envelope
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "analysis failed".to_string());
                Ok(JobUpdate::failed(message))
            }
        }
    }

    pub async fn job_exists(&self, id: Uuid) -> bool {
        self.jobs.job_exists(id).await
    }
}

/// Dedup fingerprint: sha256 over id, status and worker timestamp,
/// truncated to 16 hex characters.
fn fingerprint(analysis_id: &str, status: &str, timestamp: &str) -> String {
    let digest = Sha256::digest(format!("{analysis_id}-{status}-{timestamp}").as_bytes());
    hex::encode(digest)[..16].to_string()
}
