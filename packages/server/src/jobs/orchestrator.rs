//! Job orchestration: owns the lifecycle of analysis jobs from submission
//! through dispatch to the worker and on to a terminal state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

use analyzer_client::{AnalyzeRequest, AnalyzerApi, CallbackConfig, DocumentMetadata};

use crate::auth::webhook::derive_callback_secret;

use super::job::{AnalysisJob, JobPriority, JobStatus, JobUpdate};
use super::notify::Notifier;
use super::store::{JobStore, StoreError};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job request: {0}")]
    Validation(String),
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("job {id} is already {status:?} and cannot be updated")]
    TerminalState { id: Uuid, status: JobStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Submission parameters for a new analysis.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub document_id: String,
    pub organization_id: String,
    pub user_id: String,
    pub document_content: String,
    pub document_type: String,
    pub priority: JobPriority,
}

/// Result of probing the analysis worker's health endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerHealth {
    pub available: bool,
    pub status: String,
    pub response_time_ms: u64,
}

/// Narrow surface the callback receiver uses to push worker-reported state
/// into jobs without taking a dependency on the full orchestrator API.
#[async_trait]
pub trait ExternalUpdate: Send + Sync {
    async fn apply_external(&self, id: Uuid, update: JobUpdate) -> Result<AnalysisJob, JobError>;
    async fn job_exists(&self, id: Uuid) -> bool;
}

pub struct JobOrchestrator {
    store: Arc<dyn JobStore>,
    client: Arc<dyn AnalyzerApi>,
    notifier: Arc<dyn Notifier>,
    /// Hot cache of non-terminal jobs for progress polling.
    active: DashMap<Uuid, AnalysisJob>,
    /// Per-job locks so updates to one job serialize while distinct jobs
    /// proceed in parallel.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    callback: Option<CallbackConfig>,
    job_timeout: Duration,
}

impl JobOrchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        client: Arc<dyn AnalyzerApi>,
        notifier: Arc<dyn Notifier>,
        callback: Option<CallbackConfig>,
        job_timeout: Duration,
    ) -> Self {
        Self {
            store,
            client,
            notifier,
            active: DashMap::new(),
            locks: DashMap::new(),
            callback,
            job_timeout,
        }
    }

    fn lock_for(&self, id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Validate and persist a new job, then dispatch it to the worker in the
    /// background. Returns the pending job record immediately.
    pub async fn start_job(self: Arc<Self>, request: AnalysisRequest) -> Result<AnalysisJob, JobError> {
        if request.document_id.trim().is_empty() {
            return Err(JobError::Validation("document_id is required".into()));
        }
        if request.organization_id.trim().is_empty() {
            return Err(JobError::Validation("organization_id is required".into()));
        }
        if request.user_id.trim().is_empty() {
            return Err(JobError::Validation("user_id is required".into()));
        }
        if request.document_content.is_empty() {
            return Err(JobError::Validation("document_content is empty".into()));
        }

        let job = AnalysisJob::builder()
            .document_id(request.document_id.clone())
            .organization_id(request.organization_id.clone())
            .user_id(request.user_id.clone())
            .priority(request.priority)
            .build();

        self.store.put(job.clone()).await?;
        self.active.insert(job.id, job.clone());

        tracing::info!(
            job_id = %job.id,
            document_id = %job.document_id,
            organization_id = %job.organization_id,
            "analysis job accepted"
        );

        let orchestrator = self.clone();
        let dispatched = job.clone();
        tokio::spawn(async move {
            orchestrator.dispatch(dispatched, request).await;
        });

        Ok(job)
    }

    /// Send the job to the analysis worker. Failures surface as a failed job,
    /// never as a panic in the background task.
    async fn dispatch(&self, job: AnalysisJob, request: AnalysisRequest) {
        let update = JobUpdate {
            status: Some(JobStatus::Processing),
            current_step: Some("dispatching".to_string()),
            ..Default::default()
        };
        if let Err(e) = self.apply_update(job.id, update).await {
            // Cancelled before dispatch; nothing to send.
            tracing::info!(job_id = %job.id, error = %e, "skipping dispatch");
            return;
        }

        let analyze_request = AnalyzeRequest::builder()
            .document_content(request.document_content)
            .document_type(request.document_type)
            .metadata(
                DocumentMetadata::builder()
                    .document_id(request.document_id)
                    .build(),
            )
            .build();
        // Each job gets its own callback secret so a leaked signature from
        // one analysis cannot forge callbacks for another.
        let callback = self.callback.clone().map(|mut cfg| {
            if let Some(base) = cfg.callback_secret.take() {
                cfg.callback_secret =
                    Some(derive_callback_secret(&base, &job.id.to_string()));
            }
            cfg
        });
        let analyze_request = AnalyzeRequest {
            callback_config: callback,
            ..analyze_request
        };

        match self.client.analyze(&analyze_request).await {
            Ok(response) => {
                tracing::info!(
                    job_id = %job.id,
                    analysis_id = %response.analysis_id,
                    status = %response.status,
                    "worker accepted analysis"
                );
                // Synchronous completion: some worker deployments return
                // results inline instead of via callback.
                if response.status == "completed" {
                    let result = self
                        .apply_update(job.id, JobUpdate::completed(response.results))
                        .await;
                    if let Err(e) = result {
                        tracing::info!(job_id = %job.id, error = %e, "inline result discarded");
                    }
                }
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "worker dispatch failed");
                let result = self
                    .apply_update(job.id, JobUpdate::failed(e.to_string()))
                    .await;
                if let Err(e) = result {
                    tracing::info!(job_id = %job.id, error = %e, "dispatch failure discarded");
                }
            }
        }
    }

    /// Apply a state change under the job's lock.
    ///
    /// Terminal jobs reject all changes, and progress never moves backwards;
    /// a stale lower progress value is dropped rather than treated as an
    /// error so late callbacks stay harmless.
    pub async fn apply_update(&self, id: Uuid, update: JobUpdate) -> Result<AnalysisJob, JobError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut job = self
            .store
            .get(id)
            .await?
            .ok_or(JobError::NotFound(id))?;

        if job.status.is_terminal() {
            return Err(JobError::TerminalState {
                id,
                status: job.status,
            });
        }

        if let Some(status) = update.status {
            if status == JobStatus::Processing && job.started_at.is_none() {
                job.started_at = Some(Utc::now());
            }
            if status.is_terminal() {
                job.completed_at = Some(Utc::now());
            }
            job.status = status;
        }
        if let Some(progress) = update.progress {
            if progress >= job.progress {
                job.progress = progress.min(100);
            } else {
                tracing::debug!(
                    job_id = %id,
                    current = job.progress,
                    reported = progress,
                    "ignoring stale progress report"
                );
            }
        }
        if let Some(step) = update.current_step {
            job.current_step = Some(step);
        }
        if let Some(error) = update.error {
            job.error = Some(error);
        }
        if let Some(results) = update.results {
            job.results = Some(results);
        }

        self.store.put(job.clone()).await?;
        if job.status.is_terminal() {
            self.active.remove(&id);
            self.locks.remove(&id);
        } else {
            self.active.insert(id, job.clone());
        }

        self.notify(&job).await;
        Ok(job)
    }

    async fn notify(&self, job: &AnalysisJob) {
        match job.status {
            JobStatus::Completed => self.notifier.analysis_completed(job).await,
            JobStatus::Failed | JobStatus::Timeout => {
                let error = job.error.as_deref().unwrap_or("analysis failed");
                self.notifier.analysis_failed(job, error).await;
            }
            JobStatus::Processing => {
                // Quarter-step milestones only, to keep notification volume down.
                if job.progress > 0 && job.progress < 100 && job.progress % 25 == 0 {
                    self.notifier.analysis_progress(job, job.progress).await;
                }
            }
            _ => {}
        }
    }

    /// Cancel a job. Returns whether the job was actually cancelled; jobs
    /// already in a terminal state are left untouched. Work already in
    /// flight at the worker is not interrupted, but its eventual result is
    /// rejected by the terminal-state guard.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, JobError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut job = self
            .store
            .get(id)
            .await?
            .ok_or(JobError::NotFound(id))?;

        if !job.is_active() {
            return Ok(false);
        }

        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.store.put(job.clone()).await?;
        self.active.remove(&id);
        self.locks.remove(&id);

        tracing::info!(job_id = %id, "analysis job cancelled");
        Ok(true)
    }

    /// Current job state, served from the hot cache when possible.
    pub async fn get_job(&self, id: Uuid) -> Result<AnalysisJob, JobError> {
        if let Some(job) = self.active.get(&id) {
            return Ok(job.value().clone());
        }
        self.store
            .get(id)
            .await?
            .ok_or(JobError::NotFound(id))
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Probe the analysis worker and measure the round trip.
    pub async fn worker_health(&self) -> WorkerHealth {
        let started = tokio::time::Instant::now();
        match self.client.health().await {
            Ok(health) => WorkerHealth {
                available: true,
                status: health.status,
                response_time_ms: started.elapsed().as_millis() as u64,
            },
            Err(e) => {
                tracing::warn!(error = %e, "worker health probe failed");
                WorkerHealth {
                    available: false,
                    status: e.to_string(),
                    response_time_ms: started.elapsed().as_millis() as u64,
                }
            }
        }
    }

    /// One pass of the timeout sweep: jobs running longer than the
    /// configured timeout move to `Timeout`.
    pub async fn sweep_timeouts(&self) -> Result<usize, JobError> {
        let now = Utc::now();
        let limit =
            chrono::Duration::from_std(self.job_timeout).unwrap_or(chrono::Duration::seconds(300));

        let mut timed_out = 0;
        let active = self.store.list_active().await?;
        for job in active {
            let deadline_base = job.started_at.unwrap_or(job.created_at);
            if now - deadline_base < limit {
                continue;
            }

            let update = JobUpdate {
                status: Some(JobStatus::Timeout),
                error: Some(format!(
                    "analysis exceeded {}s timeout",
                    self.job_timeout.as_secs()
                )),
                ..Default::default()
            };
            match self.apply_update(job.id, update).await {
                Ok(_) => {
                    timed_out += 1;
                    tracing::warn!(job_id = %job.id, "analysis job timed out");
                }
                Err(e) => {
                    tracing::debug!(job_id = %job.id, error = %e, "timeout sweep skipped job");
                }
            }
        }
        Ok(timed_out)
    }

    /// Background task that runs the timeout sweep periodically.
    pub fn spawn_timeout_sweeper(self: Arc<Self>, interval: Duration) {
        let orchestrator = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = orchestrator.sweep_timeouts().await {
                    tracing::error!(error = %e, "timeout sweep failed");
                }
            }
        });
    }
}

#[async_trait]
impl ExternalUpdate for JobOrchestrator {
    async fn apply_external(&self, id: Uuid, update: JobUpdate) -> Result<AnalysisJob, JobError> {
        self.apply_update(id, update).await
    }

    async fn job_exists(&self, id: Uuid) -> bool {
        self.get_job(id).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use analyzer_client::{AnalyzeResponse, HealthResponse, InvokeError};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FakeWorker {
        fail: bool,
        calls: AtomicU32,
    }

    impl FakeWorker {
        fn new(fail: bool) -> Self {
            Self {
                fail,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl AnalyzerApi for FakeWorker {
        async fn analyze(&self, _request: &AnalyzeRequest) -> Result<AnalyzeResponse, InvokeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(InvokeError::Status {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    message: "worker down".to_string(),
                });
            }
            Ok(AnalyzeResponse {
                analysis_id: "an-1".to_string(),
                status: "processing".to_string(),
                results: None,
                processing_time: None,
                error: None,
            })
        }

        async fn health(&self) -> Result<HealthResponse, InvokeError> {
            Ok(HealthResponse {
                status: "healthy".to_string(),
                version: None,
                uptime: None,
            })
        }
    }

    struct RecordingNotifier {
        progress: AtomicU32,
        completed: AtomicU32,
        failed: AtomicU32,
    }

    impl RecordingNotifier {
        fn new() -> Self {
            Self {
                progress: AtomicU32::new(0),
                completed: AtomicU32::new(0),
                failed: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn analysis_progress(&self, _job: &AnalysisJob, _progress: u8) {
            self.progress.fetch_add(1, Ordering::SeqCst);
        }
        async fn analysis_completed(&self, _job: &AnalysisJob) {
            self.completed.fetch_add(1, Ordering::SeqCst);
        }
        async fn analysis_failed(&self, _job: &AnalysisJob, _error: &str) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn request() -> AnalysisRequest {
        AnalysisRequest {
            document_id: "doc-1".to_string(),
            organization_id: "org-1".to_string(),
            user_id: "user-1".to_string(),
            document_content: "contract text".to_string(),
            document_type: "edital".to_string(),
            priority: JobPriority::Normal,
        }
    }

    fn orchestrator(fail: bool) -> (Arc<JobOrchestrator>, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier::new());
        let orchestrator = Arc::new(JobOrchestrator::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(FakeWorker::new(fail)),
            notifier.clone(),
            None,
            Duration::from_secs(300),
        ));
        (orchestrator, notifier)
    }

    async fn wait_for_status(
        orchestrator: &Arc<JobOrchestrator>,
        id: Uuid,
        status: JobStatus,
    ) -> AnalysisJob {
        for _ in 0..100 {
            if let Ok(job) = orchestrator.get_job(id).await {
                if job.status == status {
                    return job;
                }
            }
            tokio::task::yield_now().await;
        }
        panic!("job never reached {status:?}");
    }

    #[tokio::test]
    async fn start_job_dispatches_to_worker() {
        let (orchestrator, _) = orchestrator(false);
        let job = orchestrator.clone().start_job(request()).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);

        let job = wait_for_status(&orchestrator, job.id, JobStatus::Processing).await;
        assert!(job.started_at.is_some());
    }

    #[tokio::test]
    async fn dispatch_failure_fails_the_job() {
        let (orchestrator, notifier) = orchestrator(true);
        let job = orchestrator.clone().start_job(request()).await.unwrap();

        let job = wait_for_status(&orchestrator, job.id, JobStatus::Failed).await;
        assert!(job.error.as_deref().unwrap_or("").contains("worker down"));
        assert_eq!(notifier.failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejects_blank_identifiers() {
        let (orchestrator, _) = orchestrator(false);
        let mut bad = request();
        bad.document_id = "  ".to_string();
        assert!(matches!(
            orchestrator.clone().start_job(bad).await,
            Err(JobError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn terminal_jobs_reject_updates() {
        let (orchestrator, _) = orchestrator(false);
        let job = orchestrator.clone().start_job(request()).await.unwrap();
        wait_for_status(&orchestrator, job.id, JobStatus::Processing).await;

        orchestrator
            .apply_update(job.id, JobUpdate::completed(None))
            .await
            .unwrap();

        let result = orchestrator
            .apply_update(job.id, JobUpdate::progress(50, None))
            .await;
        assert!(matches!(result, Err(JobError::TerminalState { .. })));
    }

    #[tokio::test]
    async fn progress_never_moves_backwards() {
        let (orchestrator, _) = orchestrator(false);
        let job = orchestrator.clone().start_job(request()).await.unwrap();
        wait_for_status(&orchestrator, job.id, JobStatus::Processing).await;

        orchestrator
            .apply_update(job.id, JobUpdate::progress(60, None))
            .await
            .unwrap();
        let job = orchestrator
            .apply_update(job.id, JobUpdate::progress(40, None))
            .await
            .unwrap();
        assert_eq!(job.progress, 60);
    }

    #[tokio::test]
    async fn quarter_milestones_notify() {
        let (orchestrator, notifier) = orchestrator(false);
        let job = orchestrator.clone().start_job(request()).await.unwrap();
        wait_for_status(&orchestrator, job.id, JobStatus::Processing).await;

        for progress in [5u8, 25, 30, 50, 75] {
            let _ = orchestrator
                .apply_update(job.id, JobUpdate::progress(progress, None))
                .await
                .unwrap();
        }
        // 25, 50 and 75 notify; 5 and 30 do not.
        assert_eq!(notifier.progress.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_blocks_late_results() {
        let (orchestrator, _) = orchestrator(false);
        let job = orchestrator.clone().start_job(request()).await.unwrap();
        wait_for_status(&orchestrator, job.id, JobStatus::Processing).await;

        assert!(orchestrator.cancel(job.id).await.unwrap());
        assert!(!orchestrator.cancel(job.id).await.unwrap());

        // A late worker result lands after cancellation and is rejected.
        let late = orchestrator
            .apply_update(job.id, JobUpdate::completed(None))
            .await;
        assert!(matches!(late, Err(JobError::TerminalState { .. })));

        let job = orchestrator.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn sweep_times_out_overdue_jobs() {
        let notifier = Arc::new(RecordingNotifier::new());
        let orchestrator = Arc::new(JobOrchestrator::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(FakeWorker::new(false)),
            notifier.clone(),
            None,
            Duration::ZERO,
        ));

        let job = orchestrator.clone().start_job(request()).await.unwrap();
        wait_for_status(&orchestrator, job.id, JobStatus::Processing).await;

        let swept = orchestrator.sweep_timeouts().await.unwrap();
        assert_eq!(swept, 1);
        let job = orchestrator.get_job(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Timeout);
        assert_eq!(notifier.failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn startup_sweep_times_out_aged_leftover_jobs() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let mut leftover = AnalysisJob::new("doc-9", "org-1", "user-1");
        leftover.created_at = Utc::now() - chrono::Duration::seconds(400);
        let leftover_id = leftover.id;
        store.put(leftover).await.unwrap();

        let fresh = AnalysisJob::new("doc-10", "org-1", "user-1");
        let fresh_id = fresh.id;
        store.put(fresh).await.unwrap();

        let orchestrator = Arc::new(JobOrchestrator::new(
            store.clone(),
            Arc::new(FakeWorker::new(false)),
            Arc::new(RecordingNotifier::new()),
            None,
            Duration::from_secs(300),
        ));

        assert_eq!(orchestrator.sweep_timeouts().await.unwrap(), 1);
        let job = store.get(leftover_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Timeout);
        let job = store.get(fresh_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn worker_health_reports_availability() {
        let (orchestrator, _) = orchestrator(false);
        let health = orchestrator.worker_health().await;
        assert!(health.available);
        assert_eq!(health.status, "healthy");

        struct DownWorker;

        #[async_trait]
        impl AnalyzerApi for DownWorker {
            async fn analyze(
                &self,
                _request: &AnalyzeRequest,
            ) -> Result<AnalyzeResponse, InvokeError> {
                Err(InvokeError::CircuitOpen {
                    service: "analysis-worker".to_string(),
                })
            }
            async fn health(&self) -> Result<HealthResponse, InvokeError> {
                Err(InvokeError::CircuitOpen {
                    service: "analysis-worker".to_string(),
                })
            }
        }

        let orchestrator = Arc::new(JobOrchestrator::new(
            Arc::new(InMemoryJobStore::new()),
            Arc::new(DownWorker),
            Arc::new(RecordingNotifier::new()),
            None,
            Duration::from_secs(300),
        ));
        assert!(!orchestrator.worker_health().await.available);
    }
}
