//! Outbound user notifications for job lifecycle events.

use async_trait::async_trait;

use super::job::AnalysisJob;

/// Sink for user-facing job notifications.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn analysis_progress(&self, job: &AnalysisJob, progress: u8);
    async fn analysis_completed(&self, job: &AnalysisJob);
    async fn analysis_failed(&self, job: &AnalysisJob, error: &str);
}

/// Default sink that writes notifications to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn analysis_progress(&self, job: &AnalysisJob, progress: u8) {
        tracing::info!(
            job_id = %job.id,
            user_id = %job.user_id,
            progress,
            "analysis progress notification"
        );
    }

    async fn analysis_completed(&self, job: &AnalysisJob) {
        tracing::info!(
            job_id = %job.id,
            user_id = %job.user_id,
            document_id = %job.document_id,
            "analysis completed notification"
        );
    }

    async fn analysis_failed(&self, job: &AnalysisJob, error: &str) {
        tracing::warn!(
            job_id = %job.id,
            user_id = %job.user_id,
            error,
            "analysis failed notification"
        );
    }
}
