//! Analysis job model and lifecycle rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use analyzer_client::AnalysisResults;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl JobStatus {
    /// Terminal states accept no further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Normal,
    Low,
}

// ============================================================================
// Job Model
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct AnalysisJob {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    // Core identity
    pub document_id: String,
    pub organization_id: String,
    pub user_id: String,

    // State
    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = 0)]
    pub progress: u8,
    #[builder(default, setter(strip_option))]
    pub current_step: Option<String>,
    #[builder(default)]
    pub priority: JobPriority,

    // Outcome
    #[builder(default, setter(strip_option))]
    pub error: Option<String>,
    #[builder(default, setter(strip_option))]
    pub results: Option<AnalysisResults>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    pub fn new(document_id: &str, organization_id: &str, user_id: &str) -> Self {
        Self::builder()
            .document_id(document_id)
            .organization_id(organization_id)
            .user_id(user_id)
            .build()
    }

    /// Whether the job can still be cancelled.
    pub fn is_active(&self) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Processing)
    }
}

/// A partial state change to apply to a job.
///
/// Fields left as `None` keep their current value.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub progress: Option<u8>,
    pub current_step: Option<String>,
    pub error: Option<String>,
    pub results: Option<AnalysisResults>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn progress(progress: u8, step: Option<String>) -> Self {
        Self {
            progress: Some(progress),
            current_step: step,
            ..Default::default()
        }
    }

    pub fn completed(results: Option<AnalysisResults>) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            progress: Some(100),
            results,
            ..Default::default()
        }
    }

    pub fn failed(error: String) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> AnalysisJob {
        AnalysisJob::new("doc-1", "org-1", "user-1")
    }

    #[test]
    fn new_job_starts_pending_at_zero_progress() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0);
        assert!(job.started_at.is_none());
    }

    #[test]
    fn new_job_has_normal_priority_by_default() {
        assert_eq!(sample_job().priority, JobPriority::Normal);
    }

    #[test]
    fn terminal_states_are_exactly_the_four_end_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(JobStatus::Timeout.is_terminal());
    }

    #[test]
    fn active_jobs_can_be_cancelled() {
        let mut job = sample_job();
        assert!(job.is_active());
        job.status = JobStatus::Processing;
        assert!(job.is_active());
        job.status = JobStatus::Completed;
        assert!(!job.is_active());
    }
}
