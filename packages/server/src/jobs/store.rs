//! Job persistence behind a trait so tests and deployments can swap backends.

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use uuid::Uuid;

use super::job::AnalysisJob;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(Uuid),
    #[error("storage backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: Uuid) -> Result<Option<AnalysisJob>, StoreError>;
    async fn put(&self, job: AnalysisJob) -> Result<(), StoreError>;
    /// Fetch jobs that have not reached a terminal state.
    async fn list_active(&self) -> Result<Vec<AnalysisJob>, StoreError>;
    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

/// In-process store backed by a concurrent map.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<Uuid, AnalysisJob>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, id: Uuid) -> Result<Option<AnalysisJob>, StoreError> {
        Ok(self.jobs.get(&id).map(|entry| entry.value().clone()))
    }

    async fn put(&self, job: AnalysisJob) -> Result<(), StoreError> {
        self.jobs.insert(job.id, job);
        Ok(())
    }

    async fn list_active(&self) -> Result<Vec<AnalysisJob>, StoreError> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| !entry.value().status.is_terminal())
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        self.jobs.remove(&id);
        Ok(())
    }
}
