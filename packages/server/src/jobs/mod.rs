pub mod job;
pub mod notify;
pub mod orchestrator;
pub mod store;

pub use job::{AnalysisJob, JobPriority, JobStatus, JobUpdate};
pub use notify::{LogNotifier, Notifier};
pub use orchestrator::{AnalysisRequest, ExternalUpdate, JobError, JobOrchestrator, WorkerHealth};
pub use store::{InMemoryJobStore, JobStore, StoreError};
