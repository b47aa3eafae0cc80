//! Async generation jobs: records, workers, and the service that owns them.

pub mod service;
pub mod state;
pub mod worker;

pub use service::{INTERRUPTED_MESSAGE, JobService, spawn_eviction_task};
pub use state::{
    CreatedJob, GenerationRequest, JobRecord, JobState, JobStatus, JobSummary, TransitionPayload,
};
pub use worker::{GenerationWorker, WorkerDeps};
