//! Job service: the public entry point for creating, polling and
//! cancelling generation jobs.
//!
//! Owns the worker registry and the process epoch clients use to detect
//! restarts. All record mutation goes through the injected [`JobStore`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::client::JobApi;
use crate::config::ServiceConfig;
use crate::error::{ClientError, JobError};
use crate::jobs::state::{
    CreatedJob, GenerationRequest, JobState, JobStatus, JobSummary, TransitionPayload,
};
use crate::jobs::worker::{GenerationWorker, WorkerDeps};
use crate::provider::GenerationProvider;
use crate::store::JobStore;

/// Message recorded on jobs that were active when the process stopped.
pub const INTERRUPTED_MESSAGE: &str = "Server restarted before the job finished";

/// Tracked worker task.
struct TrackedWorker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Creates jobs, reports status, accepts cancellation.
pub struct JobService {
    store: Arc<dyn JobStore>,
    provider: Arc<dyn GenerationProvider>,
    config: ServiceConfig,
    server_epoch: i64,
    /// Running workers, keyed by job ID.
    workers: Arc<RwLock<HashMap<Uuid, TrackedWorker>>>,
}

impl JobService {
    /// Create a new service. The server epoch is taken from the current time.
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn GenerationProvider>,
        config: ServiceConfig,
    ) -> Self {
        Self {
            store,
            provider,
            config,
            server_epoch: Utc::now().timestamp_millis(),
            workers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Override the server epoch.
    pub fn with_server_epoch(mut self, epoch: i64) -> Self {
        self.server_epoch = epoch;
        self
    }

    /// Process start time, milliseconds since the Unix epoch.
    pub fn server_epoch(&self) -> i64 {
        self.server_epoch
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Fail jobs a previous process left active. Call once at startup before
    /// serving, when the store outlives the process.
    pub async fn recover_interrupted(&self) -> Result<usize, JobError> {
        let count = self.store.fail_interrupted(INTERRUPTED_MESSAGE).await?;
        if count > 0 {
            warn!(count, "Failed jobs interrupted by restart");
        }
        Ok(count)
    }

    /// Store a new job and start its worker. Returns without waiting for the
    /// provider.
    pub async fn create(&self, request: GenerationRequest) -> Result<CreatedJob, JobError> {
        if !request.as_value().is_object() {
            return Err(JobError::Validation {
                reason: "request body must be a JSON object".to_string(),
            });
        }

        // Held across spawn + insert so a fast worker cannot deregister
        // before it is registered.
        let mut workers = self.workers.write().await;
        if workers.len() >= self.config.max_active_jobs {
            return Err(JobError::MaxJobsExceeded {
                max: self.config.max_active_jobs,
            });
        }

        let job_id = self.store.insert(request.clone()).await?;
        let token = CancellationToken::new();
        let worker = GenerationWorker::new(job_id, request, self.worker_deps(), token.clone());

        let registry = Arc::clone(&self.workers);
        let handle = tokio::spawn(async move {
            let state = worker.run().await;
            registry.write().await.remove(&job_id);
            debug!(job_id = %job_id, state = ?state, "Worker exited");
        });

        workers.insert(job_id, TrackedWorker { token, handle });
        drop(workers);

        info!(job_id = %job_id, "Job created");
        Ok(CreatedJob {
            job_id,
            server_epoch: self.server_epoch,
        })
    }

    fn worker_deps(&self) -> WorkerDeps {
        WorkerDeps {
            store: Arc::clone(&self.store),
            provider: Arc::clone(&self.provider),
            provider_timeout: self.config.provider_timeout,
            cancel_check_interval: self.config.cancel_check_interval,
        }
    }

    /// Current public status of a job.
    pub async fn status(&self, job_id: Uuid) -> Result<JobStatus, JobError> {
        Ok(self.store.get(job_id).await?.status())
    }

    /// Request cancellation.
    ///
    /// Terminal jobs are left untouched and their state is returned. Pending
    /// jobs are cancelled directly; processing jobs are cancelled by their
    /// worker once it observes the signal.
    pub async fn cancel(&self, job_id: Uuid) -> Result<JobState, JobError> {
        let record = self.store.request_cancel(job_id).await?;
        if record.state.is_terminal() {
            debug!(job_id = %job_id, state = %record.state, "Cancel on settled job ignored");
            return Ok(record.state);
        }

        if record.state == JobState::Pending {
            match self
                .store
                .transition(
                    job_id,
                    JobState::Pending,
                    JobState::Cancelled,
                    TransitionPayload::None,
                )
                .await
            {
                Ok(_) => {
                    self.signal_worker(job_id).await;
                    info!(job_id = %job_id, "Job cancelled before dispatch");
                    return Ok(JobState::Cancelled);
                }
                // The worker got there first; fall through and signal it.
                Err(JobError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        self.signal_worker(job_id).await;
        info!(job_id = %job_id, "Cancellation signalled to worker");
        Ok(self.store.get(job_id).await?.state)
    }

    async fn signal_worker(&self, job_id: Uuid) {
        if let Some(tracked) = self.workers.read().await.get(&job_id) {
            tracked.token.cancel();
        }
    }

    /// Delete a settled job.
    pub async fn remove(&self, job_id: Uuid) -> Result<(), JobError> {
        let record = self.store.get(job_id).await?;
        if record.state.is_active() {
            return Err(JobError::StillActive {
                id: job_id,
                state: record.state,
            });
        }
        self.store.delete(job_id).await?;
        info!(job_id = %job_id, "Job removed");
        Ok(())
    }

    /// Count jobs per state.
    pub async fn summary(&self) -> Result<JobSummary, JobError> {
        let records = self.store.list().await?;
        Ok(JobSummary::from_records(&records))
    }

    /// Number of workers still running.
    pub async fn running_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Delete settled jobs older than the configured TTL.
    pub async fn evict_expired(&self) -> Result<usize, JobError> {
        let ttl = chrono::Duration::from_std(self.config.job_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(1));
        let count = self.store.evict_terminal_before(Utc::now() - ttl).await?;
        if count > 0 {
            info!(count, "Evicted expired jobs");
        }
        Ok(count)
    }

    /// Cancel every running worker and wait for them to settle.
    pub async fn shutdown(&self) {
        let drained: Vec<TrackedWorker> = {
            let mut workers = self.workers.write().await;
            workers.drain().map(|(_, w)| w).collect()
        };
        info!(count = drained.len(), "Shutting down job workers");

        let handles = drained.into_iter().map(|w| {
            w.token.cancel();
            w.handle
        });
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
    }
}

/// Spawn a background task that periodically evicts expired jobs.
pub fn spawn_eviction_task(service: Arc<JobService>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(service.config().eviction_interval);
        // Skip immediate first tick
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = service.evict_expired().await {
                warn!(error = %e, "Job eviction failed");
            }
        }
    })
}

/// In-process client access, used when the UI runs in the same process.
#[async_trait]
impl JobApi for JobService {
    async fn create(&self, request: &GenerationRequest) -> Result<CreatedJob, ClientError> {
        JobService::create(self, request.clone())
            .await
            .map_err(|e| match e {
                JobError::Validation { .. } | JobError::MaxJobsExceeded { .. } => {
                    ClientError::Rejected(e.to_string())
                }
                other => ClientError::Transport(other.to_string()),
            })
    }

    async fn status(&self, job_id: Uuid) -> Result<JobStatus, ClientError> {
        JobService::status(self, job_id).await.map_err(into_client_error)
    }

    async fn cancel(&self, job_id: Uuid) -> Result<JobState, ClientError> {
        JobService::cancel(self, job_id).await.map_err(into_client_error)
    }

    async fn server_epoch(&self) -> Result<i64, ClientError> {
        Ok(self.server_epoch)
    }
}

fn into_client_error(e: JobError) -> ClientError {
    match e {
        JobError::NotFound { id } => ClientError::NotFound { id },
        other => ClientError::Transport(other.to_string()),
    }
}
