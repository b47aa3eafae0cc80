//! Per-job generation worker.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobError, ProviderError};
use crate::jobs::state::{GenerationRequest, JobState, TransitionPayload};
use crate::provider::{Artifact, GenerationProvider};
use crate::store::JobStore;

/// Shared dependencies for worker execution.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn JobStore>,
    pub provider: Arc<dyn GenerationProvider>,
    /// Upper bound on the provider call.
    pub provider_timeout: Option<Duration>,
    /// How often the store's `cancel_requested` flag is re-read.
    pub cancel_check_interval: Duration,
}

/// How waiting on the provider ended.
enum ProviderOutcome {
    Finished(Result<Artifact, ProviderError>),
    Cancelled,
}

/// Runs exactly one job's provider call.
pub struct GenerationWorker {
    job_id: Uuid,
    request: GenerationRequest,
    deps: WorkerDeps,
    token: CancellationToken,
}

impl GenerationWorker {
    pub fn new(
        job_id: Uuid,
        request: GenerationRequest,
        deps: WorkerDeps,
        token: CancellationToken,
    ) -> Self {
        Self {
            job_id,
            request,
            deps,
            token,
        }
    }

    fn store(&self) -> &Arc<dyn JobStore> {
        &self.deps.store
    }

    /// Drive the job to a terminal state. Never panics and never returns an
    /// error; every exit ends in a transition attempt or a logged discard.
    ///
    /// Returns the state the job was left in, if it could be read back.
    pub async fn run(self) -> Option<JobState> {
        let job_id = self.job_id;

        let started = self
            .store()
            .transition(
                job_id,
                JobState::Pending,
                JobState::Processing,
                TransitionPayload::None,
            )
            .await;

        match started {
            Ok(record) if record.cancel_requested => {
                debug!(job_id = %job_id, "Cancel requested before dispatch");
                self.finish(ProviderOutcome::Cancelled).await;
            }
            Ok(_) => {
                info!(job_id = %job_id, provider = self.deps.provider.name(), "Dispatching generation");
                let outcome = self.wait_for_provider().await;
                self.finish(outcome).await;
            }
            Err(JobError::InvalidTransition { state, .. }) => {
                debug!(job_id = %job_id, state = %state, "Job no longer pending, not dispatching");
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Could not start job");
            }
        }

        self.store().get(job_id).await.ok().map(|r| r.state)
    }

    /// Wait for the provider while watching for cancellation.
    ///
    /// The call runs in its own task so a panicking provider surfaces as an
    /// error instead of stranding the job in `processing`.
    async fn wait_for_provider(&self) -> ProviderOutcome {
        let provider = Arc::clone(&self.deps.provider);
        let request = self.request.clone();
        let mut call: JoinHandle<Result<Artifact, ProviderError>> =
            tokio::spawn(async move { provider.generate(&request).await });

        let deadline = async {
            match self.deps.provider_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        let mut cancel_check = tokio::time::interval(self.deps.cancel_check_interval);
        cancel_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        cancel_check.tick().await;

        let outcome = loop {
            tokio::select! {
                biased;

                _ = self.token.cancelled() => break ProviderOutcome::Cancelled,

                joined = &mut call => {
                    break ProviderOutcome::Finished(joined.unwrap_or_else(|e| {
                        Err(ProviderError::RequestFailed {
                            provider: self.deps.provider.name().to_string(),
                            reason: format!("provider task failed: {e}"),
                        })
                    }));
                }

                _ = &mut deadline => {
                    break ProviderOutcome::Finished(Err(ProviderError::Timeout {
                        provider: self.deps.provider.name().to_string(),
                        timeout: self.deps.provider_timeout.unwrap_or_default(),
                    }));
                }

                _ = cancel_check.tick() => {
                    if self.cancel_flag_raised().await {
                        break ProviderOutcome::Cancelled;
                    }
                }
            }
        };

        if !call.is_finished() {
            // Best effort only; the remote side may keep going.
            call.abort();
        }
        outcome
    }

    /// Whether the stored record says to stop waiting.
    async fn cancel_flag_raised(&self) -> bool {
        match self.store().get(self.job_id).await {
            Ok(record) => record.cancel_requested || record.state != JobState::Processing,
            Err(JobError::NotFound { .. }) => true,
            Err(e) => {
                warn!(job_id = %self.job_id, error = %e, "Cancel check failed");
                false
            }
        }
    }

    async fn finish(&self, outcome: ProviderOutcome) {
        let job_id = self.job_id;
        let (to, payload) = match outcome {
            ProviderOutcome::Cancelled => (JobState::Cancelled, TransitionPayload::None),
            ProviderOutcome::Finished(Ok(artifact)) => (
                JobState::Done,
                TransitionPayload::Done {
                    result_ref: artifact.result_ref,
                },
            ),
            ProviderOutcome::Finished(Err(e)) => {
                warn!(job_id = %job_id, error = %e, "Generation failed");
                (
                    JobState::Error,
                    TransitionPayload::Error {
                        message: e.to_string(),
                    },
                )
            }
        };

        match self
            .store()
            .transition(job_id, JobState::Processing, to, payload)
            .await
        {
            Ok(_) => info!(job_id = %job_id, state = %to, "Job finished"),
            Err(JobError::InvalidTransition { state, .. }) => {
                info!(
                    job_id = %job_id,
                    state = %state,
                    discarded = %to,
                    "Job already settled, discarding worker outcome"
                );
            }
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to record job outcome"),
        }
    }
}
