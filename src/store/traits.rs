//! `JobStore` trait, the single mutation path for job records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::state::{GenerationRequest, JobRecord, JobState, TransitionPayload};

/// Backend-agnostic job table.
///
/// Every operation is atomic per job ID. Once `transition` returns `Ok`, all
/// later reads observe the new state.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a fresh `pending` record and return its ID.
    async fn insert(&self, request: GenerationRequest) -> Result<Uuid, JobError>;

    /// Fetch a record.
    async fn get(&self, id: Uuid) -> Result<JobRecord, JobError>;

    /// Compare-and-swap the state from `from` to `to`.
    ///
    /// Fails with `InvalidTransition` if the current state is not `from`, if
    /// the edge is not part of the state machine, or if `payload` does not
    /// fit `to`.
    async fn transition(
        &self,
        id: Uuid,
        from: JobState,
        to: JobState,
        payload: TransitionPayload,
    ) -> Result<JobRecord, JobError>;

    /// Raise `cancel_requested` unless the job is terminal. Returns the record
    /// as it stands afterwards.
    async fn request_cancel(&self, id: Uuid) -> Result<JobRecord, JobError>;

    /// Remove a record.
    async fn delete(&self, id: Uuid) -> Result<(), JobError>;

    /// All records, in no particular order.
    async fn list(&self) -> Result<Vec<JobRecord>, JobError>;

    /// Delete terminal records last updated before `cutoff`. Returns how many
    /// were removed.
    async fn evict_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, JobError>;

    /// Move every non-terminal record to `error` with `message`. Used at
    /// startup, when no worker exists for them any more.
    async fn fail_interrupted(&self, message: &str) -> Result<usize, JobError>;
}

/// Shared precondition check for `transition` implementations.
pub(crate) fn check_transition(
    id: Uuid,
    current: JobState,
    from: JobState,
    to: JobState,
    payload: &TransitionPayload,
) -> Result<(), JobError> {
    if current != from || !from.can_transition_to(to) || !payload.fits(to) {
        return Err(JobError::InvalidTransition {
            id,
            state: current,
            from,
            target: to,
        });
    }
    Ok(())
}
