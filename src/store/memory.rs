//! In-memory job table.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::JobError;
use crate::jobs::state::{GenerationRequest, JobRecord, JobState, TransitionPayload};
use crate::store::traits::{JobStore, check_transition};

/// Job records in a `HashMap` behind a single `RwLock`.
///
/// Job volume is low, so one lock for the whole table is enough to make
/// every operation atomic.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, request: GenerationRequest) -> Result<Uuid, JobError> {
        let record = JobRecord::new(request);
        let id = record.id;
        self.jobs.write().await.insert(id, record);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<JobRecord, JobError> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(JobError::NotFound { id })
    }

    async fn transition(
        &self,
        id: Uuid,
        from: JobState,
        to: JobState,
        payload: TransitionPayload,
    ) -> Result<JobRecord, JobError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs.get_mut(&id).ok_or(JobError::NotFound { id })?;
        check_transition(id, record.state, from, to, &payload)?;
        record.apply(to, payload);
        Ok(record.clone())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<JobRecord, JobError> {
        let mut jobs = self.jobs.write().await;
        let record = jobs.get_mut(&id).ok_or(JobError::NotFound { id })?;
        if record.state.is_active() && !record.cancel_requested {
            record.cancel_requested = true;
            record.updated_at = Utc::now();
        }
        Ok(record.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<(), JobError> {
        self.jobs
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or(JobError::NotFound { id })
    }

    async fn list(&self) -> Result<Vec<JobRecord>, JobError> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn evict_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize, JobError> {
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, r| !(r.state.is_terminal() && r.updated_at < cutoff));
        Ok(before - jobs.len())
    }

    async fn fail_interrupted(&self, message: &str) -> Result<usize, JobError> {
        let mut jobs = self.jobs.write().await;
        let mut failed = 0;
        for record in jobs.values_mut().filter(|r| r.state.is_active()) {
            record.apply(
                JobState::Error,
                TransitionPayload::Error {
                    message: message.to_string(),
                },
            );
            failed += 1;
        }
        Ok(failed)
    }
}
