//! Restart detection for persisted job handles.
//!
//! Jobs live in server memory, so a handle created against an earlier server
//! process points at nothing. The guard compares the stored epoch with the
//! live one and discards the handle before anything polls it.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::ClientError;

use super::api::JobApi;
use super::storage::{HandleStorage, PersistedHandle};

/// Why a stored handle was thrown away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// The server restarted after the handle was created.
    ServerRestarted { stored_epoch: i64, current_epoch: i64 },
    /// The handle is older than the staleness window.
    Stale { age: Duration },
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ServerRestarted {
                stored_epoch,
                current_epoch,
            } => write!(
                f,
                "server restarted (handle epoch {stored_epoch}, server epoch {current_epoch})"
            ),
            Self::Stale { age } => write!(f, "handle is {}s old", age.as_secs()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    /// The handle may be polled.
    Fresh(PersistedHandle),
    /// The handle was cleared from storage.
    Discarded(DiscardReason),
    /// Nothing was stored.
    Empty,
}

pub struct RestartGuard {
    staleness_window: Duration,
}

impl RestartGuard {
    pub fn new(staleness_window: Duration) -> Self {
        Self { staleness_window }
    }

    /// Decide whether the stored handle survives this load.
    ///
    /// Staleness is checked locally first. Otherwise the current epoch is
    /// fetched; if that fails the handle stays in storage and the error is
    /// returned, so a flaky network never loses a job.
    pub async fn check(
        &self,
        api: &dyn JobApi,
        storage: &dyn HandleStorage,
    ) -> Result<GuardDecision, ClientError> {
        let Some(handle) = PersistedHandle::load(storage)? else {
            return Ok(GuardDecision::Empty);
        };

        if let Some(reason) = self.stale(&handle, Utc::now()) {
            return self.discard(storage, &handle, reason);
        }

        let current_epoch = api.server_epoch().await?;
        match self.evaluate(&handle, current_epoch, Utc::now()) {
            Some(reason) => self.discard(storage, &handle, reason),
            None => {
                debug!(job_id = %handle.job_id, "Stored job handle is current");
                Ok(GuardDecision::Fresh(handle))
            }
        }
    }

    /// Pure decision over a loaded handle.
    pub fn evaluate(
        &self,
        handle: &PersistedHandle,
        current_epoch: i64,
        now: DateTime<Utc>,
    ) -> Option<DiscardReason> {
        if handle.server_epoch < current_epoch {
            return Some(DiscardReason::ServerRestarted {
                stored_epoch: handle.server_epoch,
                current_epoch,
            });
        }
        self.stale(handle, now)
    }

    fn stale(&self, handle: &PersistedHandle, now: DateTime<Utc>) -> Option<DiscardReason> {
        let age = (now - handle.last_reset).to_std().ok()?;
        (age > self.staleness_window).then_some(DiscardReason::Stale { age })
    }

    fn discard(
        &self,
        storage: &dyn HandleStorage,
        handle: &PersistedHandle,
        reason: DiscardReason,
    ) -> Result<GuardDecision, ClientError> {
        info!(job_id = %handle.job_id, reason = %reason, "Discarding stored job handle");
        PersistedHandle::clear(storage)?;
        Ok(GuardDecision::Discarded(reason))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::client::storage::MemoryStorage;
    use crate::jobs::state::{CreatedJob, GenerationRequest, JobState, JobStatus};

    /// Answers only the epoch query and counts status polls.
    struct EpochOnly {
        epoch: Result<i64, String>,
        status_calls: AtomicUsize,
    }

    impl EpochOnly {
        fn at(epoch: i64) -> Self {
            Self {
                epoch: Ok(epoch),
                status_calls: AtomicUsize::new(0),
            }
        }

        fn unreachable() -> Self {
            Self {
                epoch: Err("connection refused".into()),
                status_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobApi for EpochOnly {
        async fn create(&self, _request: &GenerationRequest) -> Result<CreatedJob, ClientError> {
            unreachable!("guard never creates jobs")
        }

        async fn status(&self, job_id: Uuid) -> Result<JobStatus, ClientError> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::NotFound { id: job_id })
        }

        async fn cancel(&self, _job_id: Uuid) -> Result<JobState, ClientError> {
            unreachable!("guard never cancels jobs")
        }

        async fn server_epoch(&self) -> Result<i64, ClientError> {
            self.epoch.clone().map_err(ClientError::Transport)
        }
    }

    const T1: i64 = 1_700_000_000_000;
    const T2: i64 = 1_700_000_600_000;

    fn store_handle(storage: &MemoryStorage, epoch: i64) -> PersistedHandle {
        let handle = PersistedHandle::new(Uuid::new_v4(), epoch, None);
        handle.save(storage).unwrap();
        handle
    }

    fn guard() -> RestartGuard {
        RestartGuard::new(Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn older_epoch_is_discarded_without_polling() {
        let storage = MemoryStorage::new();
        store_handle(&storage, T1);
        let api = EpochOnly::at(T2);

        let decision = guard().check(&api, &storage).await.unwrap();
        assert_eq!(
            decision,
            GuardDecision::Discarded(DiscardReason::ServerRestarted {
                stored_epoch: T1,
                current_epoch: T2,
            })
        );
        assert_eq!(api.status_calls.load(Ordering::SeqCst), 0);
        assert!(PersistedHandle::load(&storage).unwrap().is_none());
    }

    #[tokio::test]
    async fn same_epoch_is_fresh() {
        let storage = MemoryStorage::new();
        let stored = store_handle(&storage, T2);

        let decision = guard().check(&EpochOnly::at(T2), &storage).await.unwrap();
        match decision {
            GuardDecision::Fresh(handle) => assert_eq!(handle.job_id, stored.job_id),
            other => panic!("expected fresh handle, got {other:?}"),
        }
        assert!(PersistedHandle::load(&storage).unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_storage_is_empty() {
        let storage = MemoryStorage::new();
        let decision = guard().check(&EpochOnly::at(T2), &storage).await.unwrap();
        assert_eq!(decision, GuardDecision::Empty);
    }

    #[tokio::test]
    async fn stale_handle_is_discarded_even_when_offline() {
        let storage = MemoryStorage::new();
        let mut handle = PersistedHandle::new(Uuid::new_v4(), T2, None);
        handle.last_reset = Utc::now() - chrono::Duration::hours(2);
        handle.save(&storage).unwrap();

        let decision = guard()
            .check(&EpochOnly::unreachable(), &storage)
            .await
            .unwrap();
        assert!(matches!(
            decision,
            GuardDecision::Discarded(DiscardReason::Stale { .. })
        ));
        assert!(PersistedHandle::load(&storage).unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_epoch_fetch_keeps_handle() {
        let storage = MemoryStorage::new();
        store_handle(&storage, T1);

        let err = guard()
            .check(&EpochOnly::unreachable(), &storage)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Transport(_)));
        assert!(PersistedHandle::load(&storage).unwrap().is_some());
    }

    #[test]
    fn evaluate_honours_staleness_window() {
        let guard = RestartGuard::new(Duration::from_secs(60));
        let handle = PersistedHandle::new(Uuid::new_v4(), T1, None);

        assert_eq!(guard.evaluate(&handle, T1, handle.last_reset), None);
        let later = handle.last_reset + chrono::Duration::seconds(61);
        assert!(matches!(
            guard.evaluate(&handle, T1, later),
            Some(DiscardReason::Stale { .. })
        ));
    }
}
