//! Client-side job handle and its polling loop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::jobs::state::{GenerationRequest, JobState, JobStatus};

use super::api::JobApi;
use super::restart_guard::{DiscardReason, GuardDecision, RestartGuard};
use super::storage::{HandleStorage, PersistedHandle};

/// How a tracked job ended, from the client's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Done { result_ref: String },
    Failed { message: String },
    Cancelled,
    /// The server no longer knows the job. Start over.
    Gone,
    /// Polling stopped on a transport failure. The handle is still stored.
    StatusCheckFailed(String),
}

impl JobOutcome {
    fn from_terminal(status: JobStatus) -> Self {
        match status.state {
            JobState::Done => Self::Done {
                result_ref: status.result_ref.unwrap_or_default(),
            },
            JobState::Error => Self::Failed {
                message: status.error_message.unwrap_or_default(),
            },
            _ => Self::Cancelled,
        }
    }
}

/// Result of [`ClientJobHandle::resume`].
pub enum Resumed {
    Polling(ClientJobHandle),
    Discarded(DiscardReason),
    Empty,
}

/// A persisted reference to one server job, polled until it settles.
///
/// Dropping the handle stops polling but leaves storage alone, so the next
/// load can pick the job up again.
pub struct ClientJobHandle {
    job_id: Uuid,
    api: Arc<dyn JobApi>,
    storage: Arc<dyn HandleStorage>,
    request_snapshot: Option<GenerationRequest>,
    token: CancellationToken,
    state_tx: Arc<watch::Sender<JobState>>,
    state_rx: watch::Receiver<JobState>,
    outcome_rx: Option<oneshot::Receiver<JobOutcome>>,
    poller: Option<JoinHandle<()>>,
}

impl ClientJobHandle {
    /// Create a job and start polling it. The handle is persisted before the
    /// first status request goes out.
    pub async fn start(
        api: Arc<dyn JobApi>,
        storage: Arc<dyn HandleStorage>,
        config: &ClientConfig,
        request: GenerationRequest,
    ) -> Result<Self, ClientError> {
        let created = api.create(&request).await?;
        let persisted = PersistedHandle::new(created.job_id, created.server_epoch, Some(request));

        if let Err(e) = persisted.save(storage.as_ref()) {
            warn!(job_id = %created.job_id, error = %e, "Could not persist job handle, cancelling job");
            if let Err(cancel_err) = api.cancel(created.job_id).await {
                warn!(job_id = %created.job_id, error = %cancel_err, "Cancel after failed persist also failed");
            }
            return Err(e);
        }

        info!(job_id = %created.job_id, "Started generation job");
        Ok(Self::attach(api, storage, config, persisted))
    }

    /// Reattach to a stored handle after a reload, if it survives the
    /// restart check.
    pub async fn resume(
        api: Arc<dyn JobApi>,
        storage: Arc<dyn HandleStorage>,
        config: &ClientConfig,
    ) -> Result<Resumed, ClientError> {
        let guard = RestartGuard::new(config.staleness_window);
        match guard.check(api.as_ref(), storage.as_ref()).await? {
            GuardDecision::Fresh(persisted) => {
                debug!(job_id = %persisted.job_id, state = %persisted.local_state, "Resuming job handle");
                Ok(Resumed::Polling(Self::attach(api, storage, config, persisted)))
            }
            GuardDecision::Discarded(reason) => Ok(Resumed::Discarded(reason)),
            GuardDecision::Empty => Ok(Resumed::Empty),
        }
    }

    /// Start polling an already-validated handle.
    pub fn attach(
        api: Arc<dyn JobApi>,
        storage: Arc<dyn HandleStorage>,
        config: &ClientConfig,
        persisted: PersistedHandle,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(persisted.local_state);
        let state_tx = Arc::new(state_tx);
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let token = CancellationToken::new();

        let poller = tokio::spawn(poll_loop(Poller {
            job_id: persisted.job_id,
            api: Arc::clone(&api),
            storage: Arc::clone(&storage),
            interval: config.poll_interval,
            token: token.clone(),
            state_tx: Arc::clone(&state_tx),
            outcome_tx,
        }));

        Self {
            job_id: persisted.job_id,
            api,
            storage,
            request_snapshot: persisted.request_snapshot,
            token,
            state_tx,
            state_rx,
            outcome_rx: Some(outcome_rx),
            poller: Some(poller),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// The request the job was started with, for re-displaying the form
    /// after a reload.
    pub fn request_snapshot(&self) -> Option<&GenerationRequest> {
        self.request_snapshot.as_ref()
    }

    /// Last observed server state.
    pub fn local_state(&self) -> JobState {
        *self.state_rx.borrow()
    }

    /// Subscribe to state changes.
    pub fn watch_state(&self) -> watch::Receiver<JobState> {
        self.state_rx.clone()
    }

    pub fn is_polling(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Wait for the job's outcome. Yields it once; later calls, and calls
    /// after a user cancel, return `None`.
    pub async fn outcome(&mut self) -> Option<JobOutcome> {
        let rx = self.outcome_rx.take()?;
        rx.await.ok()
    }

    /// Cancel the job. Polling stops and storage is cleared whatever the
    /// server answers.
    pub async fn cancel(&mut self) -> Result<JobState, ClientError> {
        self.token.cancel();
        if let Some(poller) = self.poller.take() {
            // Let an in-flight poll drop before touching storage.
            let _ = poller.await;
        }
        self.outcome_rx = None;

        let answer = self.api.cancel(self.job_id).await;
        if let Err(e) = PersistedHandle::clear(self.storage.as_ref()) {
            warn!(job_id = %self.job_id, error = %e, "Failed to clear job handle");
        }

        match &answer {
            Ok(state) => {
                self.state_tx.send_replace(*state);
                info!(job_id = %self.job_id, state = %state, "Job cancel acknowledged");
            }
            Err(e) => warn!(job_id = %self.job_id, error = %e, "Job cancel failed, handle cleared"),
        }
        answer
    }
}

impl Drop for ClientJobHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

struct Poller {
    job_id: Uuid,
    api: Arc<dyn JobApi>,
    storage: Arc<dyn HandleStorage>,
    interval: Duration,
    token: CancellationToken,
    state_tx: Arc<watch::Sender<JobState>>,
    outcome_tx: oneshot::Sender<JobOutcome>,
}

async fn poll_loop(poller: Poller) {
    let Poller {
        job_id,
        api,
        storage,
        interval,
        token,
        state_tx,
        outcome_tx,
    } = poller;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return,
            response = api.status(job_id) => response,
        };
        if token.is_cancelled() {
            return;
        }

        match response {
            Ok(status) if status.state.is_terminal() => {
                state_tx.send_replace(status.state);
                break JobOutcome::from_terminal(status);
            }
            Ok(status) => {
                if *state_tx.borrow() != status.state {
                    debug!(job_id = %job_id, state = %status.state, "Job state changed");
                    if let Err(e) = PersistedHandle::save_local_state(storage.as_ref(), status.state) {
                        warn!(job_id = %job_id, error = %e, "Failed to persist job state");
                    }
                    state_tx.send_replace(status.state);
                }
            }
            Err(ClientError::NotFound { .. }) => {
                info!(job_id = %job_id, "Job no longer known to the server");
                state_tx.send_replace(JobState::Pending);
                break JobOutcome::Gone;
            }
            Err(e) => {
                // Keep the handle; a later load may still find the result.
                warn!(job_id = %job_id, error = %e, "Status check failed, polling stopped");
                token.cancel();
                let _ = outcome_tx.send(JobOutcome::StatusCheckFailed(e.to_string()));
                return;
            }
        }
    };

    token.cancel();
    if let Err(e) = PersistedHandle::clear(storage.as_ref()) {
        warn!(job_id = %job_id, error = %e, "Failed to clear job handle");
    }
    info!(job_id = %job_id, outcome = ?outcome, "Job settled");
    let _ = outcome_tx.send(outcome);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Notify;

    use super::*;
    use crate::client::storage::{KEY_JOB_ID, MemoryStorage};
    use crate::config::ServiceConfig;
    use crate::jobs::JobService;
    use crate::jobs::state::CreatedJob;
    use crate::provider::testing::ScriptedProvider;
    use crate::store::MemoryJobStore;

    fn client_config() -> ClientConfig {
        ClientConfig {
            poll_interval: Duration::from_millis(10),
            ..ClientConfig::default()
        }
    }

    fn in_process(provider: Arc<ScriptedProvider>) -> Arc<JobService> {
        let config = ServiceConfig {
            cancel_check_interval: Duration::from_millis(10),
            ..ServiceConfig::default()
        };
        Arc::new(JobService::new(
            Arc::new(MemoryJobStore::new()),
            provider,
            config,
        ))
    }

    fn lullaby() -> GenerationRequest {
        GenerationRequest::new(json!({"tags": "lullaby"}))
    }

    async fn outcome_within(handle: &mut ClientJobHandle) -> Option<JobOutcome> {
        tokio::time::timeout(Duration::from_secs(5), handle.outcome())
            .await
            .expect("outcome timed out")
    }

    /// Replays scripted status answers, then repeats the last one.
    struct ScriptedApi {
        job_id: Uuid,
        answers: Mutex<Vec<Result<JobStatus, ClientError>>>,
        polls: AtomicUsize,
        cancels: AtomicUsize,
    }

    impl ScriptedApi {
        fn new(answers: Vec<Result<JobStatus, ClientError>>) -> Self {
            Self {
                job_id: Uuid::new_v4(),
                answers: Mutex::new(answers),
                polls: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobApi for ScriptedApi {
        async fn create(&self, _request: &GenerationRequest) -> Result<CreatedJob, ClientError> {
            Ok(CreatedJob {
                job_id: self.job_id,
                server_epoch: 1,
            })
        }

        async fn status(&self, _job_id: Uuid) -> Result<JobStatus, ClientError> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let mut answers = self.answers.lock().unwrap();
            if answers.len() > 1 {
                answers.remove(0)
            } else {
                answers[0].clone()
            }
        }

        async fn cancel(&self, _job_id: Uuid) -> Result<JobState, ClientError> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::Transport("offline".into()))
        }

        async fn server_epoch(&self) -> Result<i64, ClientError> {
            Ok(1)
        }
    }

    fn status(state: JobState) -> Result<JobStatus, ClientError> {
        Ok(JobStatus {
            state,
            result_ref: None,
            error_message: None,
        })
    }

    #[tokio::test]
    async fn done_outcome_is_delivered_once_and_storage_cleared() {
        let provider = Arc::new(ScriptedProvider::succeeding("r1"));
        let service = in_process(Arc::clone(&provider));
        let storage = Arc::new(MemoryStorage::new());

        let mut handle = ClientJobHandle::start(
            service.clone(),
            storage.clone(),
            &client_config(),
            lullaby(),
        )
        .await
        .unwrap();
        assert!(storage.get(KEY_JOB_ID).unwrap().is_some());

        let outcome = outcome_within(&mut handle).await;
        assert_eq!(
            outcome,
            Some(JobOutcome::Done {
                result_ref: "r1".into()
            })
        );
        assert_eq!(handle.local_state(), JobState::Done);
        assert!(!handle.is_polling());
        assert!(PersistedHandle::load(storage.as_ref()).unwrap().is_none());

        assert_eq!(handle.outcome().await, None);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn provider_failure_is_failed_outcome() {
        let service = in_process(Arc::new(ScriptedProvider::failing("model overloaded")));
        let storage = Arc::new(MemoryStorage::new());

        let mut handle =
            ClientJobHandle::start(service, storage.clone(), &client_config(), lullaby())
                .await
                .unwrap();

        match outcome_within(&mut handle).await {
            Some(JobOutcome::Failed { message }) => {
                assert!(message.contains("model overloaded"), "{message}")
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(PersistedHandle::load(storage.as_ref()).unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_clears_storage_and_reports_server_state() {
        let provider = Arc::new(ScriptedProvider::succeeding("r1").gated());
        let service = in_process(Arc::clone(&provider));
        let storage = Arc::new(MemoryStorage::new());

        let mut handle = ClientJobHandle::start(
            service.clone(),
            storage.clone(),
            &client_config(),
            lullaby(),
        )
        .await
        .unwrap();
        provider.wait_started().await;

        let state = handle.cancel().await.unwrap();
        assert!(matches!(state, JobState::Processing | JobState::Cancelled));
        assert!(!handle.is_polling());
        assert!(PersistedHandle::load(storage.as_ref()).unwrap().is_none());
        assert_eq!(handle.outcome().await, None);
    }

    #[tokio::test]
    async fn cancel_clears_storage_even_when_server_unreachable() {
        let api = Arc::new(ScriptedApi::new(vec![status(JobState::Processing)]));
        let storage = Arc::new(MemoryStorage::new());

        let mut handle =
            ClientJobHandle::start(api, storage.clone(), &client_config(), lullaby())
                .await
                .unwrap();

        assert!(handle.cancel().await.is_err());
        assert!(PersistedHandle::load(storage.as_ref()).unwrap().is_none());
    }

    #[tokio::test]
    async fn transport_failure_stops_polling_and_keeps_storage() {
        let api = Arc::new(ScriptedApi::new(vec![
            status(JobState::Processing),
            Err(ClientError::Transport("connection reset".into())),
        ]));
        let storage = Arc::new(MemoryStorage::new());

        let mut handle =
            ClientJobHandle::start(api.clone(), storage.clone(), &client_config(), lullaby())
                .await
                .unwrap();

        let outcome = outcome_within(&mut handle).await;
        assert!(matches!(outcome, Some(JobOutcome::StatusCheckFailed(_))));
        assert!(!handle.is_polling());

        let polls = api.polls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(api.polls.load(Ordering::SeqCst), polls);

        let kept = PersistedHandle::load(storage.as_ref()).unwrap().unwrap();
        assert_eq!(kept.job_id, api.job_id);
        assert_eq!(kept.local_state, JobState::Processing);
    }

    #[tokio::test]
    async fn unknown_job_is_gone() {
        let api = Arc::new(ScriptedApi::new(vec![Err(ClientError::NotFound {
            id: Uuid::nil(),
        })]));
        let storage = Arc::new(MemoryStorage::new());

        let mut handle = ClientJobHandle::start(api, storage.clone(), &client_config(), lullaby())
            .await
            .unwrap();

        assert_eq!(outcome_within(&mut handle).await, Some(JobOutcome::Gone));
        assert!(PersistedHandle::load(storage.as_ref()).unwrap().is_none());
    }

    /// Storage that refuses every write.
    struct ReadOnlyStorage;

    impl HandleStorage for ReadOnlyStorage {
        fn get(&self, _key: &str) -> Result<Option<String>, ClientError> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> Result<(), ClientError> {
            Err(ClientError::Storage("read-only".into()))
        }

        fn remove(&self, _key: &str) -> Result<(), ClientError> {
            Err(ClientError::Storage("read-only".into()))
        }
    }

    #[tokio::test]
    async fn failed_persist_cancels_job_and_reports_storage_error() {
        let api = Arc::new(ScriptedApi::new(vec![status(JobState::Pending)]));

        let result =
            ClientJobHandle::start(api.clone(), Arc::new(ReadOnlyStorage), &client_config(), lullaby())
                .await;

        // The cancel failure is logged; the caller sees why the start failed.
        assert!(matches!(result, Err(ClientError::Storage(_))));
        assert_eq!(api.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(api.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn gone_job_resets_local_state_to_pending() {
        let api = Arc::new(ScriptedApi::new(vec![
            status(JobState::Processing),
            Err(ClientError::NotFound { id: Uuid::nil() }),
        ]));
        let storage = Arc::new(MemoryStorage::new());

        let mut handle =
            ClientJobHandle::start(api.clone(), storage.clone(), &client_config(), lullaby())
                .await
                .unwrap();

        assert_eq!(outcome_within(&mut handle).await, Some(JobOutcome::Gone));
        assert!(api.polls.load(Ordering::SeqCst) >= 2);
        assert_eq!(handle.local_state(), JobState::Pending);
        assert_eq!(*handle.watch_state().borrow(), JobState::Pending);
        assert!(PersistedHandle::load(storage.as_ref()).unwrap().is_none());
    }

    /// Holds every status call until released, then reports `done`.
    struct SlowStatusApi {
        job_id: Uuid,
        entered: Notify,
        release: Notify,
        answered: AtomicUsize,
    }

    #[async_trait]
    impl JobApi for SlowStatusApi {
        async fn create(&self, _request: &GenerationRequest) -> Result<CreatedJob, ClientError> {
            Ok(CreatedJob {
                job_id: self.job_id,
                server_epoch: 1,
            })
        }

        async fn status(&self, _job_id: Uuid) -> Result<JobStatus, ClientError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.answered.fetch_add(1, Ordering::SeqCst);
            Ok(JobStatus {
                state: JobState::Done,
                result_ref: Some("late".into()),
                error_message: None,
            })
        }

        async fn cancel(&self, _job_id: Uuid) -> Result<JobState, ClientError> {
            Ok(JobState::Cancelled)
        }

        async fn server_epoch(&self) -> Result<i64, ClientError> {
            Ok(1)
        }
    }

    #[tokio::test]
    async fn status_reply_after_cancel_is_ignored() {
        let api = Arc::new(SlowStatusApi {
            job_id: Uuid::new_v4(),
            entered: Notify::new(),
            release: Notify::new(),
            answered: AtomicUsize::new(0),
        });
        let storage = Arc::new(MemoryStorage::new());

        let mut handle =
            ClientJobHandle::start(api.clone(), storage.clone(), &client_config(), lullaby())
                .await
                .unwrap();
        tokio::time::timeout(Duration::from_secs(5), api.entered.notified())
            .await
            .expect("poll never started");

        assert_eq!(handle.cancel().await.unwrap(), JobState::Cancelled);

        // The in-flight poll was dropped; a late answer has nowhere to go.
        api.release.notify_one();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(api.answered.load(Ordering::SeqCst), 0);
        assert_eq!(handle.outcome().await, None);
        assert_eq!(handle.local_state(), JobState::Cancelled);
        assert!(PersistedHandle::load(storage.as_ref()).unwrap().is_none());
    }

    #[tokio::test]
    async fn resume_restores_cached_state_and_finishes() {
        let provider = Arc::new(ScriptedProvider::succeeding("r1").gated());
        let service = in_process(Arc::clone(&provider));
        let storage = Arc::new(MemoryStorage::new());

        let first = ClientJobHandle::start(
            service.clone(),
            storage.clone(),
            &client_config(),
            lullaby(),
        )
        .await
        .unwrap();
        let job_id = first.job_id();
        provider.wait_started().await;

        let mut watcher = first.watch_state();
        tokio::time::timeout(
            Duration::from_secs(5),
            watcher.wait_for(|s| *s == JobState::Processing),
        )
        .await
        .expect("never saw processing")
        .unwrap();
        // Page unload.
        drop(first);

        let resumed = ClientJobHandle::resume(service.clone(), storage.clone(), &client_config())
            .await
            .unwrap();
        let Resumed::Polling(mut handle) = resumed else {
            panic!("handle should survive a reload on the same server");
        };
        assert_eq!(handle.job_id(), job_id);
        assert_eq!(handle.local_state(), JobState::Processing);
        assert_eq!(handle.request_snapshot(), Some(&lullaby()));

        provider.release();
        assert_eq!(
            outcome_within(&mut handle).await,
            Some(JobOutcome::Done {
                result_ref: "r1".into()
            })
        );
    }

    #[tokio::test]
    async fn resume_after_server_restart_discards() {
        let provider = Arc::new(ScriptedProvider::succeeding("r1").gated());
        let old_server = in_process(Arc::clone(&provider));
        let storage = Arc::new(MemoryStorage::new());

        let handle = ClientJobHandle::start(
            old_server.clone(),
            storage.clone(),
            &client_config(),
            lullaby(),
        )
        .await
        .unwrap();
        drop(handle);

        let epoch = old_server.server_epoch() + 1;
        let config = ServiceConfig::default();
        let new_server = Arc::new(
            JobService::new(Arc::new(MemoryJobStore::new()), provider, config)
                .with_server_epoch(epoch),
        );

        let resumed = ClientJobHandle::resume(new_server, storage.clone(), &client_config())
            .await
            .unwrap();
        assert!(matches!(resumed, Resumed::Discarded(_)));
        assert!(PersistedHandle::load(storage.as_ref()).unwrap().is_none());

        old_server.shutdown().await;
    }
}
