//! Durable client-side storage for job handles.
//!
//! A small key/value abstraction standing in for browser local storage,
//! plus the typed [`PersistedHandle`] kept in it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::ClientError;
use crate::jobs::state::{GenerationRequest, JobState};

pub const KEY_JOB_ID: &str = "job_id";
pub const KEY_SERVER_EPOCH: &str = "job_server_epoch";
pub const KEY_REQUEST_SNAPSHOT: &str = "job_request_snapshot";
pub const KEY_LOCAL_STATE: &str = "job_local_state";
pub const KEY_LAST_RESET: &str = "job_last_reset";

const HANDLE_KEYS: [&str; 5] = [
    KEY_JOB_ID,
    KEY_SERVER_EPOCH,
    KEY_REQUEST_SNAPSHOT,
    KEY_LOCAL_STATE,
    KEY_LAST_RESET,
];

/// String key/value storage that survives reloads.
pub trait HandleStorage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, ClientError>;
    fn set(&self, key: &str, value: &str) -> Result<(), ClientError>;
    fn remove(&self, key: &str) -> Result<(), ClientError>;
}

/// Volatile storage.
#[derive(Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>, ClientError> {
        self.entries
            .lock()
            .map_err(|_| ClientError::Storage("storage mutex poisoned".to_string()))
    }
}

impl HandleStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        Ok(self.entries()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ClientError> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), ClientError> {
        self.entries()?.remove(key);
        Ok(())
    }
}

/// JSON file storage. Every write rewrites the file through a temp file and
/// rename, so a crash never leaves it half-written.
pub struct FileStorage {
    path: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl FileStorage {
    /// Open (or create on first write) the storage file at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref().to_path_buf();
        let cache = match std::fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => HashMap::new(),
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| {
                ClientError::Storage(format!("corrupt storage file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                return Err(ClientError::Storage(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        Ok(Self {
            path,
            cache: Mutex::new(cache),
        })
    }

    fn update<F>(&self, f: F) -> Result<(), ClientError>
    where
        F: FnOnce(&mut HashMap<String, String>),
    {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| ClientError::Storage("storage mutex poisoned".to_string()))?;
        // The cache only changes once the file on disk does.
        let mut next = cache.clone();
        f(&mut next);

        let json = serde_json::to_string_pretty(&next)
            .map_err(|e| ClientError::Storage(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ClientError::Storage(e.to_string()))?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(|e| ClientError::Storage(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| ClientError::Storage(e.to_string()))?;

        *cache = next;
        Ok(())
    }
}

impl HandleStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, ClientError> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| ClientError::Storage("storage mutex poisoned".to_string()))?;
        Ok(cache.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ClientError> {
        self.update(|c| {
            c.insert(key.to_string(), value.to_string());
        })
    }

    fn remove(&self, key: &str) -> Result<(), ClientError> {
        self.update(|c| {
            c.remove(key);
        })
    }
}

/// The handle fields kept in storage.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedHandle {
    pub job_id: Uuid,
    pub server_epoch: i64,
    pub local_state: JobState,
    pub request_snapshot: Option<GenerationRequest>,
    pub last_reset: DateTime<Utc>,
}

impl PersistedHandle {
    pub fn new(job_id: Uuid, server_epoch: i64, request_snapshot: Option<GenerationRequest>) -> Self {
        Self {
            job_id,
            server_epoch,
            local_state: JobState::Pending,
            request_snapshot,
            last_reset: Utc::now(),
        }
    }

    /// Read the handle. A missing or unreadable `job_id` means no handle.
    pub fn load(storage: &dyn HandleStorage) -> Result<Option<Self>, ClientError> {
        let Some(job_id) = storage
            .get(KEY_JOB_ID)?
            .and_then(|raw| Uuid::parse_str(&raw).ok())
        else {
            return Ok(None);
        };

        // A handle without an epoch cannot be validated; treat it as epoch 0
        // so the restart check discards it.
        let server_epoch = storage
            .get(KEY_SERVER_EPOCH)?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let local_state = storage
            .get(KEY_LOCAL_STATE)?
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(JobState::Pending);
        let request_snapshot = storage
            .get(KEY_REQUEST_SNAPSHOT)?
            .and_then(|raw| serde_json::from_str(&raw).ok());
        let last_reset = storage
            .get(KEY_LAST_RESET)?
            .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        Ok(Some(Self {
            job_id,
            server_epoch,
            local_state,
            request_snapshot,
            last_reset,
        }))
    }

    /// Write every field. `job_id` and the epoch go first.
    pub fn save(&self, storage: &dyn HandleStorage) -> Result<(), ClientError> {
        storage.set(KEY_JOB_ID, &self.job_id.to_string())?;
        storage.set(KEY_SERVER_EPOCH, &self.server_epoch.to_string())?;
        storage.set(KEY_LAST_RESET, &self.last_reset.to_rfc3339())?;
        storage.set(KEY_LOCAL_STATE, self.local_state.as_str())?;
        match &self.request_snapshot {
            Some(snapshot) => {
                let json = serde_json::to_string(snapshot)
                    .map_err(|e| ClientError::Storage(e.to_string()))?;
                storage.set(KEY_REQUEST_SNAPSHOT, &json)
            }
            None => storage.remove(KEY_REQUEST_SNAPSHOT),
        }
    }

    /// Record the last observed state.
    pub fn save_local_state(
        storage: &dyn HandleStorage,
        state: JobState,
    ) -> Result<(), ClientError> {
        storage.set(KEY_LOCAL_STATE, state.as_str())
    }

    /// Remove every handle key.
    pub fn clear(storage: &dyn HandleStorage) -> Result<(), ClientError> {
        for key in HANDLE_KEYS {
            storage.remove(key)?;
        }
        Ok(())
    }
}
