//! Error types for genjob.

use std::time::Duration;

use uuid::Uuid;

use crate::jobs::state::JobState;

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is in state {state}, cannot transition from {from} to {target}")]
    InvalidTransition {
        id: Uuid,
        state: JobState,
        from: JobState,
        target: JobState,
    },

    #[error("Invalid job request: {reason}")]
    Validation { reason: String },

    #[error("Maximum active jobs ({max}) exceeded")]
    MaxJobsExceeded { max: usize },

    #[error("Job {id} is still {state}")]
    StillActive { id: Uuid, state: JobState },

    #[error("Storage error: {0}")]
    Storage(#[from] DatabaseError),
}

/// Generation provider errors.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },
}

/// Errors seen by a client polling the job API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("Job {id} not found on server")]
    NotFound { id: Uuid },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Server responded with HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Failed to decode server response: {0}")]
    Decode(String),

    #[error("Client storage error: {0}")]
    Storage(String),

    #[error("Server rejected request: {0}")]
    Rejected(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Transport(e.to_string())
        }
    }
}
