//! Job state machine and record types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a generation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Job is stored but no worker has picked it up.
    Pending,
    /// Worker is waiting on the provider.
    Processing,
    /// Provider produced an artifact.
    Done,
    /// Provider failed, timed out, or the job was interrupted.
    Error,
    /// Job was cancelled by the user or observed cancelled by its worker.
    Cancelled,
}

impl JobState {
    /// Check if this state allows transitioning to another state.
    ///
    /// `Pending -> Error` only occurs when recovering jobs stranded by a
    /// restart; workers never take it.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Pending, Processing) | (Pending, Cancelled) | (Pending, Error) |
            (Processing, Done) | (Processing, Error) | (Processing, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error | Self::Cancelled)
    }

    /// Check if the job is active (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// Data carried into a transition. Must fit the target state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransitionPayload {
    None,
    Done { result_ref: String },
    Error { message: String },
}

impl TransitionPayload {
    /// Whether this payload is the one `target` requires.
    pub fn fits(&self, target: JobState) -> bool {
        matches!(
            (self, target),
            (Self::Done { .. }, JobState::Done)
                | (Self::Error { .. }, JobState::Error)
                | (
                    Self::None,
                    JobState::Pending | JobState::Processing | JobState::Cancelled
                )
        )
    }
}

/// Opaque provider request. The job subsystem never inspects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationRequest(pub serde_json::Value);

impl GenerationRequest {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// A stored job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub state: JobState,
    pub request: GenerationRequest,
    pub result_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancel_requested: bool,
}

impl JobRecord {
    /// Create a fresh pending record.
    pub fn new(request: GenerationRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            state: JobState::Pending,
            request,
            result_ref: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            cancel_requested: false,
        }
    }

    /// Apply an already-validated transition.
    pub(crate) fn apply(&mut self, to: JobState, payload: TransitionPayload) {
        self.state = to;
        match payload {
            TransitionPayload::Done { result_ref } => self.result_ref = Some(result_ref),
            TransitionPayload::Error { message } => self.error_message = Some(message),
            TransitionPayload::None => {}
        }
        self.updated_at = Utc::now();
    }

    /// Public view of this record.
    pub fn status(&self) -> JobStatus {
        JobStatus {
            state: self.state,
            result_ref: self.result_ref.clone(),
            error_message: self.error_message.clone(),
        }
    }
}

/// What `status` reports for a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Returned by `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedJob {
    pub job_id: Uuid,
    /// Server process start, milliseconds since the Unix epoch.
    pub server_epoch: i64,
}

/// Counts of jobs per state.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub error: usize,
    pub cancelled: usize,
}

impl JobSummary {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> Self {
        let mut summary = Self::default();
        for record in records {
            match record.state {
                JobState::Pending => summary.pending += 1,
                JobState::Processing => summary.processing += 1,
                JobState::Done => summary.done += 1,
                JobState::Error => summary.error += 1,
                JobState::Cancelled => summary.cancelled += 1,
            }
            summary.total += 1;
        }
        summary
    }
}
