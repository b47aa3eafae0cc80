use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::JobError;

/// JSON body of every error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// Errors returned by the job endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Too many active jobs (max {0})")]
    TooManyJobs(usize),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::NotFound { id } => Self::JobNotFound(id.to_string()),
            JobError::Validation { reason } => Self::BadRequest(reason),
            JobError::MaxJobsExceeded { max } => Self::TooManyJobs(max),
            e @ JobError::StillActive { .. } => Self::Conflict(e.to_string()),
            e @ (JobError::InvalidTransition { .. } | JobError::Storage(_)) => {
                Self::Internal(e.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ApiError::JobNotFound(id) => {
                tracing::debug!(job_id = %id, "Job not found");
                (
                    StatusCode::NOT_FOUND,
                    ErrorResponse::with_details("Job not found", format!("Job ID: {id}")),
                )
            }
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                ErrorResponse::with_details("Bad request", msg.clone()),
            ),
            ApiError::TooManyJobs(max) => {
                tracing::warn!(max = %max, "Rejecting job, active limit reached");
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    ErrorResponse::with_details(
                        "Too many active jobs",
                        format!("At most {max} jobs may be pending or processing"),
                    ),
                )
            }
            ApiError::Conflict(msg) => (
                StatusCode::CONFLICT,
                ErrorResponse::with_details("Conflict", msg.clone()),
            ),
            ApiError::Internal(msg) => {
                tracing::error!(message = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorResponse::new("Internal server error"),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
