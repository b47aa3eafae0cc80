//! REST endpoints for generation jobs.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use crate::jobs::{GenerationRequest, JobService};

/// Shared state for job routes.
#[derive(Clone)]
pub struct JobRouteState {
    pub service: Arc<JobService>,
}

/// Build the job REST routes.
pub fn job_routes(service: Arc<JobService>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/epoch", get(epoch))
        .route("/jobs", post(create_job))
        .route("/jobs/{id}", axum::routing::delete(delete_job))
        .route("/jobs/{id}/status", get(job_status))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .with_state(JobRouteState { service })
}

/// Malformed IDs cannot name a job, so they read as unknown.
fn parse_job_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::JobNotFound(raw.to_string()))
}

// ── Health ──────────────────────────────────────────────────────────────

/// GET /health
async fn health(State(state): State<JobRouteState>) -> ApiResult<impl IntoResponse> {
    let summary = state.service.summary().await?;
    Ok(Json(json!({
        "status": "ok",
        "serverEpoch": state.service.server_epoch(),
        "jobs": summary,
    })))
}

/// GET /epoch
async fn epoch(State(state): State<JobRouteState>) -> impl IntoResponse {
    Json(json!({ "serverEpoch": state.service.server_epoch() }))
}

// ── Jobs ────────────────────────────────────────────────────────────────

/// POST /jobs
///
/// Body is the opaque generation request and must be a JSON object.
async fn create_job(
    State(state): State<JobRouteState>,
    body: Result<Json<serde_json::Value>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(value) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let created = state.service.create(GenerationRequest::new(value)).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// GET /jobs/{id}/status
async fn job_status(
    State(state): State<JobRouteState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job_id = parse_job_id(&id)?;
    Ok(Json(state.service.status(job_id).await?))
}

/// POST /jobs/{id}/cancel
///
/// Idempotent; settled jobs come back unchanged.
async fn cancel_job(
    State(state): State<JobRouteState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job_id = parse_job_id(&id)?;
    let job_state = state.service.cancel(job_id).await?;
    Ok(Json(json!({ "state": job_state })))
}

/// DELETE /jobs/{id}
async fn delete_job(
    State(state): State<JobRouteState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let job_id = parse_job_id(&id)?;
    state.service.remove(job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
