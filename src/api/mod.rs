//! HTTP surface for the job service.

pub mod error;
pub mod routes;

pub use error::{ApiError, ErrorResponse};
pub use routes::{JobRouteState, job_routes};

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::jobs::JobService;

/// Job routes with CORS for browser clients and request tracing.
pub fn create_app(service: Arc<JobService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    job_routes(service)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
