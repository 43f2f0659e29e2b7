//! Axum application wiring: routes, tracing, CORS, and request timeouts.

use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::kernel::AppState;
use crate::server::routes;

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/v1/jobs", post(routes::create_job))
        .route("/v1/job-runs", post(routes::create_job_run_handler))
        .route("/v1/job-runs/paused", get(routes::list_paused_job_runs))
        .route("/v1/job-runs/:id/pause", post(routes::pause_job_run))
        .route("/v1/job-runs/:id/resume", post(routes::resume_job_run))
        .route("/v1/logs/stream/ws", get(routes::logs_stream_ws))
        .route("/v1/logs/stream/sse", get(routes::logs_stream_sse))
        .route("/v1/logs/job-runs/:id/download", get(routes::download_job_run_log))
        .route("/health", get(routes::health))
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(30)))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
