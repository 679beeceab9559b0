//! HTTP API for scheduling pipelines and inspecting jobs.
//!
//! All routes require a bearer token signed with the service secret.

mod auth;
mod errors;
mod handlers;
mod responses;

pub use auth::{mint_token, verify_token, Claims};
pub use errors::{ApiError, ErrorResponse};
pub use responses::*;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::exec::TaskRunner;
use crate::runner::PipelineRunner;
use crate::store::OutputStore;

/// Shared application state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub runner: Arc<PipelineRunner>,
    pub task_runner: Arc<TaskRunner>,
    pub output_store: Arc<OutputStore>,
    pub jwt_secret: String,
}

/// Build the API router with all endpoints.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/pipelines/schedule", post(handlers::schedule_pipeline))
        .route("/pipelines", get(handlers::list_pipelines))
        .route("/jobs", get(handlers::list_jobs))
        .route("/jobs/{job_id}", get(handlers::get_job))
        .route("/jobs/{job_id}/logs", get(handlers::get_job_logs))
        .route("/jobs/{job_id}/tail", get(handlers::get_job_tail))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Serve the API until `shutdown` fires.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let router = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("HTTP API listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}
