//! API request handlers.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use crate::core::types::JobId;
use crate::runner::ScheduleOpts;
use crate::store::OutputStream;

use super::auth::Claims;
use super::errors::ApiError;
use super::responses::{JobResult, PipelineResult, ScheduleResponse, TailResponse};
use super::ApiState;

/// Body of a schedule request.
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub pipeline: String,
}

/// Query parameters for the log endpoint.
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub task: String,
    pub stream: OutputStream,
}

/// Query parameters for the tail endpoint.
#[derive(Debug, Deserialize)]
pub struct TailQuery {
    pub task: String,
}

/// Schedule a pipeline run.
pub async fn schedule_pipeline(
    State(state): State<ApiState>,
    Extension(claims): Extension<Claims>,
    Json(request): Json<ScheduleRequest>,
) -> Result<Json<ScheduleResponse>, ApiError> {
    let opts = ScheduleOpts {
        user: claims.sub.unwrap_or_default(),
    };
    let job = state.runner.schedule(&request.pipeline, opts)?;

    Ok(Json(ScheduleResponse {
        job_id: job.id.to_string(),
    }))
}

/// List all defined pipelines with their current status.
pub async fn list_pipelines(State(state): State<ApiState>) -> Json<Vec<PipelineResult>> {
    Json(
        state
            .runner
            .list_pipelines()
            .into_iter()
            .map(PipelineResult::from)
            .collect(),
    )
}

/// List all jobs, newest first.
pub async fn list_jobs(State(state): State<ApiState>) -> Json<Vec<JobResult>> {
    Json(
        state
            .runner
            .list_jobs()
            .iter()
            .map(JobResult::from)
            .collect(),
    )
}

/// Get a single job by id.
pub async fn get_job(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResult>, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let job = state
        .runner
        .find_job(job_id)
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {}", job_id)))?;

    Ok(Json(JobResult::from(&job)))
}

/// Stream a task's stored output log.
pub async fn get_job_logs(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let job_id = parse_job_id(&job_id)?;
    let job = state
        .runner
        .find_job(job_id)
        .ok_or_else(|| ApiError::NotFound(format!("job not found: {}", job_id)))?;

    if job.task(&query.task).is_none() {
        return Err(ApiError::NotFound(format!(
            "job has no task '{}'",
            query.task
        )));
    }

    let file = state
        .output_store
        .reader(job_id, &query.task, query.stream)
        .await
        .map_err(|_| {
            ApiError::NotFound(format!(
                "no {} output for task '{}'",
                query.stream, query.task
            ))
        })?;

    let body = Body::from_stream(ReaderStream::new(file));
    Ok(([(CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

/// Snapshot of a running task's buffered output lines.
pub async fn get_job_tail(
    State(state): State<ApiState>,
    Path(job_id): Path<String>,
    Query(query): Query<TailQuery>,
) -> Result<Json<TailResponse>, ApiError> {
    let job_id = parse_job_id(&job_id)?;

    let (stdout, stderr) = state
        .task_runner
        .current_task_output(job_id, &query.task)
        .ok_or_else(|| {
            ApiError::NotFound(format!("no live output for task '{}'", query.task))
        })?;

    Ok(Json(TailResponse { stdout, stderr }))
}

fn parse_job_id(raw: &str) -> Result<JobId, ApiError> {
    JobId::from_string(raw).map_err(|_| ApiError::NotFound(format!("invalid job id: {}", raw)))
}
