//! API response bodies.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::job::{Job, JobTask, TaskStatus};
use crate::runner::PipelineStatus;

/// Response to a successful schedule request.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleResponse {
    pub job_id: String,
}

/// Serialized view of one task of a job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub name: String,
    pub status: TaskStatus,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub skipped: bool,
    pub exit_code: i16,
    pub errored: bool,
    pub error: Option<String>,
}

impl From<&JobTask> for TaskResult {
    fn from(task: &JobTask) -> Self {
        Self {
            name: task.name.clone(),
            status: task.status,
            start: task.start,
            end: task.end,
            skipped: task.skipped,
            exit_code: task.exit_code,
            errored: task.errored,
            error: task.error.clone(),
        }
    }
}

/// Serialized view of one job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResult {
    pub id: String,
    pub pipeline: String,
    pub tasks: Vec<TaskResult>,
    pub completed: bool,
    pub canceled: bool,
    /// Whether any task recorded an error, including `allow_failure` tasks.
    pub errored: bool,
    pub created: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub user: String,
    pub last_error: Option<String>,
}

impl From<&Job> for JobResult {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.to_string(),
            pipeline: job.pipeline.clone(),
            tasks: job.tasks.iter().map(TaskResult::from).collect(),
            completed: job.completed,
            canceled: job.canceled,
            errored: job.has_errored_task(),
            created: job.created,
            start: job.start,
            end: job.end,
            user: job.user.clone(),
            last_error: job.last_error.clone(),
        }
    }
}

/// Serialized view of one defined pipeline.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub pipeline: String,
    pub schedulable: bool,
    pub running: bool,
}

impl From<PipelineStatus> for PipelineResult {
    fn from(status: PipelineStatus) -> Self {
        Self {
            pipeline: status.pipeline,
            schedulable: status.schedulable,
            running: status.running,
        }
    }
}

/// Live tail of a running task's output.
#[derive(Debug, Serialize)]
pub struct TailResponse {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}
