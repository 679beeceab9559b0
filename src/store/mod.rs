//! Durable state: the snapshot data store and the task output store.
//!
//! The data store persists the full set of jobs plus the per-pipeline wait
//! lists as one document, replaced wholesale on every save. Task errors
//! cross this boundary as plain strings; the original error value is not
//! recoverable after a reload.

mod json;
mod output;

pub use json::JsonDataStore;
pub use output::{OutputStore, OutputStream};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::core::job::{Job, JobTask, TaskStatus};
use crate::core::types::JobId;

/// Errors that can occur during snapshot persistence.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Disk I/O failed.
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Snapshot (de)serialization failed.
    #[error("store serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Persisted form of a [`JobTask`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTask {
    pub name: String,
    pub script: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub status: TaskStatus,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub skipped: bool,
    pub exit_code: i16,
    pub errored: bool,
    pub error: Option<String>,
}

/// Persisted form of a [`Job`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedJob {
    pub id: JobId,
    pub pipeline: String,
    pub completed: bool,
    pub canceled: bool,
    pub created: DateTime<Utc>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub user: String,
    pub tasks: Vec<PersistedTask>,
}

/// The whole persisted document: jobs plus wait lists by pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub jobs: Vec<PersistedJob>,
    pub wait_lists: HashMap<String, Vec<JobId>>,
}

impl PersistedJob {
    /// Snapshot an in-memory job for persistence.
    pub fn from_job(job: &Job) -> Self {
        Self {
            id: job.id,
            pipeline: job.pipeline.clone(),
            completed: job.completed,
            canceled: job.canceled,
            created: job.created,
            start: job.start,
            end: job.end,
            user: job.user.clone(),
            tasks: job
                .tasks
                .iter()
                .map(|t| PersistedTask {
                    name: t.name.clone(),
                    script: t.script.clone(),
                    depends_on: t.depends_on.clone(),
                    allow_failure: t.allow_failure,
                    env: t.env.clone(),
                    status: t.status,
                    start: t.start,
                    end: t.end,
                    skipped: t.skipped,
                    exit_code: t.exit_code,
                    errored: t.errored,
                    error: t.error.clone(),
                })
                .collect(),
        }
    }

    /// Rebuild the in-memory job from its persisted form.
    ///
    /// Task order is taken verbatim from the snapshot; it was topologically
    /// sorted when the job was built, so the order is stable across restarts.
    pub fn into_job(self) -> Job {
        Job {
            id: self.id,
            pipeline: self.pipeline,
            created: self.created,
            start: self.start,
            end: self.end,
            completed: self.completed,
            canceled: self.canceled,
            user: self.user,
            last_error: None,
            tasks: self
                .tasks
                .into_iter()
                .map(|t| JobTask {
                    name: t.name,
                    script: t.script,
                    depends_on: t.depends_on,
                    allow_failure: t.allow_failure,
                    env: t.env,
                    status: t.status,
                    start: t.start,
                    end: t.end,
                    skipped: t.skipped,
                    exit_code: t.exit_code,
                    errored: t.errored,
                    error: t.error,
                })
                .collect(),
        }
    }
}

/// Durable snapshot store.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Load the last saved snapshot; an empty snapshot if none exists.
    async fn load(&self) -> Result<StateSnapshot, StoreError>;

    /// Replace the stored snapshot.
    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), StoreError>;
}
