//! In-memory job and task records.
//!
//! A [`Job`] is one execution of a pipeline. Its tasks carry a snapshot of
//! their definition plus runtime state, pre-sorted in a stable topological
//! order so that list output and persistence are deterministic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use super::definition::{PipelineDef, TaskDef};
use super::types::JobId;

/// Lifecycle state of a task within a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for dependencies.
    #[default]
    Waiting,
    /// Currently executing.
    Running,
    /// Skipped without execution.
    Skipped,
    /// Finished successfully.
    Done,
    /// Finished with an error.
    Error,
    /// Will not run (dependency failed, job canceled, or crash recovery).
    Canceled,
}

impl TaskStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Skipped | TaskStatus::Done | TaskStatus::Error | TaskStatus::Canceled
        )
    }
}

/// One task of a job: definition snapshot plus runtime state.
#[derive(Debug, Clone)]
pub struct JobTask {
    pub name: String,
    pub script: Vec<String>,
    pub depends_on: Vec<String>,
    pub allow_failure: bool,
    pub env: HashMap<String, String>,

    pub status: TaskStatus,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub skipped: bool,
    pub exit_code: i16,
    pub errored: bool,
    pub error: Option<String>,
}

impl JobTask {
    fn from_def(name: &str, def: &TaskDef) -> Self {
        Self {
            name: name.to_string(),
            script: def.script.clone(),
            depends_on: def.depends_on.clone(),
            allow_failure: def.allow_failure,
            env: def.env.clone(),
            status: TaskStatus::Waiting,
            start: None,
            end: None,
            skipped: false,
            exit_code: 0,
            errored: false,
            error: None,
        }
    }
}

/// One execution of a pipeline.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub pipeline: String,
    /// Schedule / queue time of the job.
    pub created: DateTime<Utc>,
    /// Actual start time; set exactly once when execution begins.
    pub start: Option<DateTime<Utc>>,
    /// Actual end time; set exactly once at terminal.
    pub end: Option<DateTime<Utc>>,
    pub completed: bool,
    pub canceled: bool,
    /// Principal that scheduled the job.
    pub user: String,
    pub last_error: Option<String>,
    /// Tasks sorted by dependencies (rank, ties by name ascending).
    pub tasks: Vec<JobTask>,
}

impl Job {
    /// Create a new job from a pipeline definition.
    pub fn new(id: JobId, pipeline: &str, user: &str, def: &PipelineDef) -> Self {
        Self {
            id,
            pipeline: pipeline.to_string(),
            created: Utc::now(),
            start: None,
            end: None,
            completed: false,
            canceled: false,
            user: user.to_string(),
            last_error: None,
            tasks: build_job_tasks(&def.tasks),
        }
    }

    /// A job is running iff it started and is not yet terminal.
    pub fn is_running(&self) -> bool {
        self.start.is_some() && !self.completed && !self.canceled
    }

    /// Find a task by name.
    pub fn task(&self, name: &str) -> Option<&JobTask> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Find a task by name for mutation.
    pub fn task_mut(&mut self, name: &str) -> Option<&mut JobTask> {
        self.tasks.iter_mut().find(|t| t.name == name)
    }

    /// Whether any task recorded an error, regardless of `allow_failure`.
    pub fn has_errored_task(&self) -> bool {
        self.tasks.iter().any(|t| t.errored)
    }
}

/// Build the task records for a job, sorted by dependencies.
pub fn build_job_tasks(defs: &BTreeMap<String, TaskDef>) -> Vec<JobTask> {
    let mut tasks: Vec<JobTask> = defs
        .iter()
        .map(|(name, def)| JobTask::from_def(name, def))
        .collect();

    sort_tasks_by_dependencies(&mut tasks);

    tasks
}

/// Sort tasks into a deterministic order consistent with their dependency
/// edges (Kahn's algorithm).
///
/// The ready queue is kept name-sorted so the traversal is stable; the final
/// order is by assigned rank with ties broken by name ascending. Cycles must
/// be rejected by definition validation before a job is ever built; nodes on
/// a residual cycle keep rank 0 here so the sort stays total.
pub fn sort_tasks_by_dependencies(tasks: &mut [JobTask]) {
    let mut incoming: HashMap<&str, Vec<String>> = HashMap::new();
    let mut order: HashMap<String, usize> = HashMap::new();
    let mut queue: Vec<String> = Vec::new();

    for task in tasks.iter() {
        incoming.insert(task.name.as_str(), task.depends_on.clone());
        if task.depends_on.is_empty() {
            queue.push(task.name.clone());
        }
    }
    queue.sort();

    let mut rank = 0usize;
    while !queue.is_empty() {
        let name = queue.remove(0);
        order.insert(name.clone(), rank);
        rank += 1;

        let mut unlocked: Vec<String> = Vec::new();
        for task in tasks.iter() {
            if let Some(deps) = incoming.get_mut(task.name.as_str()) {
                if deps.iter().any(|d| *d == name) {
                    deps.retain(|d| *d != name);
                    if deps.is_empty() {
                        unlocked.push(task.name.clone());
                    }
                }
            }
        }
        queue.extend(unlocked);
        queue.sort();
    }

    tasks.sort_by(|a, b| {
        let ra = order.get(&a.name).copied().unwrap_or(0);
        let rb = order.get(&b.name).copied().unwrap_or(0);
        ra.cmp(&rb).then_with(|| a.name.cmp(&b.name))
    });
}
