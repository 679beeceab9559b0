//! Immutable pipeline definitions.
//!
//! Definitions are produced by the configuration loader at startup and are
//! never mutated afterwards. A pipeline is a named DAG of shell tasks with a
//! concurrency limit and a queueing policy.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// What happens to queued jobs when the wait list already holds entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStrategy {
    /// New jobs are appended to the wait list (FIFO).
    #[default]
    Append,
    /// A new job replaces the most recently queued one; only the latest
    /// pending request matters.
    Replace,
}

/// Definition of a single task within a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDef {
    /// Shell commands executed sequentially under this task.
    pub script: Vec<String>,
    /// Names of tasks in the same pipeline that must finish first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// If set, a failing command records the error but does not fail the job.
    #[serde(default)]
    pub allow_failure: bool,
    /// Extra environment variables for this task's commands.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Definition of a pipeline: its tasks plus scheduling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDef {
    /// Maximum number of simultaneously running jobs for this pipeline.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Maximum wait-list length. `None` = unbounded, `Some(0)` = queueing
    /// disabled.
    #[serde(default)]
    pub queue_limit: Option<usize>,
    /// Queueing policy when the concurrency limit is reached.
    #[serde(default)]
    pub queue_strategy: QueueStrategy,
    /// Tasks keyed by name.
    pub tasks: BTreeMap<String, TaskDef>,
}

fn default_concurrency() -> usize {
    1
}

/// The set of all pipelines known to the service, loaded once at startup.
#[derive(Debug, Clone, Default)]
pub struct PipelineSet {
    pipelines: BTreeMap<String, PipelineDef>,
}

impl PipelineSet {
    /// Create a set from already validated definitions.
    pub fn new(pipelines: BTreeMap<String, PipelineDef>) -> Self {
        Self { pipelines }
    }

    /// Look up a pipeline by name.
    pub fn get(&self, name: &str) -> Option<&PipelineDef> {
        self.pipelines.get(name)
    }

    /// Number of defined pipelines.
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Iterate over pipelines in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &PipelineDef)> {
        self.pipelines.iter()
    }

    /// Pipeline names in ascending order.
    pub fn names(&self) -> impl Iterator<Item = &String> {
        self.pipelines.keys()
    }
}
