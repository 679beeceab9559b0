//! Execution graph for one job.
//!
//! The graph owns the stages derived from a job's tasks plus the shared
//! environment exports that flow between tasks. Stages carry their owning
//! job id so executor callbacks can be routed without any side channel.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;

use crate::core::job::Job;
use crate::core::types::JobId;

/// Errors from building an execution graph.
///
/// Definitions are validated at load time, so these are defensive; a failure
/// cancels the job instead of crashing the service.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    #[error("dependency cycle involving stage '{0}'")]
    Cycle(String),
}

/// One task of one job, as seen by the stage scheduler.
#[derive(Debug, Clone)]
pub struct Stage {
    pub job_id: JobId,
    pub name: String,
    pub script: Vec<String>,
    pub depends_on: Vec<String>,
    pub allow_failure: bool,
    pub env: HashMap<String, String>,
}

/// The stages of one job plus the job-scoped environment exports.
#[derive(Debug)]
pub struct ExecutionGraph {
    job_id: JobId,
    stages: Vec<Stage>,
    /// Environment variables exported by finished tasks, consumed by later
    /// ones (`<TASK>_OUTPUT`).
    exports: Mutex<HashMap<String, String>>,
}

impl ExecutionGraph {
    /// Build the execution graph for a job.
    pub fn from_job(job: &Job) -> Result<Self, GraphError> {
        let names: HashSet<&str> = job.tasks.iter().map(|t| t.name.as_str()).collect();

        for task in &job.tasks {
            for dep in &task.depends_on {
                if !names.contains(dep.as_str()) {
                    return Err(GraphError::UnknownDependency {
                        stage: task.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let stages: Vec<Stage> = job
            .tasks
            .iter()
            .map(|t| Stage {
                job_id: job.id,
                name: t.name.clone(),
                script: t.script.clone(),
                depends_on: t.depends_on.clone(),
                allow_failure: t.allow_failure,
                env: t.env.clone(),
            })
            .collect();

        check_acyclic(&stages)?;

        Ok(Self {
            job_id: job.id,
            stages,
            exports: Mutex::new(HashMap::new()),
        })
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Snapshot of the current exports.
    pub fn exports(&self) -> HashMap<String, String> {
        match self.exports.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Record an export produced by a finished task.
    pub fn set_export(&self, key: String, value: String) {
        let mut exports = match self.exports.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        exports.insert(key, value);
    }
}

fn check_acyclic(stages: &[Stage]) -> Result<(), GraphError> {
    let mut in_degree: HashMap<&str, usize> = stages
        .iter()
        .map(|s| (s.name.as_str(), s.depends_on.len()))
        .collect();

    let mut ready: Vec<&str> = in_degree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut visited = 0usize;
    while let Some(done) = ready.pop() {
        visited += 1;
        for stage in stages {
            if stage.depends_on.iter().any(|d| d == done) {
                let degree = in_degree
                    .get_mut(stage.name.as_str())
                    .expect("in-degree map covers all stages");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(stage.name.as_str());
                }
            }
        }
    }

    if visited != stages.len() {
        let stuck = in_degree
            .iter()
            .filter(|(_, d)| **d > 0)
            .map(|(name, _)| name.to_string())
            .min()
            .unwrap_or_default();
        return Err(GraphError::Cycle(stuck));
    }

    Ok(())
}
