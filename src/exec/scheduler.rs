//! Stage scheduling for one job.
//!
//! Runs the stages of an execution graph in dependency order, dispatching
//! independent stages concurrently. Stage status transitions are reported
//! through a single registered callback.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::core::job::TaskStatus;
use crate::core::types::JobId;

use super::graph::ExecutionGraph;
use super::task_runner::{TaskError, TaskRunner};

/// A stage status transition.
#[derive(Debug, Clone)]
pub struct StageChange {
    pub job_id: JobId,
    pub stage: String,
    pub status: TaskStatus,
}

/// Callback invoked on stage status changes.
pub type StageChangeHandler = Arc<dyn Fn(&StageChange) + Send + Sync>;

/// Executes the stages of one job, honoring dependencies and `allow_failure`.
pub struct StageScheduler {
    task_runner: Arc<TaskRunner>,
    on_stage_change: RwLock<Option<StageChangeHandler>>,
}

impl StageScheduler {
    pub fn new(task_runner: Arc<TaskRunner>) -> Self {
        Self {
            task_runner,
            on_stage_change: RwLock::new(None),
        }
    }

    /// Register the single stage-change callback. Later registrations
    /// replace earlier ones.
    pub fn on_stage_change(&self, handler: StageChangeHandler) {
        let mut slot = match self.on_stage_change.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(handler);
    }

    /// Run the graph, blocking until every stage is terminal.
    ///
    /// Returns the last task error if any stage failed (or was canceled);
    /// `allow_failure` errors never surface here.
    pub async fn schedule(self: &Arc<Self>, graph: Arc<ExecutionGraph>) -> Result<(), TaskError> {
        let mut statuses: HashMap<String, TaskStatus> = graph
            .stages()
            .iter()
            .map(|s| (s.name.clone(), TaskStatus::Waiting))
            .collect();

        let mut last_error: Option<TaskError> = None;

        loop {
            self.cancel_blocked_stages(&graph, &mut statuses);

            let ready: Vec<_> = graph
                .stages()
                .iter()
                .filter(|stage| {
                    statuses.get(&stage.name) == Some(&TaskStatus::Waiting)
                        && stage.depends_on.iter().all(|dep| {
                            matches!(
                                statuses.get(dep),
                                Some(TaskStatus::Done) | Some(TaskStatus::Skipped)
                            )
                        })
                })
                .cloned()
                .collect();

            if ready.is_empty() {
                if statuses.values().all(|s| s.is_terminal()) {
                    break;
                }
                // Graphs are validated acyclic; this is a defensive exit.
                warn!(job_id = %graph.job_id(), "No runnable stages left, aborting graph");
                break;
            }

            let mut handles = Vec::with_capacity(ready.len());
            for stage in ready {
                statuses.insert(stage.name.clone(), TaskStatus::Running);
                self.emit(graph.job_id(), &stage.name, TaskStatus::Running);

                let scheduler = Arc::clone(self);
                let graph = Arc::clone(&graph);
                handles.push(tokio::spawn(async move {
                    let result = scheduler.task_runner.run(&stage, &graph).await;
                    let status = match &result {
                        Ok(()) => TaskStatus::Done,
                        Err(TaskError::Canceled) => TaskStatus::Canceled,
                        Err(_) => TaskStatus::Error,
                    };
                    scheduler.emit(graph.job_id(), &stage.name, status);
                    (stage.name, status, result)
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok((name, status, result)) => {
                        statuses.insert(name, status);
                        if let Err(e) = result {
                            last_error = Some(e);
                        }
                    }
                    Err(join_error) => {
                        warn!(job_id = %graph.job_id(), error = %join_error, "Stage task panicked");
                        last_error = Some(TaskError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            join_error.to_string(),
                        )));
                    }
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancel waiting stages whose dependencies failed or were canceled,
    /// cascading until a fixpoint.
    fn cancel_blocked_stages(
        &self,
        graph: &ExecutionGraph,
        statuses: &mut HashMap<String, TaskStatus>,
    ) {
        loop {
            let mut changed = false;
            for stage in graph.stages() {
                if statuses.get(&stage.name) != Some(&TaskStatus::Waiting) {
                    continue;
                }
                let blocked = stage.depends_on.iter().any(|dep| {
                    matches!(
                        statuses.get(dep),
                        Some(TaskStatus::Error) | Some(TaskStatus::Canceled)
                    )
                });
                if blocked {
                    statuses.insert(stage.name.clone(), TaskStatus::Canceled);
                    self.emit(graph.job_id(), &stage.name, TaskStatus::Canceled);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn emit(&self, job_id: JobId, stage: &str, status: TaskStatus) {
        let slot = match self.on_stage_change.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handler) = slot.as_ref() {
            handler(&StageChange {
                job_id,
                stage: stage.to_string(),
                status,
            });
        }
    }
}
