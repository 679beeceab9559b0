//! Common test utilities shared across integration tests.
#![allow(dead_code)]

use gantry::{
    DataStore, Job, JobId, OutputStore, PipelineDef, PipelineRunner, PipelineSet, QueueStrategy,
    StageScheduler, TaskDef, TaskRunner,
};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Build a task definition from a script and dependency list.
pub fn task(script: &[&str], depends_on: &[&str]) -> TaskDef {
    TaskDef {
        script: script.iter().map(|s| s.to_string()).collect(),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
        allow_failure: false,
        env: Default::default(),
    }
}

/// Build a pipeline definition from (name, task) pairs.
pub fn pipeline(
    concurrency: usize,
    queue_limit: Option<usize>,
    queue_strategy: QueueStrategy,
    tasks: Vec<(&str, TaskDef)>,
) -> PipelineDef {
    PipelineDef {
        concurrency,
        queue_limit,
        queue_strategy,
        tasks: tasks
            .into_iter()
            .map(|(name, def)| (name.to_string(), def))
            .collect(),
    }
}

/// Build a pipeline set from (name, definition) pairs.
pub fn pipeline_set(pipelines: Vec<(&str, PipelineDef)>) -> Arc<PipelineSet> {
    let map: BTreeMap<String, PipelineDef> = pipelines
        .into_iter()
        .map(|(name, def)| (name.to_string(), def))
        .collect();
    Arc::new(PipelineSet::new(map))
}

/// Everything needed to drive a runner in tests.
pub struct TestRuntime {
    pub runner: Arc<PipelineRunner>,
    pub task_runner: Arc<TaskRunner>,
    pub output_store: Arc<OutputStore>,
    pub shutdown: CancellationToken,
}

/// Construct a full runtime rooted in `data_dir`.
pub async fn build_runtime(
    defs: Arc<PipelineSet>,
    store: Option<Arc<dyn DataStore>>,
    data_dir: &Path,
) -> TestRuntime {
    let output_store = Arc::new(OutputStore::new(data_dir).unwrap());
    let task_runner = Arc::new(TaskRunner::new(output_store.as_ref().clone()));
    let scheduler = Arc::new(StageScheduler::new(Arc::clone(&task_runner)));
    let shutdown = CancellationToken::new();

    let runner = PipelineRunner::new(
        defs,
        Arc::clone(&task_runner),
        scheduler,
        store,
        shutdown.clone(),
    )
    .await
    .unwrap();

    TestRuntime {
        runner,
        task_runner,
        output_store,
        shutdown,
    }
}

/// Wait until a job satisfies `pred`, polling its state.
///
/// More reliable than fixed sleeps since execution time can vary.
///
/// # Panics
///
/// Panics if the timeout is reached first.
pub async fn wait_for_job(
    runner: &PipelineRunner,
    id: JobId,
    pred: impl Fn(&Job) -> bool,
    timeout: Duration,
) -> Job {
    let start = tokio::time::Instant::now();
    loop {
        if let Some(job) = runner.find_job(id) {
            if pred(&job) {
                return job;
            }
        }
        if start.elapsed() > timeout {
            panic!(
                "Timeout waiting for job {}, current state: {:?}",
                id,
                runner.find_job(id)
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until a job is terminal (completed or canceled).
pub async fn wait_for_terminal(runner: &PipelineRunner, id: JobId, timeout: Duration) -> Job {
    wait_for_job(runner, id, |j| j.completed || j.canceled, timeout).await
}
