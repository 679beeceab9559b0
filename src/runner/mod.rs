//! The pipeline runner: admission, queueing, job lifecycle and persistence.
//!
//! All job state lives behind one readers-writer lock. Schedule requests,
//! executor callbacks and wait-list drainage mutate it under the write lock;
//! queries and persistence snapshots take the read lock. Guards are never
//! held across an `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::core::definition::{PipelineDef, PipelineSet, QueueStrategy};
use crate::core::job::{Job, TaskStatus};
use crate::core::types::JobId;
use crate::exec::{ExecutionGraph, StageChange, StageScheduler, TaskChange, TaskError, TaskRunner};
use crate::store::{DataStore, PersistedJob, StateSnapshot, StoreError};

/// Minimum interval between two snapshot writes.
const PERSIST_INTERVAL: Duration = Duration::from_secs(3);

/// Options accompanying a schedule request.
#[derive(Debug, Clone, Default)]
pub struct ScheduleOpts {
    /// Principal that requested the job.
    pub user: String,
}

/// Errors returned synchronously from [`PipelineRunner::schedule`].
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("pipeline '{0}' is not defined")]
    UnknownPipeline(String),

    #[error("concurrency exceeded and queueing disabled for pipeline '{0}'")]
    QueueDisabled(String),

    #[error("concurrency exceeded and queue limit reached for pipeline '{0}'")]
    QueueFull(String),
}

/// Admission decision for one schedule request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScheduleAction {
    Start,
    Queue,
    Replace,
    NoQueue,
    QueueFull,
}

/// Status of one defined pipeline, as reported by `list_pipelines`.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub pipeline: String,
    /// Whether a schedule request right now would be admitted.
    pub schedulable: bool,
    /// Whether at least one job of this pipeline is running.
    pub running: bool,
}

#[derive(Default)]
struct RunnerState {
    /// All jobs ever admitted during this process lifetime (plus restored
    /// ones). Never removed.
    jobs: HashMap<JobId, Job>,
    /// Job ids per pipeline in admission order.
    jobs_by_pipeline: HashMap<String, Vec<JobId>>,
    /// Admitted-but-not-started jobs per pipeline; the head runs next.
    wait_lists: HashMap<String, VecDeque<JobId>>,
}

impl RunnerState {
    fn running_jobs_count(&self, pipeline: &str) -> usize {
        self.jobs_by_pipeline
            .get(pipeline)
            .map_or(0, |ids| {
                ids.iter()
                    .filter(|id| self.jobs.get(id).is_some_and(|j| j.is_running()))
                    .count()
            })
    }

    fn is_running(&self, pipeline: &str) -> bool {
        self.running_jobs_count(pipeline) > 0
    }

    fn wait_list_len(&self, pipeline: &str) -> usize {
        self.wait_lists.get(pipeline).map_or(0, |w| w.len())
    }
}

/// Computes the admission action for a pipeline from current state.
///
/// Evaluated under the runner lock, atomically with the resulting mutation;
/// two requests can never both observe a free slot and both start.
fn resolve_schedule_action(
    state: &RunnerState,
    def: &PipelineDef,
    pipeline: &str,
) -> ScheduleAction {
    let running = state.running_jobs_count(pipeline);
    if running < def.concurrency {
        return ScheduleAction::Start;
    }

    if def.queue_limit == Some(0) {
        return ScheduleAction::NoQueue;
    }

    let wait_len = state.wait_list_len(pipeline);
    if def.queue_strategy == QueueStrategy::Replace && wait_len > 0 {
        return ScheduleAction::Replace;
    }

    if let Some(limit) = def.queue_limit {
        if wait_len >= limit {
            return ScheduleAction::QueueFull;
        }
    }

    ScheduleAction::Queue
}

/// Long-lived service core: admits schedule requests, runs jobs through the
/// stage scheduler, tracks their state and persists it with a debounce.
pub struct PipelineRunner {
    defs: Arc<PipelineSet>,
    scheduler: Arc<StageScheduler>,
    state: RwLock<RunnerState>,
    store: Option<Arc<dyn DataStore>>,
    persist_tx: mpsc::Sender<()>,
}

impl PipelineRunner {
    /// Build the runner, register executor callbacks, restore persisted
    /// state and start the persistence writer.
    pub async fn new(
        defs: Arc<PipelineSet>,
        task_runner: Arc<TaskRunner>,
        scheduler: Arc<StageScheduler>,
        store: Option<Arc<dyn DataStore>>,
        shutdown: CancellationToken,
    ) -> Result<Arc<Self>, StoreError> {
        // One-slot channel: a pending request is kept while a save is
        // running; anything beyond that is dropped by `request_persist`.
        let (persist_tx, persist_rx) = mpsc::channel(1);

        let runner = Arc::new(Self {
            defs,
            scheduler,
            state: RwLock::new(RunnerState::default()),
            store,
            persist_tx,
        });

        let weak = Arc::downgrade(&runner);
        task_runner.on_task_change(Arc::new(move |change| {
            if let Some(runner) = weak.upgrade() {
                runner.handle_task_change(change);
            }
        }));

        let weak = Arc::downgrade(&runner);
        runner.scheduler.on_stage_change(Arc::new(move |change| {
            if let Some(runner) = weak.upgrade() {
                runner.handle_stage_change(change);
            }
        }));

        if let Some(store) = &runner.store {
            let snapshot = store.load().await?;
            runner.initial_load_from_store(snapshot);
            runner.spawn_persist_loop(persist_rx, shutdown);
        }

        Ok(runner)
    }

    /// Admit a schedule request for `pipeline`.
    ///
    /// Returns a snapshot of the admitted job; its execution is strictly
    /// asynchronous from this call.
    pub fn schedule(
        self: &Arc<Self>,
        pipeline: &str,
        opts: ScheduleOpts,
    ) -> Result<Job, ScheduleError> {
        let mut state = self.lock_write();

        let def = self
            .defs
            .get(pipeline)
            .ok_or_else(|| ScheduleError::UnknownPipeline(pipeline.to_string()))?;

        let action = resolve_schedule_action(&state, def, pipeline);
        match action {
            ScheduleAction::NoQueue => {
                return Err(ScheduleError::QueueDisabled(pipeline.to_string()))
            }
            ScheduleAction::QueueFull => {
                return Err(ScheduleError::QueueFull(pipeline.to_string()))
            }
            _ => {}
        }

        let job = Job::new(JobId::new(), pipeline, &opts.user, def);
        let id = job.id;
        state
            .jobs_by_pipeline
            .entry(pipeline.to_string())
            .or_default()
            .push(id);
        state.jobs.insert(id, job);

        match action {
            ScheduleAction::Queue => {
                state
                    .wait_lists
                    .entry(pipeline.to_string())
                    .or_default()
                    .push_back(id);
                debug!(pipeline = %pipeline, job_id = %id, "Queued: added job to wait list");
            }
            ScheduleAction::Replace => {
                let RunnerState {
                    jobs, wait_lists, ..
                } = &mut *state;
                if let Some(tail) = wait_lists
                    .entry(pipeline.to_string())
                    .or_default()
                    .back_mut()
                {
                    if let Some(previous) = jobs.get_mut(tail) {
                        previous.canceled = true;
                    }
                    *tail = id;
                }
                debug!(pipeline = %pipeline, job_id = %id, "Queued: replaced job on wait list");
            }
            ScheduleAction::Start => {
                self.start_job_locked(&mut state, id);
                debug!(pipeline = %pipeline, job_id = %id, "Started: scheduled job execution");
            }
            // Rejections returned above.
            ScheduleAction::NoQueue | ScheduleAction::QueueFull => {}
        }

        self.request_persist();

        Ok(state
            .jobs
            .get(&id)
            .cloned()
            .expect("job registered just above"))
    }

    /// Begin executing a job. Called with the write lock held, either from
    /// admission or from wait-list drainage.
    fn start_job_locked(self: &Arc<Self>, state: &mut RunnerState, id: JobId) {
        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };

        let graph = match ExecutionGraph::from_job(job) {
            Ok(graph) => Arc::new(graph),
            Err(e) => {
                // Definitions are validated at load, so this is defensive.
                error!(job_id = %id, error = %e, "Failed to build execution graph");
                job.last_error = Some(e.to_string());
                job.canceled = true;
                let pipeline = job.pipeline.clone();

                // A job was canceled, so there may be room for queued jobs.
                self.start_jobs_on_wait_list(state, &pipeline);
                self.request_persist();
                return;
            }
        };

        job.start = Some(Utc::now());
        self.request_persist();

        let scheduler = Arc::clone(&self.scheduler);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let result = scheduler.schedule(graph).await;
            if let Some(runner) = weak.upgrade() {
                runner.job_completed(id, result.err());
            }
        });
    }

    /// Terminal bookkeeping once a job's graph has finished.
    fn job_completed(self: &Arc<Self>, id: JobId, error: Option<TaskError>) {
        let mut state = self.lock_write();

        let Some(job) = state.jobs.get_mut(&id) else {
            return;
        };

        job.completed = true;
        job.end = Some(Utc::now());
        job.last_error = error.map(|e| e.to_string());
        let pipeline = job.pipeline.clone();

        debug!(job_id = %id, pipeline = %pipeline, "Job completed");

        // A job finished, so there may be room to start queued jobs.
        self.start_jobs_on_wait_list(&mut state, &pipeline);

        self.request_persist();
    }

    /// Start as many wait-listed jobs as the admission rule allows.
    ///
    /// Bounded by min(wait-list length, concurrency − running).
    fn start_jobs_on_wait_list(self: &Arc<Self>, state: &mut RunnerState, pipeline: &str) {
        let Some(def) = self.defs.get(pipeline) else {
            return;
        };

        while state.wait_list_len(pipeline) > 0
            && resolve_schedule_action(state, def, pipeline) == ScheduleAction::Start
        {
            let Some(id) = state
                .wait_lists
                .get_mut(pipeline)
                .and_then(|w| w.pop_front())
            else {
                break;
            };

            self.start_job_locked(state, id);
            debug!(pipeline = %pipeline, job_id = %id, "Dequeued: scheduled job execution");
        }
    }

    /// Task-change fan-in from the task runner. Unknown job ids and task
    /// names are ignored (late callbacks after shutdown or restore).
    fn handle_task_change(&self, change: &TaskChange) {
        {
            let mut state = self.lock_write();

            let Some(job) = state.jobs.get_mut(&change.job_id) else {
                return;
            };
            let Some(task) = job.task_mut(&change.task) else {
                return;
            };

            if change.start.is_some() {
                task.start = change.start;
            }
            if change.end.is_some() {
                task.end = change.end;
            }
            task.errored = change.errored;
            task.error = change.error.clone();
            task.exit_code = change.exit_code;
            task.skipped = change.skipped;
        }

        self.request_persist();
    }

    /// Stage-change fan-in from the stage scheduler.
    fn handle_stage_change(&self, change: &StageChange) {
        {
            let mut state = self.lock_write();

            let Some(job) = state.jobs.get_mut(&change.job_id) else {
                return;
            };
            let Some(task) = job.task_mut(&change.stage) else {
                return;
            };

            task.status = change.status;
        }

        self.request_persist();
    }

    /// Point lookup of a job snapshot.
    pub fn find_job(&self, id: JobId) -> Option<Job> {
        let state = self.lock_read();
        state.jobs.get(&id).cloned()
    }

    /// Snapshot of all jobs, newest first.
    pub fn list_jobs(&self) -> Vec<Job> {
        let state = self.lock_read();
        let mut jobs: Vec<Job> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created.cmp(&a.created));
        jobs
    }

    /// Status of every defined pipeline, sorted by name.
    pub fn list_pipelines(&self) -> Vec<PipelineStatus> {
        let state = self.lock_read();
        self.defs
            .iter()
            .map(|(name, def)| {
                let action = resolve_schedule_action(&state, def, name);
                PipelineStatus {
                    pipeline: name.clone(),
                    schedulable: matches!(
                        action,
                        ScheduleAction::Start | ScheduleAction::Queue | ScheduleAction::Replace
                    ),
                    running: state.is_running(name),
                }
            })
            .collect()
    }

    /// Request a persistence tick. Non-blocking; if a tick is already
    /// pending the request is dropped, the pending tick will capture any
    /// newer state.
    fn request_persist(&self) {
        let _ = self.persist_tx.try_send(());
    }

    /// Build a point-in-time snapshot under the read lock and write it out.
    async fn save_to_store(&self) {
        let Some(store) = &self.store else {
            return;
        };

        debug!("Saving job state to data store");

        let snapshot = {
            let state = self.lock_read();

            // Persist in admission order so a restore rebuilds the same
            // per-pipeline ordering.
            let mut jobs: Vec<&Job> = state.jobs.values().collect();
            jobs.sort_by(|a, b| a.created.cmp(&b.created));

            StateSnapshot {
                jobs: jobs.into_iter().map(PersistedJob::from_job).collect(),
                wait_lists: state
                    .wait_lists
                    .iter()
                    .map(|(pipeline, ids)| (pipeline.clone(), ids.iter().copied().collect()))
                    .collect(),
            }
        };

        if let Err(e) = store.save(&snapshot).await {
            error!(error = %e, "Error saving job state to data store");
        }
    }

    /// Rebuild in-memory state from a loaded snapshot.
    ///
    /// Jobs that look running were running when the previous process died;
    /// their unfinished tasks and the job itself are forced to canceled.
    /// Rehydrated wait lists are drained immediately.
    fn initial_load_from_store(self: &Arc<Self>, snapshot: StateSnapshot) {
        debug!("Loading state from store");

        let mut state = self.lock_write();

        for pjob in snapshot.jobs {
            let mut job = pjob.into_job();

            if job.is_running() {
                for task in &mut job.tasks {
                    if matches!(task.status, TaskStatus::Waiting | TaskStatus::Running) {
                        task.status = TaskStatus::Canceled;
                    }
                }
                job.canceled = true;

                warn!(
                    job_id = %job.id,
                    pipeline = %job.pipeline,
                    "Found running job when restoring state, marked as canceled"
                );
            }

            state
                .jobs_by_pipeline
                .entry(job.pipeline.clone())
                .or_default()
                .push(job.id);
            state.jobs.insert(job.id, job);
        }

        for (pipeline, ids) in snapshot.wait_lists {
            for id in ids {
                if !state.jobs.contains_key(&id) {
                    error!(job_id = %id, pipeline = %pipeline, "Job on wait list was not defined");
                    continue;
                }
                state
                    .wait_lists
                    .entry(pipeline.clone())
                    .or_default()
                    .push_back(id);
            }

            self.start_jobs_on_wait_list(&mut state, &pipeline);
        }
    }

    /// Single persistence writer: one save per received signal, with a
    /// sleep floor bounding the I/O rate regardless of event volume.
    fn spawn_persist_loop(
        self: &Arc<Self>,
        mut persist_rx: mpsc::Receiver<()>,
        shutdown: CancellationToken,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = persist_rx.recv() => {
                        if received.is_none() {
                            break;
                        }
                        let Some(runner) = weak.upgrade() else {
                            break;
                        };
                        runner.save_to_store().await;
                        drop(runner);
                        tokio::time::sleep(PERSIST_INTERVAL).await;
                    }
                }
            }
        });
    }

    fn lock_read(&self) -> RwLockReadGuard<'_, RunnerState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_write(&self) -> RwLockWriteGuard<'_, RunnerState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
