//! Task execution.
//!
//! A task's script is a sequence of shell commands run one after another.
//! Each command receives the previous command's stdout in `$OUTPUT`; a
//! finished task exports its stdout to later tasks of the same job as
//! `<TASK>_OUTPUT`. While a command runs, its output is multiplexed
//! line-wise into the live tail buffer and the on-disk output store.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::core::types::JobId;
use crate::store::{OutputStore, OutputStream};

use super::graph::{ExecutionGraph, Stage};
use super::output::{LineBuffer, TaskOutputBuffers};

/// Errors from running a single task.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Spawning a command or writing its output failed.
    #[error("task I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A command exited with a non-zero status.
    #[error("command exited with status {code}")]
    ExitStatus { code: i16 },

    /// The runner was canceled while the task was in flight.
    #[error("task was canceled")]
    Canceled,
}

/// Snapshot of a task's runtime fields, delivered on every material update.
#[derive(Debug, Clone)]
pub struct TaskChange {
    pub job_id: JobId,
    pub task: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub exit_code: i16,
    pub errored: bool,
    pub error: Option<String>,
    pub skipped: bool,
}

/// Callback invoked on task state changes.
pub type TaskChangeHandler = Arc<dyn Fn(&TaskChange) + Send + Sync>;

/// Runs tasks, multiplexing their output into the live buffers and the
/// output store.
pub struct TaskRunner {
    output_store: OutputStore,
    cancel: CancellationToken,
    on_task_change: RwLock<Option<TaskChangeHandler>>,
    live: Mutex<HashMap<(JobId, String), Arc<TaskOutputBuffers>>>,
}

impl TaskRunner {
    pub fn new(output_store: OutputStore) -> Self {
        Self {
            output_store,
            cancel: CancellationToken::new(),
            on_task_change: RwLock::new(None),
            live: Mutex::new(HashMap::new()),
        }
    }

    /// Register the single task-change callback. Later registrations replace
    /// earlier ones.
    pub fn on_task_change(&self, handler: TaskChangeHandler) {
        let mut slot = match self.on_task_change.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(handler);
    }

    /// Signal cancellation to all in-flight tasks. Their processes are
    /// killed and their `run` calls return [`TaskError::Canceled`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Live-tail snapshot of a currently running task's output.
    pub fn current_task_output(
        &self,
        job_id: JobId,
        task_name: &str,
    ) -> Option<(Vec<String>, Vec<String>)> {
        let live = match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        live.get(&(job_id, task_name.to_string()))
            .map(|buffers| (buffers.stdout.snapshot(), buffers.stderr.snapshot()))
    }

    /// Run one task's script to completion.
    pub async fn run(&self, stage: &Stage, graph: &ExecutionGraph) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            return Err(TaskError::Canceled);
        }

        let buffers = Arc::new(TaskOutputBuffers::default());
        self.insert_live(stage, Arc::clone(&buffers));

        let result = self.run_script(stage, graph, &buffers).await;

        self.remove_live(stage);
        result
    }

    async fn run_script(
        &self,
        stage: &Stage,
        graph: &ExecutionGraph,
        buffers: &TaskOutputBuffers,
    ) -> Result<(), TaskError> {
        let mut change = TaskChange {
            job_id: stage.job_id,
            task: stage.name.clone(),
            start: Some(Utc::now()),
            end: None,
            exit_code: 0,
            errored: false,
            error: None,
            skipped: false,
        };
        self.emit(&change);

        let mut stdout_file = self
            .output_store
            .writer(stage.job_id, &stage.name, OutputStream::Stdout)
            .await?;
        let mut stderr_file = self
            .output_store
            .writer(stage.job_id, &stage.name, OutputStream::Stderr)
            .await?;

        let mut task_stdout = String::new();
        let mut prev_output = String::new();

        for command in &stage.script {
            debug!(
                job_id = %stage.job_id,
                task = %stage.name,
                command = %command,
                "Running command"
            );

            let mut cmd = Command::new("sh");
            cmd.arg("-c")
                .arg(command)
                .envs(graph.exports())
                .envs(&stage.env)
                .env("TASK_NAME", &stage.name)
                .env("OUTPUT", &prev_output)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            let mut child = cmd.spawn()?;
            let child_stdout = child.stdout.take().ok_or_else(pipe_error)?;
            let child_stderr = child.stderr.take().ok_or_else(pipe_error)?;

            let mut command_stdout = String::new();

            let pump_and_wait = async {
                let (out, err) = tokio::join!(
                    pump_lines(
                        child_stdout,
                        &mut stdout_file,
                        &buffers.stdout,
                        Some(&mut command_stdout),
                    ),
                    pump_lines(child_stderr, &mut stderr_file, &buffers.stderr, None),
                );
                out?;
                err?;
                child.wait().await
            };

            let status = tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Returning drops the child, which kills the process.
                    change.end = Some(Utc::now());
                    change.errored = true;
                    change.error = Some(TaskError::Canceled.to_string());
                    self.emit(&change);
                    return Err(TaskError::Canceled);
                }
                status = pump_and_wait => status?,
            };

            let code = status.code().unwrap_or(-1) as i16;
            change.exit_code = code;

            if !status.success() {
                change.errored = true;
                change.error = Some(format!("command '{}' exited with status {}", command, code));

                if stage.allow_failure {
                    warn!(
                        job_id = %stage.job_id,
                        task = %stage.name,
                        exit_code = code,
                        "Command failed, continuing (allow_failure)"
                    );
                    self.emit(&change);
                    task_stdout.push_str(&command_stdout);
                    prev_output = command_stdout;
                    continue;
                }

                change.end = Some(Utc::now());
                self.emit(&change);
                return Err(TaskError::ExitStatus { code });
            }

            task_stdout.push_str(&command_stdout);
            prev_output = command_stdout;
        }

        graph.set_export(export_var_name(&stage.name), task_stdout);

        change.end = Some(Utc::now());
        self.emit(&change);
        Ok(())
    }

    fn emit(&self, change: &TaskChange) {
        let slot = match self.on_task_change.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(handler) = slot.as_ref() {
            handler(change);
        }
    }

    fn insert_live(&self, stage: &Stage, buffers: Arc<TaskOutputBuffers>) {
        let mut live = match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        live.insert((stage.job_id, stage.name.clone()), buffers);
    }

    fn remove_live(&self, stage: &Stage) {
        let mut live = match self.live.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        live.remove(&(stage.job_id, stage.name.clone()));
    }
}

fn pipe_error() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "child pipe not captured")
}

/// Environment variable name a task's stdout is exported under.
fn export_var_name(task_name: &str) -> String {
    let mut name: String = task_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    name.push_str("_OUTPUT");
    name
}

async fn pump_lines<R>(
    reader: R,
    sink: &mut tokio::fs::File,
    buffer: &LineBuffer,
    mut capture: Option<&mut String>,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        sink.write_all(line.as_bytes()).await?;
        sink.write_all(b"\n").await?;
        if let Some(capture) = capture.as_deref_mut() {
            capture.push_str(&line);
            capture.push('\n');
        }
        buffer.push(line);
    }
    sink.flush().await?;
    Ok(())
}
