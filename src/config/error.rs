//! Configuration error types.

use thiserror::Error;

/// Errors that can occur when loading configuration or pipeline definitions.
///
/// Any of these fails process start; definitions are never hot-reloaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Invalid glob pattern for definition discovery.
    #[error("invalid definition pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    /// The same pipeline is defined in more than one file.
    #[error("pipeline '{0}' is defined more than once")]
    DuplicatePipeline(String),

    /// A task depends on a task that does not exist in the same pipeline.
    #[error("pipeline '{pipeline}': task '{task}' depends on unknown task '{dependency}'")]
    UnknownDependency {
        pipeline: String,
        task: String,
        dependency: String,
    },

    /// The task dependency graph contains a cycle.
    #[error("pipeline '{pipeline}': dependency cycle involving task '{task}'")]
    CycleDetected { pipeline: String, task: String },

    /// Concurrency must be at least 1.
    #[error("pipeline '{0}': concurrency must be >= 1")]
    InvalidConcurrency(String),

    /// A task has no commands to run.
    #[error("pipeline '{pipeline}': task '{task}' has an empty script")]
    EmptyScript { pipeline: String, task: String },
}
