//! Pipeline definition discovery and validation.
//!
//! Definition files are discovered by glob pattern under a base directory,
//! parsed, merged into one [`PipelineSet`] and validated. Validation rejects
//! unknown dependency targets, dependency cycles, zero concurrency and empty
//! scripts; any failure aborts process start.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;

use tracing::debug;

use crate::core::definition::{PipelineDef, PipelineSet};

use super::error::ConfigError;
use super::types::PipelinesFile;

/// Load all pipeline definition files matching `pattern` under `base`.
pub fn load_pipelines(base: &Path, pattern: &str) -> Result<PipelineSet, ConfigError> {
    let full_pattern = base.join(pattern);
    let full_pattern = full_pattern.to_string_lossy();

    let mut pipelines: BTreeMap<String, PipelineDef> = BTreeMap::new();

    for entry in glob::glob(&full_pattern)? {
        let path = match entry {
            Ok(path) => path,
            Err(e) => return Err(ConfigError::Io(e.into_error())),
        };

        debug!(path = %path.display(), "Loading pipeline definitions");

        let contents = std::fs::read_to_string(&path)?;
        let file: PipelinesFile = serde_yaml::from_str(&contents)?;

        for (name, def) in file.pipelines {
            if pipelines.contains_key(&name) {
                return Err(ConfigError::DuplicatePipeline(name));
            }
            pipelines.insert(name, def);
        }
    }

    for (name, def) in &pipelines {
        validate_pipeline(name, def)?;
    }

    Ok(PipelineSet::new(pipelines))
}

/// Validate a single pipeline definition.
pub fn validate_pipeline(name: &str, def: &PipelineDef) -> Result<(), ConfigError> {
    if def.concurrency < 1 {
        return Err(ConfigError::InvalidConcurrency(name.to_string()));
    }

    for (task_name, task) in &def.tasks {
        if task.script.is_empty() {
            return Err(ConfigError::EmptyScript {
                pipeline: name.to_string(),
                task: task_name.clone(),
            });
        }
        for dep in &task.depends_on {
            if !def.tasks.contains_key(dep) {
                return Err(ConfigError::UnknownDependency {
                    pipeline: name.to_string(),
                    task: task_name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    check_acyclic(name, def)
}

/// Reject cyclic dependency graphs (Kahn's algorithm: any node left with
/// residual in-degree is on a cycle).
fn check_acyclic(name: &str, def: &PipelineDef) -> Result<(), ConfigError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for (task_name, task) in &def.tasks {
        in_degree.insert(task_name.as_str(), task.depends_on.len());
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(task, _)| *task)
        .collect();

    let mut visited = 0usize;
    while let Some(done) = queue.pop_front() {
        visited += 1;
        for (task_name, task) in &def.tasks {
            if task.depends_on.iter().any(|d| d == done) {
                let degree = in_degree
                    .get_mut(task_name.as_str())
                    .expect("in-degree map covers all tasks");
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(task_name.as_str());
                }
            }
        }
    }

    if visited != def.tasks.len() {
        let task = in_degree
            .iter()
            .filter(|(_, degree)| **degree > 0)
            .map(|(task, _)| task.to_string())
            .min()
            .unwrap_or_default();
        return Err(ConfigError::CycleDetected {
            pipeline: name.to_string(),
            task,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_defs(dir: &Path, file: &str, contents: &str) {
        fs::write(dir.join(file), contents).unwrap();
    }

    #[test]
    fn test_load_single_file() {
        let dir = tempfile::tempdir().unwrap();
        write_defs(
            dir.path(),
            "pipelines.yml",
            r#"
pipelines:
  build:
    concurrency: 2
    tasks:
      compile:
        script: ["make"]
      test:
        script: ["make test"]
        depends_on: [compile]
"#,
        );

        let set = load_pipelines(dir.path(), "**/pipelines.yml").unwrap();
        assert_eq!(set.len(), 1);

        let def = set.get("build").unwrap();
        assert_eq!(def.concurrency, 2);
        assert_eq!(def.tasks.len(), 2);
        assert_eq!(def.tasks["test"].depends_on, vec!["compile"]);
    }

    #[test]
    fn test_load_merges_multiple_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        write_defs(
            dir.path(),
            "pipelines.yml",
            "pipelines:\n  one:\n    tasks:\n      a:\n        script: [\"true\"]\n",
        );
        write_defs(
            &dir.path().join("sub"),
            "pipelines.yml",
            "pipelines:\n  two:\n    tasks:\n      b:\n        script: [\"true\"]\n",
        );

        let set = load_pipelines(dir.path(), "**/pipelines.yml").unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.get("one").is_some());
        assert!(set.get("two").is_some());
    }

    #[test]
    fn test_duplicate_pipeline_across_files_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_defs(
            dir.path(),
            "a-pipelines.yml",
            "pipelines:\n  same:\n    tasks:\n      a:\n        script: [\"true\"]\n",
        );
        write_defs(
            dir.path(),
            "b-pipelines.yml",
            "pipelines:\n  same:\n    tasks:\n      b:\n        script: [\"true\"]\n",
        );

        let result = load_pipelines(dir.path(), "**/*-pipelines.yml");
        assert!(matches!(result, Err(ConfigError::DuplicatePipeline(_))));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_defs(
            dir.path(),
            "pipelines.yml",
            r#"
pipelines:
  broken:
    tasks:
      a:
        script: ["true"]
        depends_on: [ghost]
"#,
        );

        let result = load_pipelines(dir.path(), "pipelines.yml");
        assert!(matches!(
            result,
            Err(ConfigError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn test_cycle_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_defs(
            dir.path(),
            "pipelines.yml",
            r#"
pipelines:
  cyclic:
    tasks:
      a:
        script: ["true"]
        depends_on: [b]
      b:
        script: ["true"]
        depends_on: [a]
"#,
        );

        let result = load_pipelines(dir.path(), "pipelines.yml");
        assert!(matches!(result, Err(ConfigError::CycleDetected { .. })));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_defs(
            dir.path(),
            "pipelines.yml",
            r#"
pipelines:
  lazy:
    concurrency: 0
    tasks:
      a:
        script: ["true"]
"#,
        );

        let result = load_pipelines(dir.path(), "pipelines.yml");
        assert!(matches!(result, Err(ConfigError::InvalidConcurrency(_))));
    }

    #[test]
    fn test_empty_script_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_defs(
            dir.path(),
            "pipelines.yml",
            "pipelines:\n  hollow:\n    tasks:\n      a:\n        script: []\n",
        );

        let result = load_pipelines(dir.path(), "pipelines.yml");
        assert!(matches!(result, Err(ConfigError::EmptyScript { .. })));
    }

    #[test]
    fn test_unknown_queue_strategy_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_defs(
            dir.path(),
            "pipelines.yml",
            r#"
pipelines:
  odd:
    queue_strategy: rotate
    tasks:
      a:
        script: ["true"]
"#,
        );

        let result = load_pipelines(dir.path(), "pipelines.yml");
        assert!(matches!(result, Err(ConfigError::Yaml(_))));
    }

    #[test]
    fn test_no_matching_files_yields_empty_set() {
        let dir = tempfile::tempdir().unwrap();
        let set = load_pipelines(dir.path(), "**/pipelines.yml").unwrap();
        assert!(set.is_empty());
    }
}
