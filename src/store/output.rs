//! Per-task output log files.
//!
//! Each (job, task, stream) gets its own append-only log file under
//! `logs/{job_id}/{task}-{stream}.log`. Writers are opened by the running
//! task; readers open independently on demand for the HTTP log endpoint.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs::File;

use crate::core::types::JobId;

/// Which output stream of a task a log file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File-per-stream blob store for task output.
#[derive(Debug, Clone)]
pub struct OutputStore {
    base_path: PathBuf,
}

impl OutputStore {
    /// Create the store, ensuring the base directory exists.
    pub fn new(base_path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(base_path.join("logs"))?;
        Ok(Self { base_path })
    }

    /// Open the log file of a (job, task, stream) for writing.
    pub async fn writer(
        &self,
        job_id: JobId,
        task_name: &str,
        stream: OutputStream,
    ) -> std::io::Result<File> {
        let dir = self.base_path.join("logs").join(job_id.to_string());
        tokio::fs::create_dir_all(&dir).await?;
        File::create(self.build_path(job_id, task_name, stream)).await
    }

    /// Open the log file of a (job, task, stream) for reading.
    pub async fn reader(
        &self,
        job_id: JobId,
        task_name: &str,
        stream: OutputStream,
    ) -> std::io::Result<File> {
        File::open(self.build_path(job_id, task_name, stream)).await
    }

    fn build_path(&self, job_id: JobId, task_name: &str, stream: OutputStream) -> PathBuf {
        self.base_path
            .join("logs")
            .join(job_id.to_string())
            .join(format!("{}-{}.log", task_name, stream))
    }

    /// Base directory of the store.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path()).unwrap();
        let job_id = JobId::new();

        let mut writer = store
            .writer(job_id, "build", OutputStream::Stdout)
            .await
            .unwrap();
        writer.write_all(b"compiling\n").await.unwrap();
        writer.flush().await.unwrap();
        drop(writer);

        let mut reader = store
            .reader(job_id, "build", OutputStream::Stdout)
            .await
            .unwrap();
        let mut contents = String::new();
        reader.read_to_string(&mut contents).await.unwrap();

        assert_eq!(contents, "compiling\n");
    }

    #[tokio::test]
    async fn test_reader_fails_for_missing_log() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path()).unwrap();

        let result = store
            .reader(JobId::new(), "ghost", OutputStream::Stderr)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_streams_are_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = OutputStore::new(dir.path()).unwrap();
        let job_id = JobId::new();

        let mut out = store
            .writer(job_id, "t", OutputStream::Stdout)
            .await
            .unwrap();
        out.write_all(b"out\n").await.unwrap();
        out.flush().await.unwrap();

        let mut err = store
            .writer(job_id, "t", OutputStream::Stderr)
            .await
            .unwrap();
        err.write_all(b"err\n").await.unwrap();
        err.flush().await.unwrap();

        let mut contents = String::new();
        store
            .reader(job_id, "t", OutputStream::Stderr)
            .await
            .unwrap()
            .read_to_string(&mut contents)
            .await
            .unwrap();
        assert_eq!(contents, "err\n");
    }
}
