//! JSON file snapshot store.

use async_trait::async_trait;
use std::path::PathBuf;
use tracing::debug;

use super::{DataStore, StateSnapshot, StoreError};

/// Snapshot store backed by a single JSON file.
///
/// Saves write the whole document to a sibling temp file and rename it over
/// the target, so a crash mid-write never leaves a torn snapshot. The single
/// persistence writer guarantees non-concurrent saves.
#[derive(Debug, Clone)]
pub struct JsonDataStore {
    path: PathBuf,
}

impl JsonDataStore {
    /// Create a store persisting to `path` (conventionally `store.json`).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl DataStore for JsonDataStore {
    async fn load(&self) -> Result<StateSnapshot, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot file, starting empty");
                Ok(StateSnapshot::default())
            }
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(snapshot)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        Ok(())
    }
}
