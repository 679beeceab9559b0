//! Raw configuration file formats.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::definition::PipelineDef;

/// On-disk format of a pipeline definition file.
///
/// ```yaml
/// pipelines:
///   release:
///     concurrency: 1
///     queue_limit: 2
///     queue_strategy: replace
///     tasks:
///       test:
///         script: ["make test"]
///       build:
///         script: ["make build"]
///         depends_on: [test]
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelinesFile {
    #[serde(default)]
    pub pipelines: BTreeMap<String, PipelineDef>,
}

/// Service configuration (`.gantry.yml`).
///
/// Created with a generated secret on first start if the file is missing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Symmetric key for signing and validating API bearer tokens.
    pub jwt_secret: String,
}
