//! Service configuration and pipeline definition loading.

mod error;
mod loader;
mod types;

pub use error::ConfigError;
pub use loader::{load_pipelines, validate_pipeline};
pub use types::{AppConfig, PipelinesFile};

use rand::distributions::Alphanumeric;
use rand::Rng;
use std::path::Path;
use tracing::info;

/// Length of a generated JWT secret.
const GENERATED_SECRET_LEN: usize = 48;

impl AppConfig {
    /// Load the service configuration, creating the file with a freshly
    /// generated secret if it does not exist yet.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            let config: AppConfig = serde_yaml::from_str(&contents)?;
            return Ok(config);
        }

        let config = AppConfig {
            jwt_secret: generate_secret(),
        };

        let contents = serde_yaml::to_string(&config).map_err(ConfigError::Yaml)?;
        std::fs::write(path, contents)?;
        info!(path = %path.display(), "Created configuration with generated secret");

        Ok(config)
    }
}

fn generate_secret() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_SECRET_LEN)
        .map(char::from)
        .collect()
}
