//! Run configuration loaded from YAML.
//!
//! The file must have a `folder` (output directory) and an `app` section
//! (handed to the application untouched). Any other top-level keys are kept
//! so the dump written to `<folder>/params-pretrain.yaml` matches the input.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use thiserror::Error;

/// Name of the config dump written by rank 0.
pub const PARAMS_FILE: &str = "params-pretrain.yaml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Output directory for this run.
    pub folder: PathBuf,

    /// Application-specific section.
    pub app: Value,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RunConfig {
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn to_pretty_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(ConfigError::Serialize)
    }

    /// Save configuration to a specific path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        fs::write(path, self.to_pretty_yaml()?).map_err(io_err)
    }

    pub fn params_path(&self) -> PathBuf {
        self.folder.join(PARAMS_FILE)
    }

    /// Create `folder` and write the config dump into it.
    pub fn dump_params(&self) -> Result<PathBuf, ConfigError> {
        let path = self.params_path();
        self.save_to(&path)?;
        Ok(path)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(#[source] serde_yaml::Error),

    #[error("serialize error: {0}")]
    Serialize(#[source] serde_yaml::Error),
}
