//! Command implementations for the Stackwise CLI.

pub mod checkpoint;
pub mod init;
pub mod train;

use anyhow::{Context, Result};
use stackwise_training::TrainingConfig;
use std::path::{Path, PathBuf};

/// Configuration file picked up from the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "stackwise.toml";

/// Load `path`, or `./stackwise.toml` if present, or the built-in defaults.
pub fn load_config(path: Option<&Path>) -> Result<TrainingConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
            if !fallback.exists() {
                return Ok(TrainingConfig::default());
            }
            fallback
        }
    };

    TrainingConfig::load(&path).with_context(|| format!("Failed to load configuration from {}", path.display()))
}
