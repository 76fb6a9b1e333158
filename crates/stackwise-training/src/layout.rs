use crate::config::TrainingConfig;
use crate::error::TrainingResult;
use std::path::{Path, PathBuf};

/// Filesystem layout of one training run.
///
/// Everything lives under `logs_dir`: report streams, the effective
/// configuration and the checkpoint files.
#[derive(Debug, Clone)]
pub struct RunLayout {
    root: PathBuf,
    checkpoint_name: String,
}

impl RunLayout {
    #[must_use]
    pub fn new(root: PathBuf, checkpoint_name: impl Into<String>) -> Self {
        Self { root, checkpoint_name: checkpoint_name.into() }
    }

    #[must_use]
    pub fn for_config(config: &TrainingConfig) -> Self {
        Self::new(config.logs_dir.clone(), config.checkpoint_name.clone())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn reports_dir(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn checkpoint_location(&self) -> PathBuf {
        self.root.join(&self.checkpoint_name)
    }

    /// Copy of the configuration the run was started with.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn ensure_dirs(&self) -> TrainingResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
