use crate::config::ConfigError;
use crate::stage::StageIndex;
use std::path::PathBuf;
use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

/// Failures that can end a training run.
///
/// Stage transitions are not errors and never appear here.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Startup-only: a restore was requested but no usable checkpoint exists.
    #[error("failed to restore checkpoint from {path}: {reason}")]
    RestoreFailure { path: PathBuf, reason: String },

    /// Forward/backward evaluation failed or produced a non-finite value.
    #[error("compute failure in stage {stage} at stage step {stage_step}: {reason}")]
    ComputeFailure { stage: StageIndex, stage_step: u64, reason: String },

    #[error("data source error: {0}")]
    Data(String),

    #[error("checkpoint write failed at {path}: {source}")]
    CheckpointWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("training interrupted at global step {global_step}")]
    Interrupted { global_step: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TrainingError {
    pub(crate) fn compute(stage: StageIndex, stage_step: u64, reason: impl Into<String>) -> Self {
        Self::ComputeFailure { stage, stage_step, reason: reason.into() }
    }

    pub(crate) fn restore(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::RestoreFailure { path: path.into(), reason: reason.into() }
    }
}
