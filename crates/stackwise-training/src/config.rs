//! Training configuration.
//!
//! Every field has a serde default, so a partial (or empty) TOML file is a
//! valid configuration. Call [`TrainingConfig::validate`] before training.

use crate::stage::{StageIndex, StagePlan};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file not found.
    #[error("Configuration file not found: {0}")]
    NotFound(String),

    /// Failed to read or write a configuration file.
    #[error("Failed to read configuration file: {0}")]
    ReadError(String),

    /// Failed to parse or serialize a configuration file.
    #[error("Failed to parse configuration file: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Parameter update rule applied after clipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    Sgd,
    #[default]
    Adam,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self { beta1: default_beta1(), beta2: default_beta2(), epsilon: default_epsilon() }
    }
}

/// Where training examples come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataConfig {
    /// Low-rank vectors plus uniform noise, generated from `seed`.
    Synthetic {
        #[serde(default = "default_synthetic_size")]
        size: usize,
        #[serde(default = "default_synthetic_dim")]
        dim: usize,
        #[serde(default = "default_synthetic_rank")]
        rank: usize,
        #[serde(default = "default_synthetic_noise")]
        noise: f32,
    },
    /// One JSON array of numbers per line.
    Jsonl { path: PathBuf },
}

impl Default for DataConfig {
    fn default() -> Self {
        Self::Synthetic {
            size: default_synthetic_size(),
            dim: default_synthetic_dim(),
            rank: default_synthetic_rank(),
            noise: default_synthetic_noise(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Epoch budget of every stage.
    #[serde(default = "default_epochs")]
    pub epochs: u64,

    /// One entry per stage; the stage count is the length.
    #[serde(default = "default_hidden_sizes")]
    pub hidden_sizes: Vec<usize>,

    #[serde(default = "default_batch_sizes")]
    pub batch_sizes: Vec<usize>,

    #[serde(default = "default_max_gradient_norm")]
    pub max_gradient_norm: f32,

    #[serde(default = "default_lr_init")]
    pub lr_init: f64,

    #[serde(default = "default_lr_decay_factor")]
    pub lr_decay_factor: f64,

    #[serde(default)]
    pub optimizer: OptimizerKind,

    /// Scalar metric cadence, in global steps.
    #[serde(default = "default_train_report_rate")]
    pub train_report_rate: u64,

    /// Visualization cadence, in global steps.
    #[serde(default = "default_layer_report_rate")]
    pub layer_report_rate: u64,

    /// Periodic checkpoint cadence while the final stage is active.
    #[serde(default = "default_save_rate")]
    pub save_rate: u64,

    /// Console progress cadence, in global steps.
    #[serde(default = "default_log_rate")]
    pub log_rate: u64,

    /// Load the latest checkpoint before training instead of initializing fresh.
    #[serde(default)]
    pub restore: bool,

    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Largest absolute rotation (radians) sampled per example.
    #[serde(default = "default_angles_max_delta")]
    pub angles_max_delta: f32,

    /// Reporting directory; checkpoints live here as well.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    #[serde(default = "default_checkpoint_name")]
    pub checkpoint_name: String,

    /// Snapshots retained on disk; older ones are pruned.
    #[serde(default = "default_max_to_keep")]
    pub max_to_keep: usize,

    #[serde(default)]
    pub adam: AdamConfig,

    #[serde(default)]
    pub data: DataConfig,
}

fn default_epochs() -> u64 {
    10
}

fn default_hidden_sizes() -> Vec<usize> {
    vec![16, 32, 32, 64]
}

fn default_batch_sizes() -> Vec<usize> {
    vec![64, 64, 32, 16]
}

fn default_max_gradient_norm() -> f32 {
    1.0
}

fn default_lr_init() -> f64 {
    1e-1
}

fn default_lr_decay_factor() -> f64 {
    1e-3
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-8
}

fn default_train_report_rate() -> u64 {
    100
}

fn default_layer_report_rate() -> u64 {
    500
}

fn default_save_rate() -> u64 {
    200
}

fn default_log_rate() -> u64 {
    10
}

fn default_seed() -> u64 {
    42
}

fn default_angles_max_delta() -> f32 {
    15f32.to_radians()
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("data/logs")
}

fn default_checkpoint_name() -> String {
    "autoencoder_model.ckpt".to_string()
}

fn default_max_to_keep() -> usize {
    5
}

fn default_synthetic_size() -> usize {
    2048
}

fn default_synthetic_dim() -> usize {
    128
}

fn default_synthetic_rank() -> usize {
    8
}

fn default_synthetic_noise() -> f32 {
    0.05
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            hidden_sizes: default_hidden_sizes(),
            batch_sizes: default_batch_sizes(),
            max_gradient_norm: default_max_gradient_norm(),
            lr_init: default_lr_init(),
            lr_decay_factor: default_lr_decay_factor(),
            optimizer: OptimizerKind::default(),
            train_report_rate: default_train_report_rate(),
            layer_report_rate: default_layer_report_rate(),
            save_rate: default_save_rate(),
            log_rate: default_log_rate(),
            restore: false,
            seed: default_seed(),
            angles_max_delta: default_angles_max_delta(),
            logs_dir: default_logs_dir(),
            checkpoint_name: default_checkpoint_name(),
            max_to_keep: default_max_to_keep(),
            adam: AdamConfig::default(),
            data: DataConfig::default(),
        }
    }
}

impl TrainingConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;

        Self::from_toml_str(&content)
            .map_err(|e| ConfigError::ParseError(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ParseError(format!("Failed to serialize: {}", e)))
    }

    /// Save configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = self.to_toml_string()?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::ReadError(format!("Failed to create directory: {}", e)))?;
        }

        std::fs::write(path, content).map_err(|e| ConfigError::ReadError(format!("Failed to write file: {}", e)))
    }

    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.hidden_sizes.len()
    }

    /// Path that acts as both checkpoint save target and restore source.
    #[must_use]
    pub fn checkpoint_path(&self) -> PathBuf {
        self.logs_dir.join(&self.checkpoint_name)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.hidden_sizes.is_empty() {
            return Err(ConfigError::InvalidValue("hidden_sizes must name at least one stage".to_string()));
        }
        if self.batch_sizes.len() != self.hidden_sizes.len() {
            return Err(ConfigError::InvalidValue(format!(
                "batch_sizes has {} entries but hidden_sizes has {}",
                self.batch_sizes.len(),
                self.hidden_sizes.len()
            )));
        }
        if let Some(idx) = self.hidden_sizes.iter().position(|&h| h == 0) {
            return Err(ConfigError::InvalidValue(format!("hidden_sizes[{idx}] must be >= 1")));
        }
        if let Some(idx) = self.batch_sizes.iter().position(|&b| b == 0) {
            return Err(ConfigError::InvalidValue(format!("batch_sizes[{idx}] must be >= 1")));
        }
        if self.epochs == 0 {
            return Err(ConfigError::InvalidValue("epochs must be >= 1".to_string()));
        }
        if !self.max_gradient_norm.is_finite() || self.max_gradient_norm <= 0.0 {
            return Err(ConfigError::InvalidValue("max_gradient_norm must be > 0".to_string()));
        }
        if !self.lr_init.is_finite() || self.lr_init <= 0.0 {
            return Err(ConfigError::InvalidValue("lr_init must be > 0".to_string()));
        }
        if !self.lr_decay_factor.is_finite() || self.lr_decay_factor <= 0.0 {
            return Err(ConfigError::InvalidValue("lr_decay_factor must be > 0".to_string()));
        }
        for (name, rate) in [
            ("train_report_rate", self.train_report_rate),
            ("layer_report_rate", self.layer_report_rate),
            ("save_rate", self.save_rate),
            ("log_rate", self.log_rate),
        ] {
            if rate == 0 {
                return Err(ConfigError::InvalidValue(format!("{name} must be >= 1")));
            }
        }
        if self.checkpoint_name.trim().is_empty() {
            return Err(ConfigError::InvalidValue("checkpoint_name is required".to_string()));
        }
        if self.max_to_keep == 0 {
            return Err(ConfigError::InvalidValue("max_to_keep must be >= 1".to_string()));
        }
        if !self.angles_max_delta.is_finite() || self.angles_max_delta < 0.0 {
            return Err(ConfigError::InvalidValue("angles_max_delta must be >= 0".to_string()));
        }
        for (name, beta) in [("adam.beta1", self.adam.beta1), ("adam.beta2", self.adam.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(ConfigError::InvalidValue(format!("{name} must be in [0, 1)")));
            }
        }
        if !self.adam.epsilon.is_finite() || self.adam.epsilon <= 0.0 {
            return Err(ConfigError::InvalidValue("adam.epsilon must be > 0".to_string()));
        }
        if let DataConfig::Synthetic { size, dim, rank, noise } = &self.data {
            if *size == 0 || *dim == 0 || *rank == 0 {
                return Err(ConfigError::InvalidValue("synthetic data needs size, dim and rank >= 1".to_string()));
            }
            if !noise.is_finite() || *noise < 0.0 {
                return Err(ConfigError::InvalidValue("synthetic noise must be >= 0".to_string()));
            }
        }
        Ok(())
    }

    /// One plan per stage, in stage order.
    #[must_use]
    pub fn stage_plans(&self, dataset_size: usize) -> Vec<StagePlan> {
        StageIndex::all(self.stage_count())
            .zip(self.hidden_sizes.iter().zip(&self.batch_sizes))
            .map(|(index, (&hidden, &batch))| StagePlan::new(index, hidden, batch, self.epochs, dataset_size))
            .collect()
    }
}
