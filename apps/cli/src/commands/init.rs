//! Init command implementation.

use super::DEFAULT_CONFIG_FILE;
use anyhow::{Context, Result, bail};
use colored::Colorize;
use stackwise_training::TrainingConfig;
use std::path::PathBuf;

pub fn execute(path: Option<String>, force: bool) -> Result<()> {
    let path = PathBuf::from(path.unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string()));

    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    TrainingConfig::default().save(&path).with_context(|| format!("Failed to write {}", path.display()))?;

    println!("{} {}", "Wrote".green(), path.display());
    Ok(())
}
