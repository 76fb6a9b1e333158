//! Checkpoint inspection commands.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use stackwise_training::CheckpointStore;
use std::path::PathBuf;

/// Checkpoint subcommands
#[derive(Subcommand, Debug)]
pub enum CheckpointCommand {
    /// Show the latest checkpoint
    Show {
        /// Configuration file naming the checkpoint location
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

pub fn execute(command: CheckpointCommand) -> Result<()> {
    match command {
        CheckpointCommand::Show { config, json } => show(config, json),
    }
}

fn show(config: Option<PathBuf>, json_output: bool) -> Result<()> {
    let config = super::load_config(config.as_deref())?;
    let store = CheckpointStore::from_config(&config);
    let latest = store.latest().context("Failed to read checkpoint index")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&latest)?);
        return Ok(());
    }

    let Some(record) = latest else {
        println!("  {}", format!("No checkpoint found at {}", store.location().display()).dimmed());
        return Ok(());
    };

    println!();
    println!("{}", "Latest checkpoint".bold().cyan());
    println!("  Step:     {}", record.step);
    println!("  File:     {}", store.snapshot_path(&record).display());
    println!("  SHA-256:  {}", record.sha256.dimmed());
    println!("  Saved at: {}", record.created_at.to_rfc3339());
    Ok(())
}
