//! Training command implementation.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::json;
use stackwise_training::{Trainer, TrainingConfig, TrainingSummary};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Configuration file (defaults to ./stackwise.toml when present)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Resume from the latest checkpoint instead of initializing fresh
    #[arg(long)]
    pub restore: bool,

    /// Directory for reports and checkpoints
    #[arg(long)]
    pub logs_dir: Option<PathBuf>,

    /// Epoch budget of every stage
    #[arg(long)]
    pub epochs: Option<u64>,

    /// Seed for initialization, shuffling and augmentation
    #[arg(long)]
    pub seed: Option<u64>,

    /// Output the summary as JSON
    #[arg(long)]
    pub json: bool,
}

impl TrainArgs {
    fn apply(&self, config: &mut TrainingConfig) {
        if self.restore {
            config.restore = true;
        }
        if let Some(dir) = &self.logs_dir {
            config.logs_dir.clone_from(dir);
        }
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
    }
}

pub async fn execute(args: TrainArgs) -> Result<()> {
    let mut config = super::load_config(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate().context("Invalid training configuration")?;

    let stop = Arc::new(AtomicBool::new(false));
    let signal_flag = Arc::clone(&stop);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current step");
            signal_flag.store(true, Ordering::SeqCst);
        }
    });

    let summary = tokio::task::spawn_blocking(move || Trainer::from_config(config)?.with_stop_flag(stop).train())
        .await
        .context("Training task panicked")?
        .context("Training failed")?;

    print_summary(&summary, args.json)
}

fn print_summary(summary: &TrainingSummary, json_output: bool) -> Result<()> {
    if json_output {
        let out = json!({
            "final_step": summary.final_step,
            "stages_completed": summary.stages_completed,
            "checkpoint": summary.checkpoint,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Stages:     {}", summary.stages_completed);
    println!("  Final step: {}", summary.final_step);
    println!("  Checkpoint: {}", summary.checkpoint.file.dimmed());
    Ok(())
}
