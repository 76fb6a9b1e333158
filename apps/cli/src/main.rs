//! Stackwise CLI - greedy layer-wise training from the command line
//!
//! Provides the `stackwise` command for training stacked autoencoders one
//! stage at a time and inspecting the checkpoints they leave behind.

mod commands;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use commands::{checkpoint, init, train};

/// Stackwise - staged training for stacked autoencoders
#[derive(Parser, Debug)]
#[command(name = "stackwise", author, version, about = "Stackwise - staged training for stacked autoencoders")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write a default training configuration
    ///
    /// Creates `stackwise.toml` (or PATH) with every option set to its default.
    Init {
        /// Target file (optional, defaults to ./stackwise.toml)
        path: Option<String>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Train every stage of the model
    ///
    /// Runs stages in order, handing off when each reaches its epoch budget.
    /// A final checkpoint is written however the run ends.
    Train(train::TrainArgs),

    /// Inspect saved checkpoints
    #[command(subcommand)]
    Checkpoint(checkpoint::CheckpointCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::Init { path, force } => init::execute(path, force)?,
        Command::Train(train_args) => train::execute(train_args).await?,
        Command::Checkpoint(command) => checkpoint::execute(command)?,
    }

    Ok(())
}
