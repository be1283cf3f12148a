//! phaseloop CLI: run, plan and inspect phased training tasks.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Phase-based training task runner
#[derive(Parser, Debug)]
#[command(name = "phaseloop", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Build a task from a configuration file and train it on the CPU backend
    Train {
        /// Task configuration (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Checkpoint file or directory to resume from
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Write a checkpoint into this directory after every phase
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,
    },
    /// Print the phase plan for a run
    Plan {
        /// Number of epochs
        #[arg(short, long)]
        epochs: usize,

        /// Test after every N train phases
        #[arg(short, long, default_value_t = 1)]
        period: usize,

        /// Train phases per epoch
        #[arg(long, default_value_t = 1.0)]
        phases_per_epoch: f64,

        /// Plan a test-only run
        #[arg(long)]
        test_only: bool,
    },
    /// Print the counters stored in a checkpoint
    Inspect {
        /// Checkpoint file or directory
        checkpoint: PathBuf,
    },
    /// Manage task configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a starter configuration file
    Init {
        /// Destination path
        #[arg(default_value = "phaseloop.toml")]
        path: PathBuf,
    },
    /// Show the effective configuration after environment overrides
    Show {
        /// Task configuration (TOML)
        config: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured run logs
    let log_dir = directories::ProjectDirs::from("dev", "phaseloop", "phaseloop")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "phaseloop.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command)
}
