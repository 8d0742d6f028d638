//! Kiln CLI - Command-line front end for the Kiln job scheduler
//!
//! The `kiln` binary runs batches of jobs against an in-process service and
//! inspects the configured devices, the stored models and the job journal.

mod commands;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::{devices, jobs, models, run, types::ModelsCommand};
use kiln_core::{KilnConfig, LogFormat};
use std::path::PathBuf;

/// Kiln - Multi-user training job scheduler
///
/// Kiln admits jobs under a global and a per-user concurrency limit, binds
/// each running job to a device and streams its progress to subscribers.
#[derive(Parser, Debug)]
#[command(name = "kiln", author, version, about = "Kiln - multi-user training job scheduler")]
struct Args {
    /// Configuration file (TOML); KILN__* environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the configuration
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the configured device pool
    Devices {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Submit a batch of jobs and wait for all of them to finish
    ///
    /// The batch file lists `[[jobs]]` entries with `user`, `kind` and
    /// `params`. Exits with status 1 if any job fails or is rejected.
    Run {
        /// Batch file (TOML)
        batch: PathBuf,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,

        /// Do not stream progress events
        #[arg(short, long)]
        quiet: bool,
    },

    /// Manage stored models
    #[command(subcommand)]
    Models(ModelsCommand),

    /// List jobs recorded in the journal
    Jobs {
        /// Only show jobs of this user
        #[arg(short, long)]
        user: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = KilnConfig::load(args.config.as_deref()).context("Failed to load configuration")?;

    let format = if args.json_logs { LogFormat::Json } else { config.logging.format };
    let level = args.log_level.clone().unwrap_or_else(|| config.logging.level.clone());
    kiln_core::logging::init(format, &level).context("Failed to initialize logging")?;

    match args.command {
        Command::Devices { json } => devices::execute(&config, json),
        Command::Run { batch, json, quiet } => run::execute(config, &batch, json, quiet).await,
        Command::Models(command) => models::execute(&config, command).await,
        Command::Jobs { user, json } => jobs::execute(&config, user.as_deref(), json),
    }
}
