mod analyzer;
mod commands;
mod config;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::commands::run::RunArgs;
use crate::commands::status::StatusArgs;

#[derive(Parser)]
#[command(name = "pkgsweep")]
#[command(about = "Download, unpack and analyze every package in a registry")]
struct Cli {
    /// Config file (defaults to ~/.config/pkgsweep/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log at debug level
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a batch over the registry catalog
    Run(RunArgs),
    /// Summarize an existing ledger
    Status(StatusArgs),
}

/// Logs go to stderr so stdout carries only progress lines and summaries.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let file = config::load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run(args) => commands::run::run(args, file).await,
        Command::Status(args) => commands::status::run(args, &file),
    }
}
