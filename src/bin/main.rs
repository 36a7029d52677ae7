//! Revvault binary.
//!
//! Entry point for the backup poller: runs backup cycles, reports dataset
//! checkpoints and prints the effective configuration.

use anyhow::Context;
use clap::Parser;
use revvault_core::{
    cli::commands::Commands,
    cli::handlers::{daemonize, default_log_dir, handle_config, handle_run, handle_status, init_logging},
    config::ServiceConfig,
};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ServiceConfig::load(cli.command.settings()).context("Failed to load configuration")?;

    // Forking has to happen before any thread exists (log writer, runtime)
    let log_dir = match &cli.command {
        Commands::Run(cmd) if cmd.detach => {
            let log_dir = match &cmd.log_dir {
                Some(dir) => dir.clone(),
                None => default_log_dir()?,
            };
            let working_dir = default_log_dir()?;
            daemonize(&cmd.pid_file, &working_dir)?;
            Some(log_dir)
        }
        Commands::Run(cmd) => cmd.log_dir.clone(),
        _ => None,
    };

    let _guard = init_logging(cli.command.logging(), log_dir.as_deref())?;
    info!("Revvault starting up");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    match cli.command {
        Commands::Run(cmd) => runtime.block_on(handle_run(config, cmd.once)),
        Commands::Status(cmd) => runtime.block_on(handle_status(config, cmd.json)),
        Commands::Config(_) => handle_config(&config),
    }
}
