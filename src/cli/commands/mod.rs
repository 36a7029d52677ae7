pub mod config;
pub mod run;
pub mod status;

pub use config::{ConfigCommand, LoggingConfig};
pub use run::RunCommand;
pub use status::StatusCommand;

use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the backup poller
    Run(RunCommand),
    /// Show datasets, their checkpoints and backup stores
    Status(StatusCommand),
    /// Print the effective configuration
    Config(ConfigCommand),
}

impl Commands {
    pub fn logging(&self) -> &LoggingConfig {
        match self {
            Commands::Run(cmd) => &cmd.logging,
            Commands::Status(cmd) => &cmd.logging,
            Commands::Config(cmd) => &cmd.logging,
        }
    }

    pub fn settings(&self) -> &crate::config::Args {
        match self {
            Commands::Run(cmd) => &cmd.settings,
            Commands::Status(cmd) => &cmd.settings,
            Commands::Config(cmd) => &cmd.settings,
        }
    }
}
