use super::LoggingConfig;
use crate::config::Args as SettingsArgs;
use clap::Args;
use std::path::PathBuf;

#[derive(Args)]
pub struct RunCommand {
    /// Run a single cycle and exit
    #[arg(long)]
    pub once: bool,

    /// Run in detached mode
    #[arg(short = 'd', long)]
    pub detach: bool,

    /// PID file written in detached mode
    #[arg(long, value_name = "FILE", default_value = "/tmp/revvault.pid")]
    pub pid_file: PathBuf,

    /// Directory for log files (stdout when unset and not detached)
    #[arg(long, value_name = "DIR")]
    pub log_dir: Option<PathBuf>,

    #[command(flatten)]
    pub settings: SettingsArgs,

    #[command(flatten)]
    pub logging: LoggingConfig,
}
