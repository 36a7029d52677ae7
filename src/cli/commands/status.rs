use super::LoggingConfig;
use crate::config::Args as SettingsArgs;
use clap::Args;

#[derive(Args)]
pub struct StatusCommand {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub settings: SettingsArgs,

    #[command(flatten)]
    pub logging: LoggingConfig,
}
