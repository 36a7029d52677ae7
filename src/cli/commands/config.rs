use crate::config::Args as SettingsArgs;
use clap::Args;

/// Logging configuration that can be set via CLI or env vars
#[derive(Debug, Clone, Default, Args)]
pub struct LoggingConfig {
    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", env = "REVVAULT_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log filter directives
    #[arg(long = "log-filter", env = "REVVAULT_LOG_FILTER")]
    pub log_filter: Option<String>,
}

impl LoggingConfig {
    pub fn get_effective_level(&self) -> &str {
        match (self.verbose, self.log_level.as_deref()) {
            (v, _) if v >= 2 => "trace", // -vv flag
            (1, _) => "debug",           // -v flag
            (0, Some(level)) => level,   // Configured level
            _ => "info",                 // Default
        }
    }
}

#[derive(Args)]
pub struct ConfigCommand {
    #[command(flatten)]
    pub settings: SettingsArgs,

    #[command(flatten)]
    pub logging: LoggingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_level() {
        let mut logging = LoggingConfig::default();
        assert_eq!(logging.get_effective_level(), "info");

        logging.log_level = Some("warn".to_string());
        assert_eq!(logging.get_effective_level(), "warn");

        logging.verbose = 1;
        assert_eq!(logging.get_effective_level(), "debug");

        logging.verbose = 3;
        assert_eq!(logging.get_effective_level(), "trace");
    }
}
