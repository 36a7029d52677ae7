//! Configuration management for the revvault service.
//!
//! This module provides configuration handling through multiple sources:
//! 1. Default configuration (embedded in binary)
//! 2. System-wide configuration file (`/etc/revvault/config.toml`)
//! 3. User-specified configuration file
//! 4. Environment variables (prefixed with `REVVAULT_`, sections separated
//!    by `__`, e.g. `REVVAULT_BACKUP__POLL_INTERVAL_SECS`)
//! 5. Command-line arguments
//!
//! Configuration options are loaded in order of precedence, with later sources
//! overriding earlier ones.
//!
//! # Environment Variables
//!
//! - `REVVAULT_ROOT_URL` - Root endpoint of the document store deployment (required)
//! - `REVVAULT_VHOST` - Virtual host sent as the `Host` header
//! - `REVVAULT_STORE_USERNAME` - Store username
//! - `REVVAULT_STORE_PASSWORD` - Store password

use crate::backup::{CheckpointPolicy, RevisionMode};
use crate::error::{Error, Result};
use clap::Args as ClapArgs;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line overrides
#[derive(Debug, Clone, Default, ClapArgs)]
pub struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Root endpoint of the source and backup stores
    #[arg(long, env = "REVVAULT_ROOT_URL", value_name = "URL")]
    pub root_url: Option<String>,

    /// Virtual host identifier sent with every request
    #[arg(long, env = "REVVAULT_VHOST")]
    pub vhost: Option<String>,

    /// Seconds to wait between poll cycles
    #[arg(long, value_name = "SECS")]
    pub interval: Option<u64>,
}

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Store endpoint settings
    pub store: StoreSettings,
    /// Dataset catalog location
    pub catalog: CatalogSettings,
    /// Poll loop and copy settings
    pub backup: BackupSettings,
    /// Checkpoint advancement settings
    pub checkpoint: CheckpointSettings,
    /// Bootstrap app deployed into new backup stores
    #[serde(default)]
    pub bootstrap: BootstrapSettings,
}

/// Store endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSettings {
    /// Root endpoint, e.g. `http://localhost:5984`
    #[serde(default)]
    pub root_url: Option<String>,
    /// Virtual host identifier
    #[serde(default)]
    pub vhost: Option<String>,
    /// Per-request timeout; bounds stalled transfers
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Where datasets are listed and their metadata records live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogSettings {
    /// Store holding one metadata record per dataset
    pub database: String,
    /// View listing every dataset, relative to `database`
    pub view: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    /// Appended to a dataset id to name its backup store
    #[serde(default = "default_suffix")]
    pub suffix: String,
    /// Delay between poll cycles
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Datasets processed at once
    #[serde(default = "default_dataset_concurrency")]
    pub max_concurrent_datasets: usize,
    /// Revision copies in flight per dataset
    #[serde(default = "default_copy_concurrency")]
    pub max_concurrent_copies: usize,
    /// Upper bound on changes read per batch (unbounded when unset)
    #[serde(default)]
    pub changes_limit: Option<usize>,
    #[serde(default)]
    pub revision_mode: RevisionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSettings {
    #[serde(default)]
    pub policy: CheckpointPolicy,
    /// Read-modify-write attempts before a conflicting update gives up
    #[serde(default = "default_conflict_retries")]
    pub max_conflict_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapSettings {
    /// JSON design document to deploy; a minimal one is used when unset
    #[serde(default)]
    pub design_doc: Option<PathBuf>,
    /// Id the design document is stored under
    #[serde(default = "default_design_doc_id")]
    pub doc_id: String,
}

impl Default for BootstrapSettings {
    fn default() -> Self {
        Self {
            design_doc: None,
            doc_id: default_design_doc_id(),
        }
    }
}

/// Store credentials
#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl ServiceConfig {
    /// Load configuration from all sources
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/revvault/config.toml").required(false));

        // Load user config if specified
        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        // Add environment variables
        builder = builder.add_source(
            config::Environment::with_prefix("REVVAULT")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut config: ServiceConfig = builder.build()?.try_deserialize()?;

        // Override with command line args
        if let Some(root_url) = &args.root_url {
            config.store.root_url = Some(root_url.clone());
        }
        if let Some(vhost) = &args.vhost {
            config.store.vhost = Some(vhost.clone());
        }
        if let Some(interval) = args.interval {
            config.backup.poll_interval_secs = interval;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the service cannot start with.
    pub fn validate(&self) -> Result<()> {
        self.root_url()?;
        if self.backup.max_concurrent_datasets == 0 || self.backup.max_concurrent_copies == 0 {
            return Err(Error::config("concurrency limits must be at least 1"));
        }
        if self.backup.suffix.is_empty() {
            return Err(Error::config(
                "backup.suffix must not be empty, backups would overwrite their source",
            ));
        }
        Ok(())
    }

    /// Parsed root endpoint
    pub fn root_url(&self) -> Result<Url> {
        let raw = self
            .store
            .root_url
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| Error::config("store.root_url is not set (use --root-url or REVVAULT_ROOT_URL)"))?;
        Url::parse(raw).map_err(|e| Error::config(format!("invalid store.root_url '{}': {}", raw, e)))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.backup.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.store.request_timeout_secs)
    }

    /// Get store credentials from environment
    pub fn get_credentials(&self) -> Option<Credentials> {
        let username = env::var("REVVAULT_STORE_USERNAME").ok()?;
        let password = env::var("REVVAULT_STORE_PASSWORD").ok()?;
        Some(Credentials { username, password })
    }
}

fn default_request_timeout() -> u64 {
    300
}

fn default_suffix() -> String {
    "-backup".to_string()
}

fn default_poll_interval() -> u64 {
    5
}

fn default_dataset_concurrency() -> usize {
    8
}

fn default_copy_concurrency() -> usize {
    16
}

fn default_conflict_retries() -> u32 {
    5
}

fn default_design_doc_id() -> String {
    crate::storage::bootstrap::DEFAULT_DOC_ID.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args_with_root() -> Args {
        Args {
            root_url: Some("http://localhost:5984".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = ServiceConfig::load(&args_with_root()).unwrap();
        assert_eq!(config.backup.poll_interval_secs, 5);
        assert_eq!(config.backup.suffix, "-backup");
        assert_eq!(config.backup.max_concurrent_copies, 16);
        assert_eq!(config.backup.revision_mode, RevisionMode::Latest);
        assert_eq!(config.checkpoint.policy, CheckpointPolicy::SuccessfulPrefix);
        assert_eq!(config.checkpoint.max_conflict_retries, 5);
        assert_eq!(config.catalog.database, "datasets");
        assert_eq!(config.bootstrap.doc_id, "_design/backup");
        assert!(config.backup.changes_limit.is_none());
    }

    #[test]
    fn test_missing_root_url_is_fatal() {
        let mut config = ServiceConfig::load(&args_with_root()).unwrap();
        config.store.root_url = None;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_root_url_is_rejected() {
        let mut config = ServiceConfig::load(&args_with_root()).unwrap();
        config.store.root_url = Some("not a url".to_string());
        assert!(matches!(config.root_url(), Err(Error::Config(_))));
    }

    #[test]
    fn test_user_file_and_cli_overrides() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[backup]\npoll_interval_secs = 30\nmax_concurrent_copies = 2\nrevision_mode = \"history\"\n\n[checkpoint]\npolicy = \"any_completion\""
        )
        .unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            vhost: Some("backup.example.org".to_string()),
            interval: Some(60),
            ..args_with_root()
        };
        let config = ServiceConfig::load(&args).unwrap();
        assert_eq!(config.backup.poll_interval_secs, 60);
        assert_eq!(config.backup.max_concurrent_copies, 2);
        assert_eq!(config.backup.revision_mode, RevisionMode::History);
        assert_eq!(config.checkpoint.policy, CheckpointPolicy::AnyCompletion);
        assert_eq!(config.store.vhost.as_deref(), Some("backup.example.org"));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let mut config = ServiceConfig::load(&args_with_root()).unwrap();
        config.backup.max_concurrent_datasets = 0;
        assert!(config.validate().is_err());
    }
}
