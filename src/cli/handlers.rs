use crate::{
    backup::{DatasetEnumerator, Scheduler, SchedulerOptions},
    cli::commands::LoggingConfig,
    config::ServiceConfig,
    storage::{backup_store_name, bootstrap::DesignDocDeployer, CouchStore, DocumentStore},
};
use anyhow::{Context, Result};
use daemonize::Daemonize;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing::Level;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber.
///
/// Logs go to `revvault.log` under `log_dir` when one is given, to stdout
/// otherwise. The returned guard flushes the file writer and must be held
/// until exit.
pub fn init_logging(logging: &LoggingConfig, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    LogTracer::init().context("Failed to initialize log tracer")?;

    let filter = EnvFilter::builder()
        .with_default_directive(
            logging
                .get_effective_level()
                .parse()
                .unwrap_or(Level::INFO)
                .into(),
        )
        .parse_lossy(logging.log_filter.as_deref().unwrap_or(""));

    let builder = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    match log_dir {
        Some(dir) => {
            let file_appender = RollingFileAppender::new(Rotation::DAILY, dir, "revvault.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let subscriber = builder
                .with_writer(non_blocking)
                .with_ansi(false)
                .compact()
                .finish();
            tracing::subscriber::set_global_default(subscriber)
                .context("Failed to initialize logging")?;
            Ok(Some(guard))
        }
        None => {
            tracing::subscriber::set_global_default(builder.finish())
                .context("Failed to initialize logging")?;
            Ok(None)
        }
    }
}

/// Fork into the background. Must run before the async runtime starts.
pub fn daemonize(pid_file: &Path, working_dir: &Path) -> Result<()> {
    Daemonize::new()
        .pid_file(pid_file)
        .chown_pid_file(true)
        .working_directory(working_dir)
        .start()
        .context("Failed to start daemon")
}

/// Directory logs go to when running detached without `--log-dir`.
pub fn default_log_dir() -> Result<PathBuf> {
    std::env::current_dir().context("Failed to resolve working directory")
}

pub async fn handle_run(config: ServiceConfig, once: bool) -> Result<()> {
    let store = CouchStore::new(&config).context("Failed to create store client")?;
    let deployer = DesignDocDeployer::new(store.clone(), &config.bootstrap)
        .context("Failed to load bootstrap design document")?;

    let mut scheduler = Scheduler::new(
        Arc::new(store),
        Arc::new(deployer),
        SchedulerOptions::from(&config),
    );

    tracing::warn!("This is a pre-release alpha for preview purposes only.");

    if once {
        let report = scheduler.run_cycle().await;
        if let Some(err) = report.enumeration_error {
            anyhow::bail!("Backup cycle aborted: {}", err);
        }
        let failed = report.datasets.iter().filter(|d| d.is_failure()).count();
        if failed > 0 {
            anyhow::bail!("{} of {} datasets failed", failed, report.datasets.len());
        }
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::info!("Shutdown requested, finishing the current cycle (Ctrl-C again to abort)");
        signal_token.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Aborting");
            std::process::exit(130);
        }
    });

    scheduler.run(shutdown).await;
    Ok(())
}

#[derive(Serialize)]
struct DatasetStatusRow {
    dataset: String,
    owner: Option<String>,
    checkpoint: String,
    backup_store: String,
    backup_store_exists: Option<bool>,
}

pub async fn handle_status(config: ServiceConfig, json: bool) -> Result<()> {
    let store: Arc<dyn DocumentStore> =
        Arc::new(CouchStore::new(&config).context("Failed to create store client")?);
    let datasets = DatasetEnumerator::new(store.clone())
        .enumerate()
        .await
        .context("Failed to list datasets")?;

    let mut rows = Vec::with_capacity(datasets.len());
    for dataset in datasets {
        let backup_store = backup_store_name(&dataset.id, &config.backup.suffix);
        let backup_store_exists = match store.store_exists(&backup_store).await {
            Ok(exists) => Some(exists),
            Err(e) => {
                tracing::debug!("Cannot probe {}: {}", backup_store, e);
                None
            }
        };
        rows.push(DatasetStatusRow {
            checkpoint: dataset.resume_from().to_string(),
            owner: dataset.owner,
            dataset: dataset.id,
            backup_store,
            backup_store_exists,
        });
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!(
        "{:<32} {:<16} {:<24} {:<40} {}",
        "DATASET", "OWNER", "CHECKPOINT", "BACKUP STORE", "EXISTS"
    );
    for row in &rows {
        let exists = match row.backup_store_exists {
            Some(true) => "yes",
            Some(false) => "no",
            None => "unknown",
        };
        println!(
            "{:<32} {:<16} {:<24} {:<40} {}",
            row.dataset,
            row.owner.as_deref().unwrap_or("-"),
            row.checkpoint,
            row.backup_store,
            exists
        );
    }
    Ok(())
}

pub fn handle_config(config: &ServiceConfig) -> Result<()> {
    let rendered =
        serde_json::to_string_pretty(config).context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}
