//! Poll loop driving the backup pipeline.
//!
//! One cycle enumerates datasets and runs, for each of them concurrently:
//! target resolution, change feed read, revision copies, checkpoint update.
//! Each dataset task returns a [`DatasetReport`]; the scheduler folds those
//! into its per-dataset [`DatasetState`] once the cycle is complete, sleeps
//! for the poll interval and starts over until cancelled.

use super::checkpoint::{self, CheckpointManager, CheckpointPolicy, CheckpointUpdate};
use super::copier::{copy_batch, CopyOutcome, RevisionCopier, RevisionMode};
use super::enumerator::DatasetEnumerator;
use super::feed::ChangeFeedReader;
use super::target::{ResolvedTarget, TargetResolver, TargetState};
use crate::config::ServiceConfig;
use crate::error::Error;
use crate::sequence::SeqToken;
use crate::storage::{BootstrapDeployer, Dataset, DocumentStore};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub suffix: String,
    pub poll_interval: Duration,
    pub max_concurrent_datasets: usize,
    pub max_concurrent_copies: usize,
    pub changes_limit: Option<usize>,
    pub revision_mode: RevisionMode,
    pub checkpoint_policy: CheckpointPolicy,
    pub max_conflict_retries: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            suffix: "-backup".to_string(),
            poll_interval: Duration::from_secs(5),
            max_concurrent_datasets: 8,
            max_concurrent_copies: 16,
            changes_limit: None,
            revision_mode: RevisionMode::Latest,
            checkpoint_policy: CheckpointPolicy::SuccessfulPrefix,
            max_conflict_retries: 5,
        }
    }
}

impl From<&ServiceConfig> for SchedulerOptions {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            suffix: config.backup.suffix.clone(),
            poll_interval: config.poll_interval(),
            max_concurrent_datasets: config.backup.max_concurrent_datasets,
            max_concurrent_copies: config.backup.max_concurrent_copies,
            changes_limit: config.backup.changes_limit,
            revision_mode: config.backup.revision_mode,
            checkpoint_policy: config.checkpoint.policy,
            max_conflict_retries: config.checkpoint.max_conflict_retries,
        }
    }
}

/// What the scheduler remembers about a dataset between cycles.
#[derive(Debug, Clone, Default)]
pub struct DatasetState {
    /// Last checkpoint known to be stored
    pub checkpoint: Option<SeqToken>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatasetStatus {
    /// No changes since the checkpoint
    Idle,
    Advanced { from: Option<SeqToken>, to: SeqToken },
    /// Copies ran but the checkpoint did not move (failures at the head of
    /// the batch, or another writer already stored a later checkpoint)
    Held,
    /// The dataset's cycle was abandoned
    Failed(String),
}

/// Result of one dataset's part of a cycle
#[derive(Debug, Clone)]
pub struct DatasetReport {
    pub dataset: String,
    pub target: Option<ResolvedTarget>,
    pub entries: usize,
    pub copied: usize,
    pub already_present: usize,
    pub failed_retryable: usize,
    pub failed_fatal: usize,
    /// Checkpoint stored once this dataset's part of the cycle finished
    pub checkpoint: Option<SeqToken>,
    pub status: DatasetStatus,
    /// The failure was a provisioning problem needing operator attention
    pub provisioning_failure: bool,
    /// First failed copy of the batch, if any
    pub copy_error: Option<String>,
}

impl DatasetReport {
    fn new(dataset: &str, checkpoint: Option<SeqToken>) -> Self {
        Self {
            dataset: dataset.to_string(),
            target: None,
            entries: 0,
            copied: 0,
            already_present: 0,
            failed_retryable: 0,
            failed_fatal: 0,
            checkpoint,
            status: DatasetStatus::Idle,
            provisioning_failure: false,
            copy_error: None,
        }
    }

    fn failed(mut self, err: &Error) -> Self {
        self.provisioning_failure =
            matches!(err, Error::TargetCreation { .. } | Error::Bootstrap { .. });
        self.status = DatasetStatus::Failed(err.to_string());
        self
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, DatasetStatus::Failed(_))
    }
}

/// Summary of one poll cycle
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: u64,
    pub started: DateTime<Utc>,
    pub elapsed: Duration,
    pub enumeration_error: Option<String>,
    pub datasets: Vec<DatasetReport>,
}

impl CycleReport {
    pub fn dataset(&self, id: &str) -> Option<&DatasetReport> {
        self.datasets.iter().find(|d| d.dataset == id)
    }

    pub fn copied(&self) -> usize {
        self.datasets.iter().map(|d| d.copied).sum()
    }

    pub fn failed_copies(&self) -> usize {
        self.datasets
            .iter()
            .map(|d| d.failed_retryable + d.failed_fatal)
            .sum()
    }

    fn log(&self) {
        if let Some(err) = &self.enumeration_error {
            error!("cycle {} aborted: {}", self.cycle, err);
            return;
        }
        let failed = self.datasets.iter().filter(|d| d.is_failure()).count();
        info!(
            cycle = self.cycle,
            datasets = self.datasets.len(),
            failed_datasets = failed,
            copied = self.copied(),
            failed_copies = self.failed_copies(),
            elapsed_ms = self.elapsed.as_millis() as u64,
            "backup cycle finished"
        );
    }
}

pub struct Scheduler {
    enumerator: DatasetEnumerator,
    resolver: TargetResolver,
    reader: ChangeFeedReader,
    copier: RevisionCopier,
    checkpoints: CheckpointManager,
    options: SchedulerOptions,
    states: HashMap<String, DatasetState>,
    cycles: u64,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        deployer: Arc<dyn BootstrapDeployer>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            enumerator: DatasetEnumerator::new(store.clone()),
            resolver: TargetResolver::new(store.clone(), deployer, options.suffix.clone()),
            reader: ChangeFeedReader::new(store.clone(), options.changes_limit),
            copier: RevisionCopier::new(store.clone(), options.revision_mode),
            checkpoints: CheckpointManager::new(store, options.max_conflict_retries),
            options,
            states: HashMap::new(),
            cycles: 0,
        }
    }

    pub fn state(&self, dataset: &str) -> Option<&DatasetState> {
        self.states.get(dataset)
    }

    /// Poll until `shutdown` is cancelled. A running cycle always completes.
    pub async fn run(&mut self, shutdown: CancellationToken) {
        info!(
            "backup poller started (interval {:?}, {} datasets / {} copies in flight)",
            self.options.poll_interval,
            self.options.max_concurrent_datasets,
            self.options.max_concurrent_copies
        );

        while !shutdown.is_cancelled() {
            self.run_cycle().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.options.poll_interval) => {}
            }
        }

        info!("backup poller stopped after {} cycles", self.cycles);
    }

    /// Run one full cycle over every dataset.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycles += 1;
        let cycle = self.cycles;
        let started = Utc::now();
        let clock = Instant::now();

        let span = info_span!("cycle", n = cycle);
        let outcome = async {
            let datasets = self.enumerator.enumerate().await?;
            let this = &*self;
            let reports: Vec<DatasetReport> = stream::iter(datasets)
                .map(|dataset| {
                    let known = this.states.get(&dataset.id).and_then(|s| s.checkpoint.clone());
                    let span = info_span!("dataset", id = %dataset.id);
                    this.process_dataset(dataset, known).instrument(span)
                })
                .buffer_unordered(this.options.max_concurrent_datasets.max(1))
                .collect()
                .await;
            Ok::<_, Error>(reports)
        }
        .instrument(span)
        .await;

        let report = match outcome {
            Ok(mut datasets) => {
                datasets.sort_by(|a, b| a.dataset.cmp(&b.dataset));
                self.apply(&datasets);
                CycleReport {
                    cycle,
                    started,
                    elapsed: clock.elapsed(),
                    enumeration_error: None,
                    datasets,
                }
            }
            Err(e) => CycleReport {
                cycle,
                started,
                elapsed: clock.elapsed(),
                enumeration_error: Some(e.to_string()),
                datasets: Vec::new(),
            },
        };
        report.log();
        report
    }

    /// Fold dataset reports into scheduler-owned state.
    fn apply(&mut self, reports: &[DatasetReport]) {
        self.states
            .retain(|id, _| reports.iter().any(|r| &r.dataset == id));

        for report in reports {
            let state = self.states.entry(report.dataset.clone()).or_default();
            if report.checkpoint.is_some() {
                state.checkpoint = report.checkpoint.clone();
            }
            match &report.status {
                DatasetStatus::Failed(reason) => {
                    state.consecutive_failures += 1;
                    state.last_error = Some(reason.clone());
                    if report.provisioning_failure {
                        error!(
                            "backup target for '{}' unavailable for {} consecutive cycles: {}",
                            report.dataset, state.consecutive_failures, reason
                        );
                    }
                }
                _ if report.failed_retryable + report.failed_fatal > 0 => {
                    state.consecutive_failures += 1;
                    state.last_error = report.copy_error.clone();
                    if report.failed_fatal > 0 && state.consecutive_failures > 1 {
                        error!(
                            "'{}' has {} copies that keep failing, {} consecutive cycles with failures: {}",
                            report.dataset,
                            report.failed_fatal,
                            state.consecutive_failures,
                            report.copy_error.as_deref().unwrap_or("unknown error")
                        );
                    }
                }
                _ => {
                    state.consecutive_failures = 0;
                    state.last_error = None;
                    state.last_success = Some(Utc::now());
                }
            }
        }
    }

    async fn process_dataset(&self, dataset: Dataset, known: Option<SeqToken>) -> DatasetReport {
        // The scheduler may know a newer checkpoint than a lagging catalog view
        let since = match (dataset.metadata.last_backup_seq.clone(), known) {
            (Some(a), Some(b)) => a.max(b),
            (a, b) => a.or(b).unwrap_or_default(),
        };
        let stored = (since != SeqToken::initial()).then(|| since.clone());
        let mut report = DatasetReport::new(&dataset.id, stored);

        let target = match self.resolver.resolve(&dataset.id).await {
            Ok(target) => target,
            Err(e) => return report.failed(&e),
        };
        if target.state == TargetState::Deployed {
            info!("backup store {} provisioned", target.name);
        }

        let batch = match self.reader.read(&dataset.id, &since).await {
            Ok(batch) => batch,
            Err(e) => {
                warn!("{}, retrying next cycle from {}", e, since);
                report.target = Some(target);
                return report.failed(&e);
            }
        };

        report.entries = batch.len();
        if batch.is_empty() {
            report.target = Some(target);
            // Every change in the window named no revision
            if let Some(last) = batch.last_seq.filter(|last| *last > since) {
                debug!("nothing to copy up to {}", last);
                return self.advance(&dataset.id, &last, report).await;
            }
            debug!("no changes since {}", since);
            return report;
        }

        let outcome = copy_batch(
            &self.copier,
            &dataset.id,
            &target.name,
            batch.entries,
            self.options.max_concurrent_copies,
        )
        .await;
        report.target = Some(target);
        report.copied = outcome.copied();
        report.already_present = outcome.already_present();
        report.failed_retryable = outcome.failed_retryable();
        report.failed_fatal = outcome.failed_fatal();

        for failure in outcome.failures() {
            debug!("unresolved change {} ({})", failure.entry.seq, failure.entry.id);
        }
        report.copy_error = outcome.failures().find_map(|failure| match &failure.outcome {
            CopyOutcome::Failed { reason, .. } => Some(format!(
                "change {} ({}): {}",
                failure.entry.seq, failure.entry.id, reason
            )),
            _ => None,
        });

        let Some(candidate) = checkpoint::plan(self.options.checkpoint_policy, &since, &outcome.results)
        else {
            if let Some(first) = outcome.failures().next() {
                warn!(
                    "checkpoint held at {}, change {} ({}) will be retried",
                    since, first.entry.seq, first.entry.id
                );
            }
            report.status = DatasetStatus::Held;
            return report;
        };

        self.advance(&dataset.id, &candidate, report).await
    }

    /// Persist `candidate` as the dataset's checkpoint and record the result.
    async fn advance(
        &self,
        dataset_id: &str,
        candidate: &SeqToken,
        mut report: DatasetReport,
    ) -> DatasetReport {
        match self.checkpoints.persist(dataset_id, candidate).await {
            Ok(CheckpointUpdate::Advanced { from, to, attempts }) => {
                info!(
                    "checkpoint {} -> {} ({} copied, {} failed{})",
                    from.as_ref().map(|s| s.as_str()).unwrap_or("none"),
                    to,
                    report.copied,
                    report.failed_retryable + report.failed_fatal,
                    if attempts > 1 { ", after conflicts" } else { "" }
                );
                report.checkpoint = Some(to.clone());
                report.status = DatasetStatus::Advanced { from, to };
            }
            Ok(CheckpointUpdate::Unchanged { stored }) => {
                report.checkpoint = stored;
                report.status = DatasetStatus::Held;
            }
            Err(e) => {
                error!("cannot store checkpoint {}: {}", candidate, e);
                return report.failed(&e);
            }
        }
        report
    }
}
