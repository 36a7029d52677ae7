//! Revision copying.
//!
//! Each change entry becomes one copy of the revision it names (or, in
//! history mode, one copy per revision the source still holds) into the
//! backup store under `documentId-revisionId`. Copies never fail the batch:
//! every entry yields a [`CopyOutcome`] and [`copy_batch`] folds them into a
//! [`BatchOutcome`].

use crate::error::{Error, Result};
use crate::storage::{revision_key, ChangeEntry, DocumentStore, WriteOutcome};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Which revisions a change entry is backed up as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionMode {
    /// The revision named by the change event
    #[default]
    Latest,
    /// Every revision of the document still available in the source
    History,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    /// `revisions` new entries were written
    Copied { revisions: usize },
    /// Everything was already in the backup store
    AlreadyPresent,
    Failed { retryable: bool, reason: String },
}

impl CopyOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, CopyOutcome::Failed { .. })
    }

    fn failed(err: &Error) -> Self {
        CopyOutcome::Failed {
            retryable: err.is_retryable(),
            reason: err.to_string(),
        }
    }
}

/// Outcome of copying one change entry
#[derive(Debug, Clone)]
pub struct EntryResult {
    pub entry: ChangeEntry,
    pub outcome: CopyOutcome,
}

/// All entry results of a batch, ascending by sequence.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub results: Vec<EntryResult>,
}

impl BatchOutcome {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn copied(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, CopyOutcome::Copied { .. }))
            .count()
    }

    pub fn already_present(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.outcome == CopyOutcome::AlreadyPresent)
            .count()
    }

    pub fn failed_retryable(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, CopyOutcome::Failed { retryable: true, .. }))
            .count()
    }

    pub fn failed_fatal(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, CopyOutcome::Failed { retryable: false, .. }))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntryResult> {
        self.results.iter().filter(|r| !r.outcome.is_success())
    }
}

pub struct RevisionCopier {
    store: Arc<dyn DocumentStore>,
    mode: RevisionMode,
}

impl RevisionCopier {
    pub fn new(store: Arc<dyn DocumentStore>, mode: RevisionMode) -> Self {
        Self { store, mode }
    }

    /// Copy one change entry from `source` into `target`.
    pub async fn copy(&self, source: &str, target: &str, entry: &ChangeEntry) -> CopyOutcome {
        let Some(rev) = entry.revision() else {
            return CopyOutcome::Failed {
                retryable: false,
                reason: format!("change {} for {} has no revision", entry.seq, entry.id),
            };
        };

        let revisions = match self.mode {
            RevisionMode::Latest => vec![rev.to_string()],
            RevisionMode::History => match self.history(source, entry, rev).await {
                Ok(revisions) => revisions,
                Err(e) => {
                    warn!("cannot list revisions of {}/{}: {}", source, entry.id, e);
                    return CopyOutcome::failed(&e);
                }
            },
        };

        let mut created = 0;
        for rev in &revisions {
            let key = revision_key(&entry.id, rev);
            match self
                .store
                .copy_revision(source, &entry.id, rev, target, &key)
                .await
            {
                Ok(WriteOutcome::Created) => created += 1,
                Ok(WriteOutcome::AlreadyPresent) => {
                    debug!("{}/{} already backed up", target, key);
                }
                Err(e) => {
                    warn!("copy of {}/{}@{} failed: {}", source, entry.id, rev, e);
                    return CopyOutcome::failed(&e);
                }
            }
        }

        if created == 0 {
            CopyOutcome::AlreadyPresent
        } else {
            CopyOutcome::Copied { revisions: created }
        }
    }

    /// Available revisions, oldest first, always including `rev`.
    async fn history(&self, source: &str, entry: &ChangeEntry, rev: &str) -> Result<Vec<String>> {
        // Deleted documents can't be listed without a rev
        if entry.deleted {
            return Ok(vec![rev.to_string()]);
        }
        let mut revisions = self.store.list_revisions(source, &entry.id).await?;
        if !revisions.iter().any(|r| r == rev) {
            revisions.insert(0, rev.to_string());
        }
        revisions.reverse();
        Ok(revisions)
    }
}

/// Copy every entry with at most `limit` copies in flight.
pub async fn copy_batch(
    copier: &RevisionCopier,
    source: &str,
    target: &str,
    entries: Vec<ChangeEntry>,
    limit: usize,
) -> BatchOutcome {
    let mut results: Vec<(usize, EntryResult)> = stream::iter(entries.into_iter().enumerate())
        .map(|(index, entry)| async move {
            let outcome = copier.copy(source, target, &entry).await;
            (index, EntryResult { entry, outcome })
        })
        .buffer_unordered(limit.max(1))
        .collect()
        .await;

    results.sort_by_key(|(index, _)| *index);
    BatchOutcome {
        results: results.into_iter().map(|(_, r)| r).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::StoreCall;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn setup() -> MemoryStore {
        let store = MemoryStore::new();
        store.add_store("alpha");
        store.add_store("alpha-backup");
        store
    }

    #[tokio::test]
    async fn test_latest_copies_named_revision() {
        let store = setup();
        let rev = store.put_document("alpha", "A", json!({"v": 1}));
        let entry = ChangeEntry::new("A", 1, rev.clone());

        let copier = RevisionCopier::new(Arc::new(store.clone()), RevisionMode::Latest);
        let outcome = copier.copy("alpha", "alpha-backup", &entry).await;
        assert_eq!(outcome, CopyOutcome::Copied { revisions: 1 });
        assert_eq!(
            store.document("alpha-backup", &format!("A-{}", rev)),
            Some(json!({"v": 1}))
        );
    }

    #[tokio::test]
    async fn test_second_copy_is_noop() {
        let store = setup();
        let rev = store.put_document("alpha", "A", json!({"v": 1}));
        let entry = ChangeEntry::new("A", 1, rev);

        let copier = RevisionCopier::new(Arc::new(store.clone()), RevisionMode::Latest);
        copier.copy("alpha", "alpha-backup", &entry).await;
        let again = copier.copy("alpha", "alpha-backup", &entry).await;
        assert_eq!(again, CopyOutcome::AlreadyPresent);
        assert_eq!(store.document_ids("alpha-backup").len(), 1);
    }

    #[tokio::test]
    async fn test_history_copies_every_available_revision() {
        let store = setup();
        store.put_document("alpha", "A", json!({"v": 1}));
        store.put_document("alpha", "A", json!({"v": 2}));
        let rev = store.put_document("alpha", "A", json!({"v": 3}));
        let entry = ChangeEntry::new("A", 3, rev);

        let copier = RevisionCopier::new(Arc::new(store.clone()), RevisionMode::History);
        let outcome = copier.copy("alpha", "alpha-backup", &entry).await;
        assert_eq!(outcome, CopyOutcome::Copied { revisions: 3 });
        assert_eq!(store.document_ids("alpha-backup").len(), 3);

        // Oldest revision goes first
        let first_copy = store
            .calls()
            .into_iter()
            .find_map(|c| match c {
                StoreCall::Copy { key, .. } => Some(key),
                _ => None,
            })
            .unwrap();
        assert!(first_copy.starts_with("A-1-"));
    }

    #[tokio::test]
    async fn test_history_fails_entry_when_revisions_cannot_be_listed() {
        let store = setup();
        store.put_document("alpha", "A", json!({"v": 1}));
        store.put_document("alpha", "A", json!({"v": 2}));
        let rev = store.put_document("alpha", "A", json!({"v": 3}));
        store.fail_revision_list("alpha", "A");

        let copier = RevisionCopier::new(Arc::new(store.clone()), RevisionMode::History);
        let outcome = copier
            .copy("alpha", "alpha-backup", &ChangeEntry::new("A", 3, rev))
            .await;
        assert!(matches!(outcome, CopyOutcome::Failed { retryable: true, .. }));
        assert!(store.document_ids("alpha-backup").is_empty());
        assert_eq!(store.copy_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_is_reported_not_raised() {
        let store = setup();
        let rev = store.put_document("alpha", "A", json!({}));
        store.fail_copy("alpha", "A", true);

        let copier = RevisionCopier::new(Arc::new(store), RevisionMode::Latest);
        let outcome = copier
            .copy("alpha", "alpha-backup", &ChangeEntry::new("A", 1, rev))
            .await;
        assert!(matches!(outcome, CopyOutcome::Failed { retryable: true, .. }));
    }

    #[tokio::test]
    async fn test_batch_keeps_feed_order_and_counts() {
        let store = setup();
        let mut entries = Vec::new();
        for (seq, id) in [(1, "A"), (2, "B"), (3, "C"), (4, "D")] {
            let rev = store.put_document_at("alpha", id, seq, json!({}));
            entries.push(ChangeEntry::new(id, seq, rev));
        }
        store.fail_copy("alpha", "C", false);

        let copier = RevisionCopier::new(Arc::new(store), RevisionMode::Latest);
        let batch = copy_batch(&copier, "alpha", "alpha-backup", entries, 3).await;
        let ids: Vec<_> = batch.results.iter().map(|r| r.entry.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C", "D"]);
        assert_eq!(batch.copied(), 3);
        assert_eq!(batch.failed_fatal(), 1);
        assert_eq!(batch.failed_retryable(), 0);
    }
}
