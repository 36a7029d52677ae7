//! Checkpoint planning and persistence.
//!
//! A dataset's checkpoint (`lastBackupSeq`) only moves forward, and only once
//! every copy in the batch that produced it has reported back. Which sequence
//! it moves to depends on the [`CheckpointPolicy`]:
//!
//! - [`CheckpointPolicy::SuccessfulPrefix`] stops right before the first
//!   failed entry. Everything from that entry on is read again next cycle,
//!   so nothing is skipped; already copied revisions are re-sent as no-ops.
//! - [`CheckpointPolicy::AnyCompletion`] moves to the end of the batch
//!   whatever the outcomes. Failed revisions are then never retried and are
//!   missing from the backup unless the document changes again.
//!
//! Persistence is a versioned read-modify-write: a write that lost a race
//! against another writer re-reads the record and tries again.

use super::copier::EntryResult;
use crate::error::{Error, Result};
use crate::sequence::SeqToken;
use crate::storage::DocumentStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointPolicy {
    #[default]
    SuccessfulPrefix,
    AnyCompletion,
}

/// Sequence the checkpoint should move to after a batch, if it moves at all.
///
/// `results` must be in feed order.
pub fn plan(
    policy: CheckpointPolicy,
    previous: &SeqToken,
    results: &[EntryResult],
) -> Option<SeqToken> {
    let candidate = match policy {
        CheckpointPolicy::SuccessfulPrefix => results
            .iter()
            .take_while(|r| r.outcome.is_success())
            .map(|r| &r.entry.seq)
            .max(),
        CheckpointPolicy::AnyCompletion => {
            let failed = results.iter().filter(|r| !r.outcome.is_success()).count();
            if failed > 0 {
                warn!(
                    "checkpoint moves past {} failed copies, those revisions will not be retried",
                    failed
                );
            }
            results.iter().map(|r| &r.entry.seq).max()
        }
    }?;

    (candidate > previous).then(|| candidate.clone())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckpointUpdate {
    Advanced {
        from: Option<SeqToken>,
        to: SeqToken,
        /// Writes issued, including ones lost to conflicts
        attempts: u32,
    },
    /// The stored checkpoint was already at or beyond the candidate
    Unchanged { stored: Option<SeqToken> },
}

impl CheckpointUpdate {
    /// Checkpoint stored after the update
    pub fn checkpoint(&self) -> Option<&SeqToken> {
        match self {
            CheckpointUpdate::Advanced { to, .. } => Some(to),
            CheckpointUpdate::Unchanged { stored } => stored.as_ref(),
        }
    }
}

pub struct CheckpointManager {
    store: Arc<dyn DocumentStore>,
    max_conflict_retries: u32,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn DocumentStore>, max_conflict_retries: u32) -> Self {
        Self {
            store,
            max_conflict_retries,
        }
    }

    /// Move the dataset's stored checkpoint forward to `candidate`.
    pub async fn persist(&self, dataset_id: &str, candidate: &SeqToken) -> Result<CheckpointUpdate> {
        let mut attempts = 0;
        loop {
            let mut metadata = self.store.read_metadata(dataset_id).await?;
            let stored = metadata.last_backup_seq.clone();
            if stored.as_ref().is_some_and(|s| s >= candidate) {
                debug!(
                    "{}: stored checkpoint {:?} already covers {}",
                    dataset_id, stored, candidate
                );
                return Ok(CheckpointUpdate::Unchanged { stored });
            }

            metadata.last_backup_seq = Some(candidate.clone());
            attempts += 1;
            match self.store.write_metadata(dataset_id, &metadata).await {
                Ok(_) => {
                    return Ok(CheckpointUpdate::Advanced {
                        from: stored,
                        to: candidate.clone(),
                        attempts,
                    })
                }
                Err(Error::Conflict(_)) if attempts <= self.max_conflict_retries => {
                    debug!(
                        "{}: metadata changed underneath us, retrying ({}/{})",
                        dataset_id, attempts, self.max_conflict_retries
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::copier::CopyOutcome;
    use crate::storage::{ChangeEntry, DatasetMetadata, MemoryStore};

    fn result(seq: u64, ok: bool) -> EntryResult {
        EntryResult {
            entry: ChangeEntry::new(format!("doc{}", seq), seq, "1-a"),
            outcome: if ok {
                CopyOutcome::Copied { revisions: 1 }
            } else {
                CopyOutcome::Failed {
                    retryable: true,
                    reason: "boom".into(),
                }
            },
        }
    }

    #[test]
    fn test_all_succeeded_moves_to_last_entry() {
        let results = vec![result(5, true), result(8, true), result(12, true)];
        for policy in [CheckpointPolicy::SuccessfulPrefix, CheckpointPolicy::AnyCompletion] {
            assert_eq!(
                plan(policy, &SeqToken::initial(), &results),
                Some(SeqToken::from(12))
            );
        }
    }

    #[test]
    fn test_successful_prefix_stops_before_failure() {
        let results = vec![result(5, true), result(8, false), result(12, true)];
        assert_eq!(
            plan(CheckpointPolicy::SuccessfulPrefix, &SeqToken::initial(), &results),
            Some(SeqToken::from(5))
        );
    }

    #[test]
    fn test_successful_prefix_holds_when_first_entry_fails() {
        let results = vec![result(25, false)];
        assert_eq!(
            plan(CheckpointPolicy::SuccessfulPrefix, &SeqToken::from(20), &results),
            None
        );
    }

    #[test]
    fn test_any_completion_moves_past_failures() {
        let results = vec![result(25, false)];
        assert_eq!(
            plan(CheckpointPolicy::AnyCompletion, &SeqToken::from(20), &results),
            Some(SeqToken::from(25))
        );
    }

    #[test]
    fn test_never_moves_backwards() {
        let results = vec![result(3, true)];
        assert_eq!(
            plan(CheckpointPolicy::SuccessfulPrefix, &SeqToken::from(10), &results),
            None
        );
        assert_eq!(plan(CheckpointPolicy::AnyCompletion, &SeqToken::from(3), &results), None);
        assert_eq!(plan(CheckpointPolicy::AnyCompletion, &SeqToken::from(3), &[]), None);
    }

    #[tokio::test]
    async fn test_persist_advances_and_keeps_other_fields() {
        let store = MemoryStore::new();
        let mut meta = DatasetMetadata::with_checkpoint(4);
        meta.extra.insert("title".into(), "Alpha".into());
        store.add_dataset("alpha", meta);

        let manager = CheckpointManager::new(Arc::new(store.clone()), 5);
        let update = manager.persist("alpha", &SeqToken::from(12)).await.unwrap();
        assert_eq!(
            update,
            CheckpointUpdate::Advanced {
                from: Some(SeqToken::from(4)),
                to: SeqToken::from(12),
                attempts: 1
            }
        );
        let stored = store.metadata("alpha").unwrap();
        assert_eq!(stored.last_backup_seq, Some(SeqToken::from(12)));
        assert_eq!(stored.extra["title"], "Alpha");
    }

    #[tokio::test]
    async fn test_persist_does_not_regress_newer_checkpoint() {
        let store = MemoryStore::new();
        store.add_dataset("alpha", DatasetMetadata::with_checkpoint(30));

        let manager = CheckpointManager::new(Arc::new(store.clone()), 5);
        let update = manager.persist("alpha", &SeqToken::from(12)).await.unwrap();
        assert_eq!(update.checkpoint(), Some(&SeqToken::from(30)));
        assert_eq!(store.checkpoint("alpha"), Some(SeqToken::from(30)));
    }

    #[tokio::test]
    async fn test_conflict_is_retried_with_fresh_read() {
        let store = MemoryStore::new();
        store.add_dataset("alpha", DatasetMetadata::default());
        store.race_metadata_writes("alpha", 2);

        let manager = CheckpointManager::new(Arc::new(store.clone()), 5);
        let update = manager.persist("alpha", &SeqToken::from(7)).await.unwrap();
        assert!(matches!(update, CheckpointUpdate::Advanced { attempts: 3, .. }));

        // The other writer's change survived the merge
        let stored = store.metadata("alpha").unwrap();
        assert_eq!(stored.extra["touchedBy"], "other-writer");
        assert_eq!(stored.last_backup_seq, Some(SeqToken::from(7)));
    }

    #[tokio::test]
    async fn test_conflict_retries_are_bounded() {
        let store = MemoryStore::new();
        store.add_dataset("alpha", DatasetMetadata::default());
        store.race_metadata_writes("alpha", 10);

        let manager = CheckpointManager::new(Arc::new(store), 2);
        let err = manager.persist("alpha", &SeqToken::from(7)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
