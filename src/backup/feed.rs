//! Change feed reading.

use crate::error::{Error, Result};
use crate::sequence::SeqToken;
use crate::storage::{ChangeBatch, DocumentStore};
use std::sync::Arc;
use tracing::{debug, warn};

/// Reads the changes a dataset recorded after its checkpoint.
pub struct ChangeFeedReader {
    store: Arc<dyn DocumentStore>,
    limit: Option<usize>,
}

impl ChangeFeedReader {
    pub fn new(store: Arc<dyn DocumentStore>, limit: Option<usize>) -> Self {
        Self { store, limit }
    }

    /// Changes after `since`, ascending by sequence. Entries without a
    /// revision are dropped but still count toward `last_seq`, so a window
    /// made only of such entries can be checkpointed past.
    pub async fn read(&self, dataset_id: &str, since: &SeqToken) -> Result<ChangeBatch> {
        let mut batch = self
            .store
            .changes_since(dataset_id, since, self.limit)
            .await
            .map_err(|e| Error::ChangeFeed {
                dataset: dataset_id.to_string(),
                reason: e.to_string(),
            })?;

        if let Some(highest) = batch.entries.iter().map(|e| &e.seq).max() {
            if batch.last_seq.as_ref().map_or(true, |last| last < highest) {
                batch.last_seq = Some(highest.clone());
            }
        }

        batch.entries.retain(|entry| {
            if entry.changes.is_empty() {
                warn!("change {} for {} lists no revision, skipping", entry.seq, entry.id);
                return false;
            }
            true
        });

        if !batch.entries.windows(2).all(|w| w[0].seq <= w[1].seq) {
            warn!("change feed for {} is out of order, sorting", dataset_id);
            batch.entries.sort_by(|a, b| a.seq.cmp(&b.seq));
        }

        if let Some(limit) = self.limit {
            if batch.len() >= limit {
                debug!(
                    "{}: batch capped at {} changes, feed stopped at {:?}",
                    dataset_id, limit, batch.last_seq
                );
            }
        }

        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_reads_from_checkpoint() {
        let store = MemoryStore::new();
        store.add_store("alpha");
        store.put_document_at("alpha", "A", 5, json!({}));
        store.put_document_at("alpha", "B", 8, json!({}));
        store.put_document_at("alpha", "C", 12, json!({}));

        let reader = ChangeFeedReader::new(Arc::new(store), None);
        let batch = reader.read("alpha", &SeqToken::from(5)).await.unwrap();
        let seqs: Vec<_> = batch.entries.iter().map(|e| e.seq.clone()).collect();
        assert_eq!(seqs, vec![SeqToken::from(8), SeqToken::from(12)]);
    }

    #[tokio::test]
    async fn test_idle_dataset_yields_empty_batch() {
        let store = MemoryStore::new();
        store.add_store("alpha");
        let reader = ChangeFeedReader::new(Arc::new(store), None);
        let batch = reader.read("alpha", &SeqToken::initial()).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_limit_caps_batch() {
        let store = MemoryStore::new();
        for id in ["A", "B", "C"] {
            store.put_document("alpha", id, json!({}));
        }
        let reader = ChangeFeedReader::new(Arc::new(store), Some(2));
        let batch = reader.read("alpha", &SeqToken::initial()).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.last_seq, Some(SeqToken::from(2)));
    }

    #[tokio::test]
    async fn test_revisionless_entries_are_dropped_but_counted() {
        let store = MemoryStore::new();
        store.put_document_at("alpha", "A", 1, json!({}));
        store.put_bare_change("alpha", "ghost", 2);

        let reader = ChangeFeedReader::new(Arc::new(store), None);
        let batch = reader.read("alpha", &SeqToken::initial()).await.unwrap();
        let ids: Vec<_> = batch.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["A"]);
        assert_eq!(batch.last_seq, Some(SeqToken::from(2)));
    }

    #[tokio::test]
    async fn test_feed_failure_is_dataset_scoped_error() {
        let store = MemoryStore::new();
        store.add_store("alpha");
        store.fail_changes("alpha", true);
        let reader = ChangeFeedReader::new(Arc::new(store), None);
        let err = reader.read("alpha", &SeqToken::initial()).await.unwrap_err();
        assert!(matches!(err, Error::ChangeFeed { ref dataset, .. } if dataset == "alpha"));
    }
}
