//! In-process document store.
//!
//! Mirrors the semantics the backup engine relies on from a real server:
//! per-document revisions, a change feed that collapses to the latest change
//! per document, versioned metadata records, and conflict-on-existing writes.
//! Faults (failing probes, creations, feeds and copies, blocked copies and
//! metadata races) can be injected so engine behavior is observable under
//! failure. Every call is appended to a log readable through [`MemoryStore::calls`].

use super::{
    BootstrapDeployer, ChangeBatch, ChangeEntry, Dataset, DatasetMetadata, DocumentStore,
    RevisionDescriptor, WriteOutcome,
};
use crate::error::{Error, Result};
use crate::sequence::SeqToken;
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

/// A call observed by the store, in issue order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    ListDatasets,
    ReadMetadata(String),
    WriteMetadata(String),
    Probe(String),
    Create(String),
    Deploy(String),
    Changes { store: String, since: String },
    ListRevisions { store: String, doc_id: String },
    Copy { source: String, target: String, key: String },
}

#[derive(Debug, Clone)]
struct StoredRevision {
    rev: String,
    body: Value,
}

#[derive(Debug, Default)]
struct StoreState {
    /// doc id -> revisions, oldest first
    docs: BTreeMap<String, Vec<StoredRevision>>,
    log: Vec<ChangeEntry>,
    next_seq: u64,
}

#[derive(Debug, Clone)]
struct MetadataRecord {
    generation: u64,
    metadata: DatasetMetadata,
}

#[derive(Default)]
struct Faults {
    catalog: bool,
    probes: HashSet<String>,
    creations: HashSet<String>,
    feeds: HashSet<String>,
    /// (source store, doc id)
    revision_lists: HashSet<(String, String)>,
    /// (source store, doc id) -> retryable
    copies: HashMap<(String, String), bool>,
    metadata_races: HashMap<String, usize>,
    gates: HashMap<String, watch::Receiver<bool>>,
}

#[derive(Default)]
struct Inner {
    catalog: BTreeMap<String, MetadataRecord>,
    stores: HashMap<String, StoreState>,
    faults: Faults,
    calls: Vec<StoreCall>,
}

/// Holds copies out of a source store until released.
pub struct CopyGate {
    tx: watch::Sender<bool>,
}

impl CopyGate {
    pub fn release(&self) {
        let _ = self.tx.send(true);
    }
}

/// In-memory [`DocumentStore`] and [`BootstrapDeployer`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

fn not_found(what: &str) -> Error {
    Error::Status {
        status: StatusCode::NOT_FOUND,
        url: format!("memory://{}", what),
        body: r#"{"error":"not_found","reason":"missing"}"#.to_string(),
    }
}

fn unavailable(what: &str) -> Error {
    Error::Status {
        status: StatusCode::SERVICE_UNAVAILABLE,
        url: format!("memory://{}", what),
        body: "injected failure".to_string(),
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a dataset with an empty source store.
    pub fn add_dataset(&self, id: &str, metadata: DatasetMetadata) {
        let mut inner = self.inner.lock();
        let mut metadata = metadata;
        metadata.rev = Some("1-init".to_string());
        inner.catalog.insert(
            id.to_string(),
            MetadataRecord {
                generation: 1,
                metadata,
            },
        );
        inner.stores.entry(id.to_string()).or_default();
    }

    pub fn add_store(&self, name: &str) {
        self.inner.lock().stores.entry(name.to_string()).or_default();
    }

    /// Write a new revision of a document, recording a change at the next
    /// sequence. Returns the new revision id.
    pub fn put_document(&self, store: &str, doc_id: &str, body: Value) -> String {
        let mut inner = self.inner.lock();
        let state = inner.stores.entry(store.to_string()).or_default();
        state.next_seq += 1;
        let seq = state.next_seq;
        Self::record(state, doc_id, seq, body)
    }

    /// Write a new revision recorded at an explicit sequence number.
    pub fn put_document_at(&self, store: &str, doc_id: &str, seq: u64, body: Value) -> String {
        let mut inner = self.inner.lock();
        let state = inner.stores.entry(store.to_string()).or_default();
        state.next_seq = state.next_seq.max(seq);
        Self::record(state, doc_id, seq, body)
    }

    fn record(state: &mut StoreState, doc_id: &str, seq: u64, body: Value) -> String {
        let revisions = state.docs.entry(doc_id.to_string()).or_default();
        let generation = revisions.len() + 1;
        let rev = format!("{}-{:08x}", generation, seq.wrapping_mul(0x9e37_79b9));
        revisions.push(StoredRevision {
            rev: rev.clone(),
            body,
        });
        state.log.push(ChangeEntry {
            id: doc_id.to_string(),
            seq: SeqToken::from(seq),
            changes: vec![RevisionDescriptor { rev: rev.clone() }],
            deleted: false,
        });
        rev
    }

    pub fn store_exists_now(&self, name: &str) -> bool {
        self.inner.lock().stores.contains_key(name)
    }

    /// Keys present in a store, sorted
    pub fn document_ids(&self, store: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .lock()
            .stores
            .get(store)
            .map(|s| s.docs.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Latest body of a document
    pub fn document(&self, store: &str, doc_id: &str) -> Option<Value> {
        let inner = self.inner.lock();
        inner
            .stores
            .get(store)?
            .docs
            .get(doc_id)?
            .last()
            .map(|r| r.body.clone())
    }

    pub fn checkpoint(&self, dataset: &str) -> Option<SeqToken> {
        self.inner
            .lock()
            .catalog
            .get(dataset)
            .and_then(|r| r.metadata.last_backup_seq.clone())
    }

    pub fn metadata(&self, dataset: &str) -> Option<DatasetMetadata> {
        self.inner
            .lock()
            .catalog
            .get(dataset)
            .map(|r| r.metadata.clone())
    }

    /// Every call observed so far
    pub fn calls(&self) -> Vec<StoreCall> {
        self.inner.lock().calls.clone()
    }

    pub fn copy_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, StoreCall::Copy { .. }))
            .count()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    pub fn fail_catalog(&self, fail: bool) {
        self.inner.lock().faults.catalog = fail;
    }

    pub fn fail_probe(&self, store: &str) {
        self.inner.lock().faults.probes.insert(store.to_string());
    }

    pub fn fail_creation(&self, store: &str) {
        self.inner.lock().faults.creations.insert(store.to_string());
    }

    pub fn fail_changes(&self, store: &str, fail: bool) {
        let mut inner = self.inner.lock();
        if fail {
            inner.faults.feeds.insert(store.to_string());
        } else {
            inner.faults.feeds.remove(store);
        }
    }

    /// Make copies of `doc_id` out of `source` fail until cleared.
    pub fn fail_copy(&self, source: &str, doc_id: &str, retryable: bool) {
        self.inner
            .lock()
            .faults
            .copies
            .insert((source.to_string(), doc_id.to_string()), retryable);
    }

    pub fn clear_copy_failures(&self) {
        self.inner.lock().faults.copies.clear();
    }

    /// Make revision listings of a document fail.
    pub fn fail_revision_list(&self, store: &str, doc_id: &str) {
        self.inner
            .lock()
            .faults
            .revision_lists
            .insert((store.to_string(), doc_id.to_string()));
    }

    /// Record a change at `seq` that names no revision.
    pub fn put_bare_change(&self, store: &str, doc_id: &str, seq: u64) {
        let mut inner = self.inner.lock();
        let state = inner.stores.entry(store.to_string()).or_default();
        state.next_seq = state.next_seq.max(seq);
        state.log.push(ChangeEntry {
            id: doc_id.to_string(),
            seq: SeqToken::from(seq),
            changes: Vec::new(),
            deleted: false,
        });
    }

    /// Simulate another writer touching the metadata record right before
    /// each of the next `times` checkpoint writes.
    pub fn race_metadata_writes(&self, dataset: &str, times: usize) {
        self.inner
            .lock()
            .faults
            .metadata_races
            .insert(dataset.to_string(), times);
    }

    /// Hold every copy out of `source` until the gate is released.
    pub fn block_copies(&self, source: &str) -> CopyGate {
        let (tx, rx) = watch::channel(false);
        self.inner
            .lock()
            .faults
            .gates
            .insert(source.to_string(), rx);
        CopyGate { tx }
    }

    fn log(&self, call: StoreCall) {
        self.inner.lock().calls.push(call);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        let datasets = {
            let mut inner = self.inner.lock();
            inner.calls.push(StoreCall::ListDatasets);
            if inner.faults.catalog {
                return Err(unavailable("catalog"));
            }
            inner
                .catalog
                .iter()
                .map(|(id, record)| Dataset::new(id.clone(), record.metadata.clone()))
                .collect()
        };
        Ok(datasets)
    }

    async fn read_metadata(&self, dataset_id: &str) -> Result<DatasetMetadata> {
        let mut inner = self.inner.lock();
        inner
            .calls
            .push(StoreCall::ReadMetadata(dataset_id.to_string()));
        inner
            .catalog
            .get(dataset_id)
            .map(|r| r.metadata.clone())
            .ok_or_else(|| not_found(dataset_id))
    }

    async fn write_metadata(&self, dataset_id: &str, metadata: &DatasetMetadata) -> Result<String> {
        let mut inner = self.inner.lock();
        inner
            .calls
            .push(StoreCall::WriteMetadata(dataset_id.to_string()));

        let raced = match inner.faults.metadata_races.get_mut(dataset_id) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        };

        let record = inner
            .catalog
            .get_mut(dataset_id)
            .ok_or_else(|| not_found(dataset_id))?;

        if raced {
            record.generation += 1;
            record.metadata.rev = Some(format!("{}-other", record.generation));
            record
                .metadata
                .extra
                .insert("touchedBy".to_string(), json!("other-writer"));
        }

        if record.metadata.rev != metadata.rev {
            return Err(Error::Conflict(dataset_id.to_string()));
        }

        record.generation += 1;
        let rev = format!("{}-vault", record.generation);
        let mut stored = metadata.clone();
        stored.rev = Some(rev.clone());
        record.metadata = stored;
        Ok(rev)
    }

    async fn store_exists(&self, store: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.calls.push(StoreCall::Probe(store.to_string()));
        if inner.faults.probes.contains(store) {
            return Err(unavailable(store));
        }
        Ok(inner.stores.contains_key(store))
    }

    async fn create_store(&self, store: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(StoreCall::Create(store.to_string()));
        if inner.faults.creations.contains(store) {
            return Err(Error::Status {
                status: StatusCode::FORBIDDEN,
                url: format!("memory://{}", store),
                body: "injected failure".to_string(),
            });
        }
        inner.stores.entry(store.to_string()).or_default();
        Ok(())
    }

    async fn changes_since(
        &self,
        store: &str,
        since: &SeqToken,
        limit: Option<usize>,
    ) -> Result<ChangeBatch> {
        let mut inner = self.inner.lock();
        inner.calls.push(StoreCall::Changes {
            store: store.to_string(),
            since: since.to_string(),
        });
        if inner.faults.feeds.contains(store) {
            return Err(unavailable(store));
        }
        let state = inner.stores.get(store).ok_or_else(|| not_found(store))?;

        // Latest change per document, like a real feed
        let mut latest: HashMap<&str, &ChangeEntry> = HashMap::new();
        for entry in &state.log {
            latest.insert(entry.id.as_str(), entry);
        }
        let mut entries: Vec<ChangeEntry> = latest
            .into_values()
            .filter(|e| e.seq > *since)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.seq.cmp(&b.seq));
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        let last_seq = entries.last().map(|e| e.seq.clone());
        Ok(ChangeBatch { entries, last_seq })
    }

    async fn list_revisions(&self, store: &str, doc_id: &str) -> Result<Vec<String>> {
        let mut inner = self.inner.lock();
        inner.calls.push(StoreCall::ListRevisions {
            store: store.to_string(),
            doc_id: doc_id.to_string(),
        });
        if inner
            .faults
            .revision_lists
            .contains(&(store.to_string(), doc_id.to_string()))
        {
            return Err(unavailable(doc_id));
        }
        let revisions = inner
            .stores
            .get(store)
            .and_then(|s| s.docs.get(doc_id))
            .ok_or_else(|| not_found(doc_id))?;
        Ok(revisions.iter().rev().map(|r| r.rev.clone()).collect())
    }

    async fn copy_revision(
        &self,
        source: &str,
        doc_id: &str,
        rev: &str,
        target: &str,
        target_key: &str,
    ) -> Result<WriteOutcome> {
        let gate = {
            let mut inner = self.inner.lock();
            inner.calls.push(StoreCall::Copy {
                source: source.to_string(),
                target: target.to_string(),
                key: target_key.to_string(),
            });
            inner.faults.gates.get(source).cloned()
        };

        if let Some(mut gate) = gate {
            while !*gate.borrow_and_update() {
                if gate.changed().await.is_err() {
                    break;
                }
            }
        }

        let mut inner = self.inner.lock();
        if let Some(retryable) = inner
            .faults
            .copies
            .get(&(source.to_string(), doc_id.to_string()))
        {
            return Err(if *retryable {
                unavailable(doc_id)
            } else {
                not_found(doc_id)
            });
        }

        let body = inner
            .stores
            .get(source)
            .and_then(|s| s.docs.get(doc_id))
            .and_then(|revs| revs.iter().find(|r| r.rev == rev))
            .map(|r| r.body.clone())
            .ok_or_else(|| not_found(&format!("{}/{}?rev={}", source, doc_id, rev)))?;

        let target_state = inner.stores.get_mut(target).ok_or_else(|| not_found(target))?;
        if target_state.docs.contains_key(target_key) {
            return Ok(WriteOutcome::AlreadyPresent);
        }
        target_state.docs.insert(
            target_key.to_string(),
            vec![StoredRevision {
                rev: rev.to_string(),
                body,
            }],
        );
        Ok(WriteOutcome::Created)
    }
}

#[async_trait]
impl BootstrapDeployer for MemoryStore {
    async fn deploy(&self, store: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.calls.push(StoreCall::Deploy(store.to_string()));
        let state = inner.stores.get_mut(store).ok_or_else(|| not_found(store))?;
        state.docs.insert(
            "_design/backup".to_string(),
            vec![StoredRevision {
                rev: "1-bootstrap".to_string(),
                body: json!({ "views": {} }),
            }],
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_feed_collapses_to_latest_change_per_document() {
        let store = MemoryStore::new();
        store.add_store("alpha");
        store.put_document("alpha", "A", json!({"v": 1}));
        store.put_document("alpha", "B", json!({"v": 1}));
        let latest = store.put_document("alpha", "A", json!({"v": 2}));

        let batch = store
            .changes_since("alpha", &SeqToken::initial(), None)
            .await
            .unwrap();
        let ids: Vec<_> = batch.entries.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["B", "A"]);
        assert_eq!(batch.entries[1].revision(), Some(latest.as_str()));
        assert_eq!(batch.last_seq, Some(SeqToken::from(3)));
    }

    #[tokio::test]
    async fn test_versioned_metadata_write_detects_stale_rev() {
        let store = MemoryStore::new();
        store.add_dataset("alpha", DatasetMetadata::default());

        let mut meta = store.read_metadata("alpha").await.unwrap();
        meta.last_backup_seq = Some(SeqToken::from(3));
        store.write_metadata("alpha", &meta).await.unwrap();

        // Same stale rev again
        let err = store.write_metadata("alpha", &meta).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_copy_into_existing_key_is_noop() {
        let store = MemoryStore::new();
        store.add_store("alpha");
        store.add_store("alpha-backup");
        let rev = store.put_document("alpha", "A", json!({"v": 1}));

        let first = store
            .copy_revision("alpha", "A", &rev, "alpha-backup", "A-x")
            .await
            .unwrap();
        let second = store
            .copy_revision("alpha", "A", &rev, "alpha-backup", "A-x")
            .await
            .unwrap();
        assert_eq!(first, WriteOutcome::Created);
        assert_eq!(second, WriteOutcome::AlreadyPresent);
        assert_eq!(store.document_ids("alpha-backup"), vec!["A-x".to_string()]);
    }
}
