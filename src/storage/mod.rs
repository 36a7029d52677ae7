//! Document store access.
//!
//! The backup engine talks to the outside world through two traits:
//! - [`DocumentStore`]: catalog listing, dataset metadata records, change
//!   feeds and revision copies between stores
//! - [`BootstrapDeployer`]: provisioning the minimal app a fresh backup store
//!   needs before revisions land in it
//!
//! [`couch::CouchStore`] implements them over HTTP, [`memory::MemoryStore`]
//! keeps everything in process.

pub mod bootstrap;
pub mod couch;
pub mod memory;

use crate::error::Result;
use crate::sequence::SeqToken;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use bootstrap::DesignDocDeployer;
pub use couch::CouchStore;
pub use memory::MemoryStore;

/// A dataset known to the catalog. Its id doubles as the source store name.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub id: String,
    pub owner: Option<String>,
    pub metadata: DatasetMetadata,
}

impl Dataset {
    pub fn new(id: impl Into<String>, metadata: DatasetMetadata) -> Self {
        Self {
            id: id.into(),
            owner: metadata.owner(),
            metadata,
        }
    }

    /// Checkpoint to resume from, `"0"` when the dataset was never backed up
    pub fn resume_from(&self) -> SeqToken {
        self.metadata.last_backup_seq.clone().unwrap_or_default()
    }
}

/// The per-dataset metadata record.
///
/// Only `lastBackupSeq` and the version token are interpreted; every other
/// field is carried through writes untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    #[serde(rename = "_rev", default, skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,

    #[serde(rename = "lastBackupSeq", default, skip_serializing_if = "Option::is_none")]
    pub last_backup_seq: Option<SeqToken>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DatasetMetadata {
    pub fn with_checkpoint(seq: impl Into<SeqToken>) -> Self {
        Self {
            last_backup_seq: Some(seq.into()),
            ..Default::default()
        }
    }

    /// Owning user, stored as `owner` (or `user` on older records)
    pub fn owner(&self) -> Option<String> {
        ["owner", "user"]
            .iter()
            .find_map(|key| self.extra.get(*key).and_then(Value::as_str))
            .map(str::to_string)
    }
}

/// One revision named by a change event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionDescriptor {
    pub rev: String,
}

/// One row of a change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub id: String,
    pub seq: SeqToken,
    #[serde(default)]
    pub changes: Vec<RevisionDescriptor>,
    #[serde(default)]
    pub deleted: bool,
}

impl ChangeEntry {
    pub fn new(id: impl Into<String>, seq: impl Into<SeqToken>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            seq: seq.into(),
            changes: vec![RevisionDescriptor { rev: rev.into() }],
            deleted: false,
        }
    }

    /// The revision this change is backed up as (the first descriptor).
    pub fn revision(&self) -> Option<&str> {
        self.changes.first().map(|c| c.rev.as_str())
    }
}

/// Changes returned by one feed query, ascending by sequence.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeBatch {
    pub entries: Vec<ChangeEntry>,
    /// The feed's own notion of where it stopped
    pub last_seq: Option<SeqToken>,
}

impl ChangeBatch {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Result of writing one revision into a backup store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Created,
    /// The revision key was already present; nothing changed.
    AlreadyPresent,
}

/// Key a revision is stored under in the backup store.
pub fn revision_key(doc_id: &str, rev: &str) -> String {
    format!("{}-{}", doc_id, rev)
}

/// Name of the backup store for a dataset.
pub fn backup_store_name(dataset_id: &str, suffix: &str) -> String {
    format!("{}{}", dataset_id, suffix)
}

/// Access to source stores, backup stores and the dataset catalog.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// List every dataset in the catalog with its metadata record
    async fn list_datasets(&self) -> Result<Vec<Dataset>>;

    /// Read a dataset's metadata record, including its version token
    async fn read_metadata(&self, dataset_id: &str) -> Result<DatasetMetadata>;

    /// Write a metadata record guarded by `metadata.rev`.
    ///
    /// Returns the new version token, or [`Error::Conflict`] when the record
    /// was changed since `metadata.rev` was read.
    ///
    /// [`Error::Conflict`]: crate::error::Error::Conflict
    async fn write_metadata(&self, dataset_id: &str, metadata: &DatasetMetadata) -> Result<String>;

    /// Lightweight presence probe
    async fn store_exists(&self, store: &str) -> Result<bool>;

    /// Create a store; succeeds if it already exists
    async fn create_store(&self, store: &str) -> Result<()>;

    /// Changes recorded after `since`, ascending by sequence
    async fn changes_since(
        &self,
        store: &str,
        since: &SeqToken,
        limit: Option<usize>,
    ) -> Result<ChangeBatch>;

    /// Revisions of a document still available in the store, newest first
    async fn list_revisions(&self, store: &str, doc_id: &str) -> Result<Vec<String>>;

    /// Copy one revision, attachments included, from `source` into `target`
    /// under `target_key`
    async fn copy_revision(
        &self,
        source: &str,
        doc_id: &str,
        rev: &str,
        target: &str,
        target_key: &str,
    ) -> Result<WriteOutcome>;
}

/// Deploys the bootstrap application into a freshly created backup store.
#[async_trait]
pub trait BootstrapDeployer: Send + Sync {
    async fn deploy(&self, store: &str) -> Result<()>;
}
