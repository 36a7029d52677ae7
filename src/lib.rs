//! Incremental revision backup for document stores.
//!
//! Every dataset listed in the catalog is a source store with a backup store
//! next to it. Each poll cycle copies the revisions recorded since a
//! dataset's checkpoint into its backup store under `documentId-revisionId`
//! keys, then moves the checkpoint forward.

pub mod backup;
pub mod cli;
pub mod config;
pub mod error;
pub mod sequence;
pub mod storage;

// Re-export commonly used types
pub use backup::{CycleReport, Scheduler, SchedulerOptions};
pub use error::{Error, Result};
pub use sequence::SeqToken;
pub use storage::{CouchStore, DocumentStore, MemoryStore};
