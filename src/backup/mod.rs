//! Incremental backup engine.
//!
//! Components, leaves first:
//! - [`enumerator`]: lists datasets from the catalog
//! - [`target`]: makes sure each dataset's backup store exists and is bootstrapped
//! - [`feed`]: reads changes since a dataset's checkpoint
//! - [`copier`]: copies the revisions named by those changes
//! - [`checkpoint`]: decides and stores how far a dataset is backed up
//! - [`scheduler`]: runs all of the above for every dataset, cycle after cycle

pub mod checkpoint;
pub mod copier;
pub mod enumerator;
pub mod feed;
pub mod scheduler;
pub mod target;

pub use checkpoint::{CheckpointManager, CheckpointPolicy, CheckpointUpdate};
pub use copier::{BatchOutcome, CopyOutcome, EntryResult, RevisionCopier, RevisionMode};
pub use enumerator::DatasetEnumerator;
pub use feed::ChangeFeedReader;
pub use scheduler::{
    CycleReport, DatasetReport, DatasetState, DatasetStatus, Scheduler, SchedulerOptions,
};
pub use target::{ResolvedTarget, TargetResolver, TargetState};
