//! Common test utilities for backup cycle tests

#![allow(dead_code)]

use revvault_core::backup::{CheckpointPolicy, Scheduler, SchedulerOptions};
use revvault_core::storage::{DatasetMetadata, MemoryStore};
use std::sync::Arc;
use std::time::Duration;

pub fn options(policy: CheckpointPolicy) -> SchedulerOptions {
    SchedulerOptions {
        poll_interval: Duration::from_millis(10),
        checkpoint_policy: policy,
        ..Default::default()
    }
}

/// Scheduler over `store`, which also acts as the bootstrap deployer.
pub fn scheduler(store: &MemoryStore, policy: CheckpointPolicy) -> Scheduler {
    scheduler_with(store, options(policy))
}

pub fn scheduler_with(store: &MemoryStore, options: SchedulerOptions) -> Scheduler {
    let shared = Arc::new(store.clone());
    Scheduler::new(shared.clone(), shared, options)
}

/// A dataset with an existing backup store and a checkpoint of `seq`.
pub fn dataset_at(store: &MemoryStore, id: &str, seq: Option<u64>) {
    let metadata = match seq {
        Some(seq) => DatasetMetadata::with_checkpoint(seq),
        None => DatasetMetadata::default(),
    };
    store.add_dataset(id, metadata);
    store.add_store(&format!("{}-backup", id));
}
