//! Dataset enumeration.

use crate::error::{Error, Result};
use crate::storage::{Dataset, DocumentStore};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Lists the datasets known to the catalog.
pub struct DatasetEnumerator {
    store: Arc<dyn DocumentStore>,
}

impl DatasetEnumerator {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Current datasets, sorted by id. Duplicate catalog rows are dropped.
    pub async fn enumerate(&self) -> Result<Vec<Dataset>> {
        let mut datasets = self
            .store
            .list_datasets()
            .await
            .map_err(|e| Error::Enumeration(e.to_string()))?;

        datasets.sort_by(|a, b| a.id.cmp(&b.id));
        let mut seen = HashSet::new();
        datasets.retain(|d| {
            let fresh = seen.insert(d.id.clone());
            if !fresh {
                warn!("catalog lists dataset '{}' more than once, ignoring duplicate", d.id);
            }
            fresh
        });

        debug!("catalog lists {} datasets", datasets.len());
        Ok(datasets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{DatasetMetadata, MemoryStore};

    #[tokio::test]
    async fn test_enumerate_sorted() {
        let store = MemoryStore::new();
        store.add_dataset("beta", DatasetMetadata::default());
        store.add_dataset("alpha", DatasetMetadata::with_checkpoint(3));

        let enumerator = DatasetEnumerator::new(Arc::new(store));
        let datasets = enumerator.enumerate().await.unwrap();
        let ids: Vec<_> = datasets.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_catalog_failure_is_enumeration_error() {
        let store = MemoryStore::new();
        store.fail_catalog(true);
        let enumerator = DatasetEnumerator::new(Arc::new(store));
        assert!(matches!(
            enumerator.enumerate().await,
            Err(Error::Enumeration(_))
        ));
    }
}
