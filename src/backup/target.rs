//! Backup target resolution.
//!
//! Every cycle, each dataset's backup store is probed. A missing store is
//! created and receives the bootstrap app before any revision is copied:
//!
//! ```text
//! CheckExistence -> Exists                                -> proceed
//! CheckExistence -> Missing -> Created (create) -> Deployed (bootstrap) -> proceed
//! ```

use crate::error::{Error, Result};
use crate::storage::{backup_store_name, BootstrapDeployer, DocumentStore};
use std::sync::Arc;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    CheckExistence,
    Exists,
    Missing,
    Created,
    Deployed,
}

/// A backup store ready to receive revisions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub name: String,
    /// `Exists`, or `Deployed` when the store was provisioned this cycle
    pub state: TargetState,
}

pub struct TargetResolver {
    store: Arc<dyn DocumentStore>,
    deployer: Arc<dyn BootstrapDeployer>,
    suffix: String,
}

impl TargetResolver {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        deployer: Arc<dyn BootstrapDeployer>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            deployer,
            suffix: suffix.into(),
        }
    }

    pub fn target_name(&self, dataset_id: &str) -> String {
        backup_store_name(dataset_id, &self.suffix)
    }

    pub async fn resolve(&self, dataset_id: &str) -> Result<ResolvedTarget> {
        let name = self.target_name(dataset_id);
        let mut state = TargetState::CheckExistence;

        loop {
            state = match state {
                TargetState::CheckExistence => match self.store.store_exists(&name).await {
                    Ok(true) => TargetState::Exists,
                    Ok(false) => TargetState::Missing,
                    Err(e) => {
                        debug!("probe of {} failed ({}), treating as missing", name, e);
                        TargetState::Missing
                    }
                },
                TargetState::Missing => {
                    info!("creating backup store {}", name);
                    if let Err(e) = self.store.create_store(&name).await {
                        error!("cannot create backup store {}: {}", name, e);
                        return Err(Error::TargetCreation {
                            store: name,
                            reason: e.to_string(),
                        });
                    }
                    TargetState::Created
                }
                TargetState::Created => {
                    if let Err(e) = self.deployer.deploy(&name).await {
                        error!("bootstrap deployment into {} failed: {}", name, e);
                        return Err(Error::Bootstrap {
                            store: name,
                            reason: e.to_string(),
                        });
                    }
                    TargetState::Deployed
                }
                TargetState::Exists | TargetState::Deployed => {
                    return Ok(ResolvedTarget { name, state });
                }
            };
        }
    }
}
