//! Bootstrap app deployment for new backup stores.

use super::{BootstrapDeployer, CouchStore};
use crate::config::BootstrapSettings;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

pub const DEFAULT_DOC_ID: &str = "_design/backup";

/// Minimal design document making a backup store queryable by source
/// document id. Backup keys are `<doc id>-<generation>-<hash>`.
pub fn default_design_doc() -> Value {
    json!({
        "language": "javascript",
        "views": {
            "by_document": {
                "map": "function (doc) { var parts = doc._id.split('-'); if (parts.length < 3) return; emit(parts.slice(0, -2).join('-'), parts.slice(-2).join('-')); }"
            }
        }
    })
}

/// Deploys a design document, loaded from a file or the built-in default.
pub struct DesignDocDeployer {
    store: CouchStore,
    doc_id: String,
    document: Value,
}

impl DesignDocDeployer {
    pub fn new(store: CouchStore, settings: &BootstrapSettings) -> Result<Self> {
        let document = match &settings.design_doc {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::config(format!("Cannot read design doc {}: {}", path.display(), e))
                })?;
                parse_design_doc(&raw)?
            }
            None => default_design_doc(),
        };
        Ok(Self {
            store,
            doc_id: settings.doc_id.clone(),
            document,
        })
    }
}

/// Parse a design document, dropping any `_rev` so it deploys into a fresh store.
pub fn parse_design_doc(raw: &str) -> Result<Value> {
    let mut doc: Value = serde_json::from_str(raw)?;
    let obj = doc
        .as_object_mut()
        .ok_or_else(|| Error::invalid_data("design doc must be a JSON object"))?;
    obj.remove("_rev");
    Ok(doc)
}

#[async_trait]
impl BootstrapDeployer for DesignDocDeployer {
    async fn deploy(&self, store: &str) -> Result<()> {
        info!("deploying {} into {}", self.doc_id, store);
        self.store.put_json(store, &self.doc_id, &self.document).await
    }
}
