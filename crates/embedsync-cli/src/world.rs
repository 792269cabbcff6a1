//! World files
//!
//! A world file is a JSON dump of the key-value store plus the containers the
//! document service should serve:
//!
//! ```json
//! { "storage": { "usage:S1": { ... } }, "containers": [ { "id": "C1", ... } ] }
//! ```

use anyhow::{Context, Result};
use embedsync_core::{EmbedSync, ReconcileConfig};
use embedsync_model::Container;
use embedsync_store::{MemoryStorage, RecordStore, StaticDocumentService};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct WorldFile {
    #[serde(default)]
    pub(crate) storage: BTreeMap<String, Value>,
    #[serde(default)]
    pub(crate) containers: Vec<Container>,
}

impl WorldFile {
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading world file {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing world file {}", path.display()))
    }

    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        let raw = serde_json::to_string_pretty(self)?;
        std::fs::write(path, raw).with_context(|| format!("writing world file {}", path.display()))
    }
}

/// A world file loaded into memory and wired to the reconciliation subsystem
#[derive(Debug)]
pub(crate) struct World {
    storage: Arc<MemoryStorage>,
    containers: Vec<Container>,
    pub(crate) sync: EmbedSync,
}

impl World {
    pub(crate) fn open(file: WorldFile, config: ReconcileConfig) -> Self {
        let storage = Arc::new(MemoryStorage::from_entries(file.storage));
        let records = RecordStore::with_config(storage.clone(), config.store);
        let documents = Arc::new(StaticDocumentService::with_containers(file.containers.clone()));
        tracing::debug!(
            keys = storage.len(),
            containers = file.containers.len(),
            "world loaded"
        );
        Self {
            storage,
            containers: file.containers,
            sync: EmbedSync::new(records, documents, config),
        }
    }

    /// Current storage contents with the containers it was opened with
    pub(crate) fn dump(&self) -> WorldFile {
        WorldFile {
            storage: self.storage.snapshot(),
            containers: self.containers.clone(),
        }
    }
}
