//! Append-only version history
//!
//! Every snapshot is an immutable `version:<entityKey>#<ulid>` record. ULIDs
//! come from a monotonic generator, so key order is creation order and the
//! newest snapshot of an entity is the last key under its prefix.

use crate::error::{VersionError, VersionResult};
use chrono::{DateTime, Duration, Utc};
use embedsync_model::{ChangeType, ContentHash, VersionId, VersionSnapshot, VersionSummary};
use embedsync_store::RecordStore;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use ulid::{Generator, Ulid};

/// Who changed an entity and how
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionMeta {
    pub change_type: ChangeType,
    pub changed_by: String,
}

impl VersionMeta {
    /// Create metadata
    #[inline]
    #[must_use]
    pub fn new(change_type: ChangeType, changed_by: impl Into<String>) -> Self {
        Self {
            change_type,
            changed_by: changed_by.into(),
        }
    }

    /// Metadata for an update
    #[inline]
    #[must_use]
    pub fn update(changed_by: impl Into<String>) -> Self {
        Self::new(ChangeType::Update, changed_by)
    }

    /// Metadata for a deletion
    #[inline]
    #[must_use]
    pub fn delete(changed_by: impl Into<String>) -> Self {
        Self::new(ChangeType::Delete, changed_by)
    }
}

/// Result of [`VersionManager::save_version`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    /// New snapshot written
    Saved(VersionId),
    /// Data matched the latest snapshot, which is returned
    Skipped(VersionId),
}

impl SaveOutcome {
    /// Id of the snapshot holding the data
    #[inline]
    #[must_use]
    pub fn version_id(&self) -> &VersionId {
        match self {
            Self::Saved(id) | Self::Skipped(id) => id,
        }
    }

    /// Consume into the snapshot id
    #[inline]
    #[must_use]
    pub fn into_version_id(self) -> VersionId {
        match self {
            Self::Saved(id) | Self::Skipped(id) => id,
        }
    }

    /// True when no new snapshot was written
    #[inline]
    #[must_use]
    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }
}

/// Result of [`VersionManager::restore_version`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReceipt {
    /// Live key that was overwritten
    pub storage_key: String,
    /// Snapshot of the value that was live before the restore
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_version_id: Option<VersionId>,
}

/// Result of a retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PruneReport {
    pub pruned_count: usize,
    pub skipped_count: usize,
    pub errors: Vec<String>,
}

/// Per-entity snapshot log over a [`RecordStore`]
pub struct VersionManager {
    records: RecordStore,
    ids: Mutex<Generator>,
}

impl std::fmt::Debug for VersionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionManager")
            .field("records", &self.records)
            .finish_non_exhaustive()
    }
}

impl VersionManager {
    /// Create manager
    #[must_use]
    pub fn new(records: RecordStore) -> Self {
        Self {
            records,
            ids: Mutex::new(Generator::new()),
        }
    }

    /// Snapshot `data` unless it matches the latest snapshot of `entity_key`
    ///
    /// # Errors
    /// Returns error when hashing or the store fails. Callers on a
    /// destructive path normally use [`VersionManager::snapshot_before_write`].
    pub async fn save_version(
        &self,
        entity_key: &str,
        data: &Value,
        meta: &VersionMeta,
    ) -> VersionResult<SaveOutcome> {
        let content_hash = ContentHash::compute_canonical(data)?;
        if let Some(latest) = self.latest(entity_key).await? {
            if latest.content_hash == content_hash {
                tracing::debug!(entity_key, version = %latest.version_id, "snapshot unchanged, skipping");
                return Ok(SaveOutcome::Skipped(latest.version_id));
            }
        }

        let version_id = VersionId::new(entity_key, self.next_ulid());
        let snapshot = VersionSnapshot {
            version_id: version_id.clone(),
            entity_key: entity_key.to_string(),
            data: data.clone(),
            change_type: meta.change_type,
            timestamp: Utc::now(),
            changed_by: meta.changed_by.clone(),
            content_hash,
            size: serde_json::to_vec(data)?.len(),
        };
        self.records.save(&version_id, &snapshot).await?;

        tracing::debug!(entity_key, version = %version_id, change = ?meta.change_type, "saved version");
        Ok(SaveOutcome::Saved(version_id))
    }

    /// Best-effort snapshot; failures are logged and yield `None`
    pub async fn snapshot_before_write(
        &self,
        entity_key: &str,
        data: &Value,
        meta: &VersionMeta,
    ) -> Option<VersionId> {
        match self.save_version(entity_key, data, meta).await {
            Ok(outcome) => Some(outcome.into_version_id()),
            Err(e) => {
                tracing::warn!(entity_key, error = %e, "version snapshot failed, continuing");
                None
            }
        }
    }

    /// Snapshot metadata for an entity, newest first
    ///
    /// # Errors
    /// Returns error on store failure
    pub async fn list_versions(&self, entity_key: &str) -> VersionResult<Vec<VersionSummary>> {
        let mut scan = self.history(entity_key).await?;
        scan.reverse();
        Ok(scan.iter().map(VersionSnapshot::summary).collect())
    }

    /// Full snapshot by id
    ///
    /// # Errors
    /// - `VersionError::NotFound` if no snapshot has this id
    /// - `VersionError::Store` on store failure
    pub async fn get_version(&self, version_id: &VersionId) -> VersionResult<VersionSnapshot> {
        self.records
            .load::<VersionSnapshot>(version_id)
            .await?
            .ok_or_else(|| VersionError::NotFound(version_id.clone()))
    }

    /// Write a snapshot's data back to its live key
    ///
    /// The current live value, if any, is snapshotted first.
    ///
    /// # Errors
    /// - `VersionError::NotFound` if no snapshot has this id
    /// - `VersionError::Store` if the data no longer validates or the store fails
    pub async fn restore_version(
        &self,
        version_id: &VersionId,
        changed_by: &str,
    ) -> VersionResult<RestoreReceipt> {
        let snapshot = self.get_version(version_id).await?;
        let storage_key = snapshot.entity_key;

        let backup_version_id = match self.records.get_raw(&storage_key).await? {
            Some(current) => {
                self.snapshot_before_write(&storage_key, &current, &VersionMeta::update(changed_by))
                    .await
            }
            None => None,
        };

        self.records.put_raw(&storage_key, snapshot.data).await?;
        tracing::info!(key = %storage_key, version = %version_id, "restored version");

        Ok(RestoreReceipt {
            storage_key,
            backup_version_id,
        })
    }

    /// Delete snapshots older than `retention_days`
    ///
    /// # Errors
    /// Returns error only when the snapshot scan itself fails
    pub async fn prune_expired_versions(&self, retention_days: u32) -> VersionResult<PruneReport> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        self.prune_older_than(cutoff).await
    }

    /// Delete snapshots taken before `cutoff`; per-item failures are collected
    ///
    /// # Errors
    /// Returns error only when the snapshot scan itself fails
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> VersionResult<PruneReport> {
        let scan = self.records.scan::<VersionSnapshot>().await?;
        let mut report = PruneReport::default();

        for rejected in scan.rejected {
            report.errors.push(format!("{}: {}", rejected.key, rejected.reason));
        }

        for (id, snapshot) in scan.records {
            if snapshot.timestamp >= cutoff {
                report.skipped_count += 1;
                continue;
            }
            match self.records.remove::<VersionSnapshot>(&id).await {
                Ok(()) => report.pruned_count += 1,
                Err(e) => report.errors.push(format!("{id}: {e}")),
            }
        }

        tracing::info!(
            pruned = report.pruned_count,
            kept = report.skipped_count,
            errors = report.errors.len(),
            "version retention pass finished"
        );
        Ok(report)
    }

    async fn latest(&self, entity_key: &str) -> VersionResult<Option<VersionSnapshot>> {
        Ok(self.history(entity_key).await?.pop())
    }

    /// Oldest first
    async fn history(&self, entity_key: &str) -> VersionResult<Vec<VersionSnapshot>> {
        let scan = self
            .records
            .scan_with::<VersionSnapshot>(&format!("{entity_key}#"))
            .await?;
        Ok(scan.into_records())
    }

    fn next_ulid(&self) -> Ulid {
        self.ids.lock().generate().unwrap_or_else(|_| Ulid::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedsync_store::MemoryStorage;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    fn manager() -> (RecordStore, VersionManager) {
        let records = RecordStore::new(Arc::new(MemoryStorage::new()));
        (records.clone(), VersionManager::new(records))
    }

    fn config(var: &str) -> Value {
        json!({
            "sourceId": "S1",
            "variableValues": {"customer": var},
            "updatedAt": "2026-01-01T00:00:00Z"
        })
    }

    #[test]
    fn debug_output_omits_id_generator() {
        let (_, versions) = manager();
        let rendered = format!("{versions:?}");
        assert!(rendered.starts_with("VersionManager"));
        assert!(!rendered.contains("ids:"));
    }

    #[tokio::test]
    async fn identical_data_is_skipped() {
        let (records, versions) = manager();
        let meta = VersionMeta::update("tester");

        let first = versions.save_version("macro-vars:E1", &config("acme"), &meta).await.unwrap();
        let second = versions.save_version("macro-vars:E1", &config("acme"), &meta).await.unwrap();

        assert!(!first.is_skipped());
        assert!(second.is_skipped());
        assert_eq!(first.version_id(), second.version_id());
        assert_eq!(records.scan::<VersionSnapshot>().await.unwrap().records.len(), 1);
    }

    #[tokio::test]
    async fn history_is_newest_first_and_per_entity() {
        let (_, versions) = manager();
        let meta = VersionMeta::update("tester");
        versions.save_version("macro-vars:E1", &config("a"), &meta).await.unwrap();
        versions.save_version("macro-vars:E1", &config("b"), &meta).await.unwrap();
        versions.save_version("macro-vars:E10", &config("c"), &meta).await.unwrap();

        let history = versions.list_versions("macro-vars:E1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].version_id > history[1].version_id);

        let latest = versions.get_version(&history[0].version_id).await.unwrap();
        assert_eq!(latest.data["variableValues"]["customer"], "b");
    }

    #[tokio::test]
    async fn restore_snapshots_current_value_first() {
        let (records, versions) = manager();
        let meta = VersionMeta::update("tester");
        let saved = versions.save_version("macro-vars:E1", &config("old"), &meta).await.unwrap();
        records.put_raw("macro-vars:E1", config("new")).await.unwrap();

        let receipt = versions.restore_version(saved.version_id(), "tester").await.unwrap();
        assert_eq!(receipt.storage_key, "macro-vars:E1");

        let backup = versions
            .get_version(receipt.backup_version_id.as_ref().unwrap())
            .await
            .unwrap();
        assert_eq!(backup.data, config("new"));
        assert_eq!(records.get_raw("macro-vars:E1").await.unwrap(), Some(config("old")));
    }

    #[tokio::test]
    async fn missing_version_is_not_found() {
        let (_, versions) = manager();
        let id = VersionId::new("macro-vars:E1", Ulid::new());
        let err = versions.get_version(&id).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn prune_respects_cutoff() {
        let (_, versions) = manager();
        let meta = VersionMeta::update("tester");
        versions.save_version("macro-vars:E1", &config("a"), &meta).await.unwrap();
        versions.save_version("macro-vars:E2", &config("b"), &meta).await.unwrap();

        let kept = versions.prune_expired_versions(14).await.unwrap();
        assert_eq!((kept.pruned_count, kept.skipped_count), (0, 2));

        let pruned = versions
            .prune_older_than(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned.pruned_count, 2);
        assert!(pruned.errors.is_empty());
        assert!(versions.list_versions("macro-vars:E1").await.unwrap().is_empty());
    }
}
