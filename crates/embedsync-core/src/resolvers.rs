//! Recovery resolvers
//!
//! Thin caller-facing operations over the recovery managers and progress
//! records. Arguments arrive as strings from the outer surface and are parsed
//! here; restores schedule cache invalidation for the consumers they touch.

use crate::config::ReconcileConfig;
use crate::error::ResolverError;
use crate::invalidation::InvalidationScheduler;
use embedsync_model::{
    BackupEntity, BackupId, BackupMetadata, ConsumerId, ContainerId, DeletedEntry, Entity,
    InstanceConfig, Namespace, ProgressId, ProgressRecord, ReferenceEntry, ReferenceIndex,
    VersionId, VersionSummary,
};
use embedsync_recovery::{
    BackupManager, PruneReport, RestoreDeletedOutcome, RestoreReceipt, SoftDeleteManager,
    VersionManager, VersionMeta,
};
use embedsync_store::RecordStore;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Result of [`Resolvers::delete_orphaned_embeds_by_page`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeReport {
    pub deleted_count: usize,
    pub consumer_ids: Vec<ConsumerId>,
    pub errors: Vec<String>,
}

/// Caller-facing recovery operations
#[derive(Debug)]
pub struct Resolvers {
    records: RecordStore,
    versions: Arc<VersionManager>,
    soft_delete: SoftDeleteManager,
    backups: BackupManager,
    invalidation: InvalidationScheduler,
    config: ReconcileConfig,
}

impl Resolvers {
    /// Create resolvers sharing a version manager with the worker
    #[must_use]
    pub fn new(records: RecordStore, versions: Arc<VersionManager>, config: ReconcileConfig) -> Self {
        let soft_delete = SoftDeleteManager::new(records.clone(), versions.clone())
            .with_ttl_days(config.quarantine_ttl_days)
            .with_changed_by(config.changed_by.clone())
            .with_block_on_snapshot_failure(config.block_on_snapshot_failure);
        let backups = BackupManager::new(records.clone(), versions.clone())
            .with_changed_by(config.changed_by.clone());
        let invalidation = InvalidationScheduler::new(records.clone(), config.invalidation_delay());
        Self {
            records,
            versions,
            soft_delete,
            backups,
            invalidation,
            config,
        }
    }

    /// Pending cache invalidation
    #[inline]
    #[must_use]
    pub fn invalidation(&self) -> &InvalidationScheduler {
        &self.invalidation
    }

    /// Latest progress record for a job
    ///
    /// # Errors
    /// Returns error on store failure
    pub async fn get_check_progress(
        &self,
        progress_id: &ProgressId,
    ) -> Result<Option<ProgressRecord>, ResolverError> {
        Ok(self.records.load(progress_id).await?)
    }

    /// Snapshot history, newest first
    ///
    /// `entity_id` is either a full storage key (`usage:S1`) or a bare
    /// consumer id, which names that consumer's instance config.
    ///
    /// # Errors
    /// Returns error on store failure
    pub async fn get_version_history(&self, entity_id: &str) -> Result<Vec<VersionSummary>, ResolverError> {
        let key = entity_key(entity_id);
        Ok(self.versions.list_versions(&key).await?)
    }

    /// Restore a snapshot to its live key
    ///
    /// # Errors
    /// - `ResolverError::InvalidArgument` for a malformed version id
    /// - `ResolverError::Version` if the version is missing or the write fails
    pub async fn restore_from_version(&self, version_id: &str) -> Result<RestoreReceipt, ResolverError> {
        let version_id: VersionId = version_id.parse()?;
        let receipt = self
            .versions
            .restore_version(&version_id, &self.config.changed_by)
            .await?;

        if let Some(consumer) = Namespace::InstanceConfig.id_of(&receipt.storage_key) {
            self.invalidation.schedule([ConsumerId::from(consumer)]);
        }
        Ok(receipt)
    }

    /// Prune snapshots now, with the configured retention unless given
    ///
    /// # Errors
    /// Returns error only if the snapshot scan fails
    pub async fn prune_versions_now(&self, retention_days: Option<u32>) -> Result<PruneReport, ResolverError> {
        let days = retention_days.unwrap_or(self.config.version_retention_days);
        Ok(self.versions.prune_expired_versions(days).await?)
    }

    /// Every quarantined instance
    ///
    /// # Errors
    /// Returns error on store failure
    pub async fn get_deleted_items(&self) -> Result<Vec<DeletedEntry>, ResolverError> {
        Ok(self.soft_delete.list_deleted().await?)
    }

    /// Restore a quarantined instance
    ///
    /// # Errors
    /// `ResolverError::SoftDelete` if nothing is quarantined for the consumer
    /// or the entry cannot be recovered
    pub async fn restore_deleted_item(&self, consumer_id: &str) -> Result<RestoreDeletedOutcome, ResolverError> {
        let consumer_id = ConsumerId::from(consumer_id);
        let outcome = self.soft_delete.restore_deleted_item(&consumer_id).await?;
        self.invalidation.schedule([consumer_id]);
        Ok(outcome)
    }

    /// Permanently delete every embed instance referenced from the given
    /// containers, bypassing quarantine
    ///
    /// Configs and index entries are snapshotted before deletion. Per-item
    /// failures are collected in the report.
    ///
    /// # Errors
    /// Returns error only if the index scan fails
    pub async fn delete_orphaned_embeds_by_page(
        &self,
        container_ids: &[ContainerId],
    ) -> Result<PurgeReport, ResolverError> {
        let pages: BTreeSet<&ContainerId> = container_ids.iter().collect();
        let mut report = PurgeReport::default();
        let mut purged: BTreeSet<ConsumerId> = BTreeSet::new();

        for (index_id, index) in self.records.scan::<ReferenceIndex>().await?.records {
            let (doomed, kept): (Vec<_>, Vec<_>) = index
                .references
                .iter()
                .cloned()
                .partition(|r| pages.contains(&r.container_id));
            if doomed.is_empty() {
                continue;
            }

            for reference in &doomed {
                if !purged.insert(reference.consumer_id.clone()) {
                    continue;
                }
                match self.soft_delete.purge(&reference.consumer_id).await {
                    Ok(_) => report.consumer_ids.push(reference.consumer_id.clone()),
                    Err(e) => report.errors.push(format!("{}: {e}", reference.consumer_id)),
                }
            }

            if let Err(e) = self.rewrite_index(&index_id, &index, kept).await {
                report.errors.push(format!("{}: {e}", ReferenceIndex::key(&index_id)));
            }
        }

        report.deleted_count = report.consumer_ids.len();
        tracing::info!(
            pages = container_ids.len(),
            deleted = report.deleted_count,
            errors = report.errors.len(),
            "permanently deleted embeds by page"
        );
        Ok(report)
    }

    /// Backup metadata, newest first
    ///
    /// # Errors
    /// Returns error on store failure
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>, ResolverError> {
        Ok(self.backups.list_backups().await?)
    }

    /// Restore every config in a backup
    ///
    /// # Errors
    /// - `ResolverError::InvalidArgument` for a malformed backup id
    /// - `ResolverError::Backup` if the backup is missing or the restore fails
    pub async fn restore_backup(&self, backup_id: &str) -> Result<usize, ResolverError> {
        let backup_id: BackupId = backup_id.parse()?;
        let restored = self.backups.restore_backup(backup_id).await?;

        let consumers = self
            .records
            .scan_with::<BackupEntity>(&format!("{backup_id}:"))
            .await?
            .into_records()
            .into_iter()
            .map(|e| e.consumer_id);
        self.invalidation.schedule(consumers);
        Ok(restored)
    }

    async fn rewrite_index(
        &self,
        index_id: &str,
        previous: &ReferenceIndex,
        kept: Vec<ReferenceEntry>,
    ) -> Result<(), ResolverError> {
        let key = ReferenceIndex::key(index_id);
        let meta = if kept.is_empty() {
            VersionMeta::delete(&self.config.changed_by)
        } else {
            VersionMeta::update(&self.config.changed_by)
        };
        self.versions
            .snapshot_before_write(&key, &serde_json::to_value(previous)?, &meta)
            .await;

        if kept.is_empty() {
            self.records.remove::<ReferenceIndex>(index_id).await?;
        } else {
            let mut index = previous.clone();
            index.references = kept;
            self.records.save(index_id, &index).await?;
        }
        Ok(())
    }
}

/// Full storage key for a resolver entity argument
fn entity_key(entity_id: &str) -> String {
    match Namespace::of_key(entity_id) {
        Ok(_) => entity_id.to_string(),
        Err(_) => InstanceConfig::key(entity_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_ids_name_instance_configs() {
        assert_eq!(entity_key("E1"), "macro-vars:E1");
        assert_eq!(entity_key("usage:S1"), "usage:S1");
    }
}
