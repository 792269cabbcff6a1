//! Quarantine for removed embed instances
//!
//! A soft delete moves an instance's config into the `deleted:` namespace
//! with enough metadata to put it back, including the reference entry that
//! pointed at it. Expiry is recorded as `expiresAt` and never executed here.

use crate::error::SoftDeleteError;
use crate::versions::{VersionManager, VersionMeta};
use chrono::{Duration, Utc};
use embedsync_model::{
    CacheEntry, ConsumerId, DeletedEntry, DeletionMetadata, Entity, InstanceConfig,
    ReferenceIndex, VersionId,
};
use embedsync_store::RecordStore;
use serde::Serialize;
use std::sync::Arc;

/// Default quarantine lifetime
pub const DEFAULT_QUARANTINE_TTL_DAYS: u32 = 30;

/// Result of [`SoftDeleteManager::soft_delete`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftDeleteOutcome {
    pub consumer_id: ConsumerId,
    /// Quarantine copy written and live records removed
    pub quarantined: bool,
    /// Whether a config existed to recover
    pub can_recover: bool,
    /// Pre-delete snapshot, if one was taken
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_id: Option<VersionId>,
    pub dry_run: bool,
}

/// Result of [`SoftDeleteManager::restore_deleted_item`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreDeletedOutcome {
    pub success: bool,
    pub consumer_id: ConsumerId,
    /// Reference entry was re-added to its index
    pub reference_restored: bool,
}

/// Quarantine manager
#[derive(Debug, Clone)]
pub struct SoftDeleteManager {
    records: RecordStore,
    versions: Arc<VersionManager>,
    ttl_days: u32,
    changed_by: String,
    block_on_snapshot_failure: bool,
}

impl SoftDeleteManager {
    /// Create manager with default TTL and actor
    #[must_use]
    pub fn new(records: RecordStore, versions: Arc<VersionManager>) -> Self {
        Self {
            records,
            versions,
            ttl_days: DEFAULT_QUARANTINE_TTL_DAYS,
            changed_by: "reconciliation".to_string(),
            block_on_snapshot_failure: false,
        }
    }

    /// With quarantine lifetime
    #[inline]
    #[must_use]
    pub fn with_ttl_days(mut self, days: u32) -> Self {
        self.ttl_days = days;
        self
    }

    /// With actor recorded on snapshots and quarantine entries
    #[inline]
    #[must_use]
    pub fn with_changed_by(mut self, changed_by: impl Into<String>) -> Self {
        self.changed_by = changed_by.into();
        self
    }

    /// Refuse to delete when the pre-delete snapshot fails
    #[inline]
    #[must_use]
    pub fn with_block_on_snapshot_failure(mut self, block: bool) -> Self {
        self.block_on_snapshot_failure = block;
        self
    }

    /// Quarantine an instance's config and remove its live records
    ///
    /// In dry run nothing is written; the outcome reports what would happen.
    ///
    /// # Errors
    /// - `SoftDeleteError::SnapshotFailed` when snapshots are required and fail
    /// - `SoftDeleteError::Store` on store failure
    pub async fn soft_delete(
        &self,
        consumer_id: &ConsumerId,
        reason: &str,
        metadata: DeletionMetadata,
        dry_run: bool,
    ) -> Result<SoftDeleteOutcome, SoftDeleteError> {
        let config = self.records.load::<InstanceConfig>(consumer_id).await?;
        let can_recover = config.is_some();

        if dry_run {
            tracing::info!(consumer = %consumer_id, reason, "dry run: would quarantine instance");
            return Ok(SoftDeleteOutcome {
                consumer_id: consumer_id.clone(),
                quarantined: false,
                can_recover,
                version_id: None,
                dry_run,
            });
        }

        let version_id = match &config {
            Some(config) => self.snapshot(consumer_id, config).await?,
            None => None,
        };

        let now = Utc::now();
        let entry = DeletedEntry {
            consumer_id: consumer_id.clone(),
            config,
            deleted_at: now,
            deleted_by: self.changed_by.clone(),
            deletion_reason: reason.to_string(),
            can_recover,
            metadata,
            expires_at: now + Duration::days(i64::from(self.ttl_days)),
        };
        self.records.save(consumer_id, &entry).await?;
        self.records.remove::<InstanceConfig>(consumer_id).await?;
        self.records.remove::<CacheEntry>(consumer_id).await?;

        tracing::info!(consumer = %consumer_id, reason, can_recover, "quarantined instance");
        Ok(SoftDeleteOutcome {
            consumer_id: consumer_id.clone(),
            quarantined: true,
            can_recover,
            version_id,
            dry_run,
        })
    }

    /// Permanently delete an instance's config and cache, bypassing quarantine
    ///
    /// A version snapshot is still attempted first.
    ///
    /// # Errors
    /// - `SoftDeleteError::SnapshotFailed` when snapshots are required and fail
    /// - `SoftDeleteError::Store` on store failure
    pub async fn purge(&self, consumer_id: &ConsumerId) -> Result<Option<VersionId>, SoftDeleteError> {
        let version_id = match self.records.load::<InstanceConfig>(consumer_id).await? {
            Some(config) => self.snapshot(consumer_id, &config).await?,
            None => None,
        };
        self.records.remove::<InstanceConfig>(consumer_id).await?;
        self.records.remove::<CacheEntry>(consumer_id).await?;
        tracing::info!(consumer = %consumer_id, "permanently deleted instance");
        Ok(version_id)
    }

    /// Move a quarantined config back to the live namespace
    ///
    /// The reference entry captured at deletion is re-added to its index if
    /// the index no longer lists the consumer.
    ///
    /// # Errors
    /// - `SoftDeleteError::NotFound` if nothing is quarantined for the consumer
    /// - `SoftDeleteError::Unrecoverable` if the entry holds no config
    /// - `SoftDeleteError::Store` on store failure
    pub async fn restore_deleted_item(
        &self,
        consumer_id: &ConsumerId,
    ) -> Result<RestoreDeletedOutcome, SoftDeleteError> {
        let entry = self
            .records
            .load::<DeletedEntry>(consumer_id)
            .await?
            .ok_or_else(|| SoftDeleteError::NotFound(consumer_id.clone()))?;
        let config = match entry.config {
            Some(config) if entry.can_recover => config,
            _ => return Err(SoftDeleteError::Unrecoverable(consumer_id.clone())),
        };

        if let Some(current) = self.records.load::<InstanceConfig>(consumer_id).await? {
            self.versions
                .snapshot_before_write(
                    &InstanceConfig::key(consumer_id),
                    &serde_json::to_value(&current)?,
                    &VersionMeta::update(&self.changed_by),
                )
                .await;
        }
        self.records.save(consumer_id, &config).await?;

        let mut reference_restored = false;
        if let (Some(source_id), Some(reference)) =
            (entry.metadata.source_id.as_ref(), entry.metadata.reference)
        {
            let mut index = self
                .records
                .load::<ReferenceIndex>(source_id)
                .await?
                .unwrap_or_else(|| ReferenceIndex::new(source_id.clone()));
            if index.find(consumer_id).is_none() {
                index.upsert(reference);
                self.records.save(source_id, &index).await?;
                reference_restored = true;
            }
        }

        self.records.remove::<DeletedEntry>(consumer_id).await?;
        tracing::info!(consumer = %consumer_id, reference_restored, "restored deleted instance");

        Ok(RestoreDeletedOutcome {
            success: true,
            consumer_id: consumer_id.clone(),
            reference_restored,
        })
    }

    /// Every quarantined entry, in consumer id order
    ///
    /// # Errors
    /// Returns error on store failure
    pub async fn list_deleted(&self) -> Result<Vec<DeletedEntry>, SoftDeleteError> {
        Ok(self.records.scan::<DeletedEntry>().await?.into_records())
    }

    async fn snapshot(
        &self,
        consumer_id: &ConsumerId,
        config: &InstanceConfig,
    ) -> Result<Option<VersionId>, SoftDeleteError> {
        let key = InstanceConfig::key(consumer_id);
        let data = serde_json::to_value(config)?;
        let meta = VersionMeta::delete(&self.changed_by);

        if !self.block_on_snapshot_failure {
            return Ok(self.versions.snapshot_before_write(&key, &data, &meta).await);
        }
        match self.versions.save_version(&key, &data, &meta).await {
            Ok(outcome) => Ok(Some(outcome.into_version_id())),
            Err(source) => Err(SoftDeleteError::SnapshotFailed {
                consumer_id: consumer_id.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedsync_model::{ChangeType, VersionSnapshot};
    use embedsync_test_utils::{config, reference, ts, FaultyStorage, World};
    use pretty_assertions::assert_eq;

    fn manager(world: &World) -> SoftDeleteManager {
        let versions = Arc::new(VersionManager::new(world.records.clone()));
        SoftDeleteManager::new(world.records.clone(), versions).with_changed_by("tester")
    }

    fn metadata(source: &str, consumer: &str) -> DeletionMetadata {
        DeletionMetadata {
            container_id: Some("C2".into()),
            container_exists: Some(false),
            source_id: Some(source.into()),
            reference: Some(reference(consumer, "C2")),
        }
    }

    #[tokio::test]
    async fn soft_delete_quarantines_and_restore_round_trips() {
        let world = World::new();
        let original = config(Some("S1"), Some(ts(5)));
        world.put_config("E1", &original).await;
        world.put_cache("E1", "rendered").await;
        let manager = manager(&world);

        let outcome = manager
            .soft_delete(&"E1".into(), "container deleted", metadata("S1", "E1"), false)
            .await
            .unwrap();
        assert!(outcome.quarantined);
        assert!(outcome.can_recover);

        let versions = world.records.scan::<VersionSnapshot>().await.unwrap().into_records();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].change_type, ChangeType::Delete);

        assert!(world.records.load::<InstanceConfig>("E1").await.unwrap().is_none());
        assert!(world.records.load::<CacheEntry>("E1").await.unwrap().is_none());

        let deleted = manager.list_deleted().await.unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].deleted_by, "tester");
        assert!(deleted[0].expires_at > deleted[0].deleted_at);

        let restored = manager.restore_deleted_item(&"E1".into()).await.unwrap();
        assert!(restored.success);
        assert!(restored.reference_restored);
        assert_eq!(world.records.load::<InstanceConfig>("E1").await.unwrap(), Some(original));
        assert!(manager.list_deleted().await.unwrap().is_empty());

        let index = world.records.load::<ReferenceIndex>("S1").await.unwrap().unwrap();
        assert!(index.find(&"E1".into()).is_some());
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let world = World::new();
        world.put_config("E1", &config(Some("S1"), None)).await;
        let before = world.storage.snapshot();

        let outcome = manager(&world)
            .soft_delete(&"E1".into(), "container deleted", metadata("S1", "E1"), true)
            .await
            .unwrap();
        assert!(!outcome.quarantined);
        assert!(outcome.dry_run);
        assert_eq!(world.storage.snapshot(), before);
    }

    #[tokio::test]
    async fn missing_config_is_unrecoverable() {
        let world = World::new();
        let manager = manager(&world);
        manager
            .soft_delete(&"E9".into(), "node not found in container", DeletionMetadata::default(), false)
            .await
            .unwrap();

        let err = manager.restore_deleted_item(&"E9".into()).await.unwrap_err();
        assert!(matches!(err, SoftDeleteError::Unrecoverable(_)));
    }

    #[tokio::test]
    async fn restore_unknown_is_not_found() {
        let world = World::new();
        let err = manager(&world).restore_deleted_item(&"nope".into()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn snapshot_failure_blocks_only_when_required() {
        let storage = Arc::new(FaultyStorage::new());
        let world = World::with_storage(storage.clone());
        world.put_config("E1", &config(Some("S1"), None)).await;
        storage.fail_writes_with_prefix("version:");

        let blocking = manager(&world).with_block_on_snapshot_failure(true);
        let err = blocking
            .soft_delete(&"E1".into(), "container deleted", metadata("S1", "E1"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SoftDeleteError::SnapshotFailed { .. }));
        assert!(world.records.load::<InstanceConfig>("E1").await.unwrap().is_some());

        let lenient = manager(&world);
        let outcome = lenient
            .soft_delete(&"E1".into(), "container deleted", metadata("S1", "E1"), false)
            .await
            .unwrap();
        assert!(outcome.quarantined);
        assert_eq!(outcome.version_id, None);
    }

    #[tokio::test]
    async fn purge_bypasses_quarantine() {
        let world = World::new();
        world.put_config("E1", &config(Some("S1"), None)).await;
        let manager = manager(&world);

        let version = manager.purge(&"E1".into()).await.unwrap();
        assert!(version.is_some());
        assert!(manager.list_deleted().await.unwrap().is_empty());
        assert!(world.records.load::<InstanceConfig>("E1").await.unwrap().is_none());
    }
}
