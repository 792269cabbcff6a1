//! Full point-in-time backups of live instance configs
//!
//! A backup is one `backup-meta:<id>` record plus one
//! `backup-data:<id>:<consumerId>` record per config. Backups are never
//! deleted automatically.

use crate::error::BackupError;
use crate::versions::{VersionManager, VersionMeta};
use chrono::Utc;
use embedsync_model::{BackupEntity, BackupId, BackupMetadata, Entity, InstanceConfig};
use embedsync_store::RecordStore;
use std::sync::Arc;

/// Backup snapshot manager
#[derive(Debug, Clone)]
pub struct BackupManager {
    records: RecordStore,
    versions: Arc<VersionManager>,
    changed_by: String,
}

impl BackupManager {
    /// Create manager
    #[must_use]
    pub fn new(records: RecordStore, versions: Arc<VersionManager>) -> Self {
        Self {
            records,
            versions,
            changed_by: "reconciliation".to_string(),
        }
    }

    /// With actor recorded on pre-restore snapshots
    #[inline]
    #[must_use]
    pub fn with_changed_by(mut self, changed_by: impl Into<String>) -> Self {
        self.changed_by = changed_by.into();
        self
    }

    /// Copy every live instance config into a new backup
    ///
    /// # Errors
    /// Returns error on store failure; entities written before the failure
    /// remain but no metadata record is written for them
    pub async fn create_backup_snapshot(&self, operation: &str) -> Result<BackupMetadata, BackupError> {
        let backup_id = BackupId::new();
        let scan = self.records.scan::<InstanceConfig>().await?;
        if !scan.rejected.is_empty() {
            tracing::warn!(
                backup = %backup_id,
                rejected = scan.rejected.len(),
                "skipping malformed instance configs"
            );
        }

        let mut total = 0;
        for (consumer_id, config) in scan.records {
            let entity = BackupEntity {
                backup_id,
                consumer_id: consumer_id.as_str().into(),
                config,
            };
            self.records
                .save(format!("{backup_id}:{consumer_id}"), &entity)
                .await?;
            total += 1;
        }

        let metadata = BackupMetadata {
            backup_id,
            created_at: Utc::now(),
            operation: operation.to_string(),
            total_entities: total,
        };
        self.records.save(backup_id, &metadata).await?;

        tracing::info!(backup = %backup_id, operation, total, "created backup snapshot");
        Ok(metadata)
    }

    /// Backup metadata, newest first
    ///
    /// # Errors
    /// Returns error on store failure
    pub async fn list_backups(&self) -> Result<Vec<BackupMetadata>, BackupError> {
        let mut backups = self.records.scan::<BackupMetadata>().await?.into_records();
        backups.sort_by(|a, b| b.backup_id.cmp(&a.backup_id));
        Ok(backups)
    }

    /// Rewrite every config captured by a backup; returns the number restored
    ///
    /// Each live config is snapshotted before being overwritten.
    ///
    /// # Errors
    /// - `BackupError::NotFound` if no backup has this id
    /// - `BackupError::Store` on store failure
    pub async fn restore_backup(&self, backup_id: BackupId) -> Result<usize, BackupError> {
        if self.records.load::<BackupMetadata>(backup_id).await?.is_none() {
            return Err(BackupError::NotFound(backup_id));
        }

        let entities = self
            .records
            .scan_with::<BackupEntity>(&format!("{backup_id}:"))
            .await?
            .into_records();

        let meta = VersionMeta::update(&self.changed_by);
        for entity in &entities {
            if let Some(current) = self.records.load::<InstanceConfig>(&entity.consumer_id).await? {
                self.versions
                    .snapshot_before_write(
                        &InstanceConfig::key(&entity.consumer_id),
                        &serde_json::to_value(&current)?,
                        &meta,
                    )
                    .await;
            }
            self.records.save(&entity.consumer_id, &entity.config).await?;
        }

        tracing::info!(backup = %backup_id, restored = entities.len(), "restored backup");
        Ok(entities.len())
    }
}
