//! Error types for the recovery managers

use embedsync_model::{BackupId, ConsumerId, HashError, ModelError, VersionId};
use embedsync_store::StoreError;

/// Version manager errors
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    /// No snapshot under this id
    #[error("version not found: {0}")]
    NotFound(VersionId),

    /// Record store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Snapshot data could not be hashed
    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    /// Snapshot data could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl VersionError {
    /// True for a lookup miss
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<ModelError> for VersionError {
    fn from(e: ModelError) -> Self {
        Self::Store(StoreError::Model(e))
    }
}

/// Soft-delete manager errors
#[derive(Debug, thiserror::Error)]
pub enum SoftDeleteError {
    /// Nothing quarantined for this consumer
    #[error("no deleted item for consumer {0}")]
    NotFound(ConsumerId),

    /// Quarantine entry holds no config to restore
    #[error("deleted item for consumer {0} cannot be recovered")]
    Unrecoverable(ConsumerId),

    /// Pre-delete snapshot failed and snapshots are required
    #[error("snapshot before deleting {consumer_id} failed: {source}")]
    SnapshotFailed {
        consumer_id: ConsumerId,
        #[source]
        source: VersionError,
    },

    /// Record store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Quarantine entry could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SoftDeleteError {
    /// True for a lookup miss
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True when only this instance is affected: its snapshot was required
    /// and failed, or its stored config does not decode
    #[inline]
    #[must_use]
    pub fn is_skippable(&self) -> bool {
        match self {
            Self::SnapshotFailed { .. } => true,
            Self::Store(e) => e.is_invalid_record(),
            _ => false,
        }
    }
}

/// Backup manager errors
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// No backup metadata under this id
    #[error("backup not found: {0}")]
    NotFound(BackupId),

    /// Record store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Live value could not be encoded for its pre-restore snapshot
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// True for a lookup miss
    #[inline]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result alias for version operations
pub type VersionResult<T> = Result<T, VersionError>;
