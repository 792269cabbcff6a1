//! Error types for reconciliation and the recovery resolvers
//!
//! [`ReconcileError`] is fatal to a run: the worker records it on the
//! progress record and stops. Collaborator failures scoped to one container
//! never become a `ReconcileError`; they are reported on the summary.

use embedsync_model::ModelError;
use embedsync_recovery::{BackupError, SoftDeleteError, VersionError};
use embedsync_store::StoreError;

/// Fatal reconciliation errors
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Configuration could not be parsed
    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// Record store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Record or phase validation failed
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Quarantine failed
    #[error("soft delete failed: {0}")]
    SoftDelete(#[from] SoftDeleteError),

    /// Required backup failed
    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),

    /// Version history failed
    #[error("version error: {0}")]
    Version(#[from] VersionError),

    /// Run was cancelled through its job handle
    #[error("cancelled")]
    Cancelled,

    /// Worker task ended without reporting
    #[error("job aborted: {0}")]
    JobAborted(String),

    /// Encoding failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReconcileError {
    /// True when the run stopped because it was cancelled
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if re-running may succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            Self::Cancelled | Self::JobAborted(_) => true,
            _ => false,
        }
    }
}

/// Result type alias for reconciliation
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Errors returned to resolver callers
#[derive(Debug, thiserror::Error)]
pub enum ResolverError {
    /// Argument could not be parsed
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Version operation failed
    #[error(transparent)]
    Version(#[from] VersionError),

    /// Quarantine operation failed
    #[error(transparent)]
    SoftDelete(#[from] SoftDeleteError),

    /// Backup operation failed
    #[error(transparent)]
    Backup(#[from] BackupError),

    /// Record store failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Encoding failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ResolverError {
    /// True when the requested item does not exist
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Version(e) => e.is_not_found(),
            Self::SoftDelete(e) => e.is_not_found(),
            Self::Backup(e) => e.is_not_found(),
            _ => false,
        }
    }
}

impl From<ModelError> for ResolverError {
    fn from(e: ModelError) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedsync_model::ConsumerId;

    #[test]
    fn not_found_classification() {
        let err = ResolverError::from(SoftDeleteError::NotFound(ConsumerId::from("E1")));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "no deleted item for consumer E1");

        let err = ResolverError::InvalidArgument("bad id".into());
        assert!(!err.is_not_found());
    }

    #[test]
    fn cancelled_is_retryable() {
        assert!(ReconcileError::Cancelled.is_cancelled());
        assert!(ReconcileError::Cancelled.is_retryable());
    }
}
