//! Error types for the record store

use crate::storage::StorageError;
use embedsync_model::ModelError;

/// Errors raised by [`crate::RecordStore`]
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying backend failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Value failed namespace validation
    #[error("record error: {0}")]
    Model(#[from] ModelError),

    /// A chunked value could not be reassembled
    #[error("corrupt chunked value at '{key}': {reason}")]
    CorruptChunks { key: String, reason: String },

    /// Encoding failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Create corrupt chunk error
    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptChunks {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Check if the operation may succeed when retried
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage(e) if e.is_retryable())
    }

    /// Check if a stored value failed to decode as its namespace type
    #[inline]
    #[must_use]
    pub fn is_invalid_record(&self) -> bool {
        matches!(self, Self::Model(ModelError::InvalidRecord { .. }))
    }
}

/// Result type alias for record store operations
pub type StoreResult<T> = Result<T, StoreError>;
