//! Error types for the record model

use crate::hash::HashError;

/// Errors raised while building or validating records
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Malformed identifier
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// Key prefix does not belong to any known namespace
    #[error("unknown namespace for key '{0}'")]
    UnknownNamespace(String),

    /// Value does not match the shape its namespace requires
    #[error("invalid record at '{key}': {message}")]
    InvalidRecord { key: String, message: String },

    /// Phase change not permitted by the job state machine
    #[error("illegal phase transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    /// Hashing failed
    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    /// JSON encoding failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ModelError {
    /// Create invalid record error
    pub fn invalid_record(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_record_display() {
        let err = ModelError::invalid_record("usage:S1", "missing field `references`");
        assert_eq!(
            err.to_string(),
            "invalid record at 'usage:S1': missing field `references`"
        );
    }
}
