//! Key-value storage seam
//!
//! [`Storage`] is the contract the subsystem needs from the platform's
//! key-value store: get, set, delete and prefix query, with a ceiling on the
//! size of a single value. [`MemoryStorage`] is an in-process backend used by
//! the CLI and the test suite.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::ops::Bound;

/// Default per-value ceiling, in bytes of encoded JSON
pub const DEFAULT_MAX_VALUE_BYTES: usize = 240_000;

/// Errors raised by a storage backend
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Value exceeds the backend's per-value ceiling
    #[error("value for '{key}' is {size} bytes, limit is {limit}")]
    ValueTooLarge {
        key: String,
        size: usize,
        limit: usize,
    },

    /// Backend refused or failed the operation
    #[error("storage backend error: {0}")]
    Backend(String),

    /// Value could not be encoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StorageError {
    /// Check if the operation may succeed when retried
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Platform key-value store
#[async_trait]
pub trait Storage: Send + Sync + Debug {
    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError>;

    /// Write a value, replacing any previous one
    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError>;

    /// Delete a value. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Every entry whose key starts with `prefix`, in key order
    async fn query_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError>;

    /// Largest encoded value a single key may hold
    fn max_value_bytes(&self) -> usize {
        DEFAULT_MAX_VALUE_BYTES
    }
}

/// In-memory ordered storage
///
/// Enforces the same per-value ceiling as the platform store so callers
/// exercise their chunking path.
#[derive(Debug)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Value>>,
    max_value_bytes: usize,
}

impl MemoryStorage {
    /// Create empty storage with the default value ceiling
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_value_bytes(DEFAULT_MAX_VALUE_BYTES)
    }

    /// Create empty storage with a custom value ceiling
    #[inline]
    #[must_use]
    pub fn with_max_value_bytes(max_value_bytes: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            max_value_bytes: max_value_bytes.max(1),
        }
    }

    /// Create storage pre-populated with entries (no size check)
    #[must_use]
    pub fn from_entries(entries: BTreeMap<String, Value>) -> Self {
        Self {
            entries: RwLock::new(entries),
            max_value_bytes: DEFAULT_MAX_VALUE_BYTES,
        }
    }

    /// Copy of every entry
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.entries.read().clone()
    }

    /// Keys starting with `prefix`
    #[must_use]
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .read()
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Number of stored entries
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when nothing is stored
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        let size = serde_json::to_vec(&value)?.len();
        if size > self.max_value_bytes {
            return Err(StorageError::ValueTooLarge {
                key: key.to_string(),
                size,
                limit: self.max_value_bytes,
            });
        }
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn query_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        Ok(self
            .entries
            .read()
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn max_value_bytes(&self) -> usize {
        self.max_value_bytes
    }
}
