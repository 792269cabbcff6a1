//! Typed, validating record store with transparent chunking
//!
//! [`RecordStore`] sits between the subsystem and a raw [`Storage`] backend:
//!
//! ```text
//! typed call (load/save/scan)
//!     │  Entity::NAMESPACE fixes the key prefix
//!     ▼
//! RecordStore ── raw writes validated by Record::decode
//!     │  values over the threshold become chunk:<key>#NNNNN fragments
//!     ▼
//! Storage (get / set / delete / query_by_prefix)
//! ```

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::storage::Storage;
use embedsync_model::{ContentHash, Entity, ModelError, Namespace, Record};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Display;
use std::sync::Arc;

/// Field marking a value as a chunk manifest
const MANIFEST_FIELD: &str = "$chunked";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChunkManifest {
    count: usize,
    size: usize,
    hash: ContentHash,
}

fn manifest_of(value: &Value) -> Option<ChunkManifest> {
    let obj = value.as_object()?;
    if obj.len() != 1 {
        return None;
    }
    serde_json::from_value(obj.get(MANIFEST_FIELD)?.clone()).ok()
}

fn chunk_key(key: &str, idx: usize) -> String {
    Namespace::Chunk.key(format!("{key}#{idx:05}"))
}

/// Split on char boundaries into pieces of at most `budget` bytes
fn split_pieces(text: &str, budget: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = budget.min(rest.len());
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        pieces.push(head);
        rest = tail;
    }
    pieces
}

/// A record that failed validation during a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedRecord {
    pub key: String,
    pub reason: String,
}

/// Result of a namespace scan
#[derive(Debug, Clone)]
pub struct Scan<T> {
    /// Valid records as `(id, record)`, in key order
    pub records: Vec<(String, T)>,
    /// Keys whose values did not match the namespace type
    pub rejected: Vec<RejectedRecord>,
}

impl<T> Scan<T> {
    /// Ids of the valid records
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|(id, _)| id.as_str())
    }

    /// Drop ids, keep records
    pub fn into_records(self) -> Vec<T> {
        self.records.into_iter().map(|(_, r)| r).collect()
    }
}

/// Validating record store over a raw backend
#[derive(Debug, Clone)]
pub struct RecordStore {
    storage: Arc<dyn Storage>,
    threshold: usize,
}

impl RecordStore {
    /// Create store with default configuration
    #[inline]
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_config(storage, StoreConfig::default())
    }

    /// Create store with explicit configuration
    #[must_use]
    pub fn with_config(storage: Arc<dyn Storage>, config: StoreConfig) -> Self {
        let limit = storage.max_value_bytes();
        let threshold = config.max_value_bytes.map_or(limit, |m| m.min(limit)).max(1);
        Self { storage, threshold }
    }

    /// Underlying backend
    #[inline]
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Encoded size above which values are chunked
    #[inline]
    #[must_use]
    pub fn chunk_threshold(&self) -> usize {
        self.threshold
    }

    /// Read a raw value, reassembling chunks
    ///
    /// # Errors
    /// Returns error on backend failure or a damaged chunk set
    pub async fn get_raw(&self, key: &str) -> StoreResult<Option<Value>> {
        match self.storage.get(key).await? {
            Some(value) => self.reassemble(key, value).await.map(Some),
            None => Ok(None),
        }
    }

    /// Validate a raw value against its key's namespace, then write it
    ///
    /// # Errors
    /// - `StoreError::Model` when the value does not match the namespace type
    /// - `StoreError::Storage` on backend failure
    pub async fn put_raw(&self, key: &str, value: Value) -> StoreResult<()> {
        Record::decode(key, value.clone())?;
        self.write(key, value).await
    }

    /// Delete a value and any chunks it owns
    ///
    /// # Errors
    /// Returns error on backend failure
    pub async fn delete_raw(&self, key: &str) -> StoreResult<()> {
        let previous = self.chunk_count(key).await?;
        self.storage.delete(key).await?;
        self.delete_chunks(key, 0, previous).await
    }

    /// Raw entries under a prefix, chunk fragments excluded
    ///
    /// # Errors
    /// Returns error on backend failure or a damaged chunk set
    pub async fn scan_raw(&self, prefix: &str) -> StoreResult<Vec<(String, Value)>> {
        let hits = self.storage.query_by_prefix(prefix).await?;
        let mut out = Vec::with_capacity(hits.len());
        for (key, value) in hits {
            if matches!(Namespace::of_key(&key), Ok(Namespace::Chunk)) {
                continue;
            }
            let value = self.reassemble(&key, value).await?;
            out.push((key, value));
        }
        Ok(out)
    }

    /// Read and decode any record by key
    ///
    /// # Errors
    /// Returns error on backend failure or invalid record
    pub async fn get_record(&self, key: &str) -> StoreResult<Option<Record>> {
        match self.get_raw(key).await? {
            Some(value) => Ok(Some(Record::decode(key, value)?)),
            None => Ok(None),
        }
    }

    /// Load a typed record by id
    ///
    /// # Errors
    /// Returns error on backend failure or invalid record
    pub async fn load<T: Entity>(&self, id: impl Display) -> StoreResult<Option<T>> {
        self.load_key(&T::key(id)).await
    }

    /// Load a typed record by full key
    ///
    /// # Errors
    /// Returns error if `key` is outside `T`'s namespace, on backend failure,
    /// or when the value does not decode as `T`
    pub async fn load_key<T: Entity>(&self, key: &str) -> StoreResult<Option<T>> {
        if Namespace::of_key(key)? != T::NAMESPACE {
            return Err(ModelError::invalid_record(
                key,
                format!("expected a '{}' key", T::NAMESPACE),
            )
            .into());
        }
        match self.get_raw(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ModelError::invalid_record(key, e.to_string()).into()),
            None => Ok(None),
        }
    }

    /// Save a typed record by id
    ///
    /// # Errors
    /// Returns error on encoding or backend failure
    pub async fn save<T: Entity>(&self, id: impl Display, record: &T) -> StoreResult<()> {
        self.write(&T::key(id), serde_json::to_value(record)?).await
    }

    /// Remove a typed record by id
    ///
    /// # Errors
    /// Returns error on backend failure
    pub async fn remove<T: Entity>(&self, id: impl Display) -> StoreResult<()> {
        self.delete_raw(&T::key(id)).await
    }

    /// Whether a record exists for an id
    ///
    /// # Errors
    /// Returns error on backend failure
    pub async fn exists<T: Entity>(&self, id: impl Display) -> StoreResult<bool> {
        Ok(self.storage.get(&T::key(id)).await?.is_some())
    }

    /// Every record of type `T`
    ///
    /// # Errors
    /// Returns error on backend failure; malformed values are reported in
    /// [`Scan::rejected`] rather than failing the scan
    pub async fn scan<T: Entity>(&self) -> StoreResult<Scan<T>> {
        self.scan_with::<T>("").await
    }

    /// Records of type `T` whose id starts with `id_prefix`
    ///
    /// # Errors
    /// Same as [`RecordStore::scan`]
    pub async fn scan_with<T: Entity>(&self, id_prefix: &str) -> StoreResult<Scan<T>> {
        let prefix = T::NAMESPACE.key(id_prefix);
        let mut scan = Scan {
            records: Vec::new(),
            rejected: Vec::new(),
        };
        for (key, value) in self.scan_raw(&prefix).await? {
            let id = T::NAMESPACE.id_of(&key).unwrap_or(&key).to_string();
            match serde_json::from_value::<T>(value) {
                Ok(record) => scan.records.push((id, record)),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "rejecting malformed record");
                    scan.rejected.push(RejectedRecord {
                        key,
                        reason: e.to_string(),
                    });
                }
            }
        }
        Ok(scan)
    }

    async fn write(&self, key: &str, value: Value) -> StoreResult<()> {
        let text = serde_json::to_string(&value)?;
        let previous = self.chunk_count(key).await?;

        if text.len() <= self.threshold {
            self.storage.set(key, value).await?;
            return self.delete_chunks(key, 0, previous).await;
        }

        // Chunk strings are re-escaped by the backend, so at worst they double.
        let budget = (self.threshold / 2).saturating_sub(2).max(1);
        let pieces = split_pieces(&text, budget);
        for (idx, piece) in pieces.iter().enumerate() {
            self.storage
                .set(&chunk_key(key, idx), Value::String((*piece).to_string()))
                .await?;
        }

        let manifest = ChunkManifest {
            count: pieces.len(),
            size: text.len(),
            hash: ContentHash::compute(text.as_bytes()),
        };
        let mut wrapper = Map::new();
        wrapper.insert(MANIFEST_FIELD.to_string(), serde_json::to_value(&manifest)?);
        self.storage.set(key, Value::Object(wrapper)).await?;
        self.delete_chunks(key, pieces.len(), previous).await?;

        tracing::debug!(key, chunks = pieces.len(), bytes = text.len(), "stored chunked value");
        Ok(())
    }

    async fn reassemble(&self, key: &str, value: Value) -> StoreResult<Value> {
        let Some(manifest) = manifest_of(&value) else {
            return Ok(value);
        };

        let mut text = String::with_capacity(manifest.size);
        for idx in 0..manifest.count {
            let piece = self
                .storage
                .get(&chunk_key(key, idx))
                .await?
                .ok_or_else(|| StoreError::corrupt(key, format!("missing chunk {idx}")))?;
            let piece = piece
                .as_str()
                .ok_or_else(|| StoreError::corrupt(key, format!("chunk {idx} is not a string")))?;
            text.push_str(piece);
        }

        if ContentHash::compute(text.as_bytes()) != manifest.hash {
            return Err(StoreError::corrupt(key, "content hash mismatch"));
        }
        Ok(serde_json::from_str(&text)?)
    }

    async fn chunk_count(&self, key: &str) -> StoreResult<usize> {
        Ok(self
            .storage
            .get(key)
            .await?
            .as_ref()
            .and_then(manifest_of)
            .map_or(0, |m| m.count))
    }

    async fn delete_chunks(&self, key: &str, from: usize, to: usize) -> StoreResult<()> {
        for idx in from..to {
            self.storage.delete(&chunk_key(key, idx)).await?;
        }
        Ok(())
    }
}
