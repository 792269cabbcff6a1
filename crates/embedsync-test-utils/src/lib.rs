//! Testing utilities for the embedsync workspace
//!
//! Fixture builders, an in-memory [`World`] wiring storage and a document
//! service together, and [`FaultyStorage`] for failure injection.

#![allow(missing_docs)]
#![allow(clippy::missing_panics_doc)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use embedsync_model::{
    CacheEntry, Container, ContentNode, InstanceConfig, ReferenceEntry, ReferenceIndex,
    SourceEntity, ToggleStates, VariableValues,
};
use embedsync_store::{
    MemoryStorage, RecordStore, StaticDocumentService, Storage, StorageError,
};
use parking_lot::RwLock;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Fixed instant `minutes` after 2026-01-01T00:00:00Z
pub fn ts(minutes: i64) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
        + Duration::minutes(minutes)
}

pub fn source(id: &str, updated_at: DateTime<Utc>) -> SourceEntity {
    SourceEntity {
        id: id.into(),
        name: format!("Source {id}"),
        category: Some("general".to_string()),
        content: format!("Hello {{customer}} from {id}"),
        variables: Vec::new(),
        toggles: Vec::new(),
        content_hash: None,
        updated_at,
        created_at: ts(0),
    }
}

pub fn reference(consumer: &str, container: &str) -> ReferenceEntry {
    ReferenceEntry {
        consumer_id: consumer.into(),
        container_id: container.into(),
        container_title: format!("Page {container}"),
        anchor: None,
        variable_values: variables(consumer),
        toggle_states: ToggleStates::new(),
        updated_at: ts(0),
    }
}

pub fn config(source: Option<&str>, last_synced: Option<DateTime<Utc>>) -> InstanceConfig {
    let mut toggle_states = ToggleStates::new();
    toggle_states.insert("footer".to_string(), true);
    InstanceConfig {
        source_id: source.map(Into::into),
        variable_values: variables("acme"),
        toggle_states,
        custom_insertions: Vec::new(),
        updated_at: ts(0),
        last_synced,
    }
}

fn variables(customer: &str) -> VariableValues {
    let mut values = VariableValues::new();
    values.insert("customer".to_string(), json!(customer));
    values
}

/// Container whose content embeds each consumer in its own paragraph
pub fn container(id: &str, consumers: &[&str]) -> Container {
    let paragraphs = consumers
        .iter()
        .map(|c| ContentNode::paragraph(vec![ContentNode::embed(&(*c).into())]))
        .collect();
    Container {
        id: id.into(),
        title: format!("Page {id}"),
        version_number: 1,
        content: ContentNode::doc(paragraphs),
    }
}

/// Storage and document service for one test
#[derive(Debug, Clone)]
pub struct World {
    pub storage: Arc<MemoryStorage>,
    pub records: RecordStore,
    pub documents: Arc<StaticDocumentService>,
}

impl World {
    pub fn new() -> Self {
        let storage = Arc::new(MemoryStorage::new());
        Self {
            records: RecordStore::new(storage.clone()),
            storage,
            documents: Arc::new(StaticDocumentService::new()),
        }
    }

    /// Storage with a small per-value ceiling, forcing chunked writes
    pub fn with_max_value_bytes(limit: usize) -> Self {
        let storage = Arc::new(MemoryStorage::with_max_value_bytes(limit));
        Self {
            records: RecordStore::new(storage.clone()),
            storage,
            documents: Arc::new(StaticDocumentService::new()),
        }
    }

    /// Records go through `faulty`; `storage` still exposes the raw map
    pub fn with_storage(faulty: Arc<FaultyStorage>) -> Self {
        Self {
            storage: faulty.inner().clone(),
            records: RecordStore::new(faulty),
            documents: Arc::new(StaticDocumentService::new()),
        }
    }

    pub async fn put_source(&self, id: &str, updated_at: DateTime<Utc>) {
        self.records.save(id, &source(id, updated_at)).await.unwrap();
    }

    pub async fn put_reference(&self, source_id: &str, consumer: &str, container_id: &str) {
        let mut index = self
            .records
            .load::<ReferenceIndex>(source_id)
            .await
            .unwrap()
            .unwrap_or_else(|| ReferenceIndex::new(source_id.into()));
        index.upsert(reference(consumer, container_id));
        self.records.save(source_id, &index).await.unwrap();
    }

    pub async fn put_config(&self, consumer: &str, config: &InstanceConfig) {
        self.records.save(consumer, config).await.unwrap();
    }

    pub async fn put_cache(&self, consumer: &str, content: &str) {
        let entry = CacheEntry {
            content: content.to_string(),
            cached_at: ts(0),
        };
        self.records.save(consumer, &entry).await.unwrap();
    }

    /// Reference entry, config and cache for one embed instance
    pub async fn embed(
        &self,
        source_id: &str,
        consumer: &str,
        container_id: &str,
        last_synced: Option<DateTime<Utc>>,
    ) {
        self.put_reference(source_id, consumer, container_id).await;
        self.put_config(consumer, &config(Some(source_id), last_synced)).await;
        self.put_cache(consumer, &format!("rendered {consumer}")).await;
    }

    /// Write a value straight to storage, skipping record validation
    pub async fn put_unchecked(&self, key: &str, value: Value) {
        self.storage.set(key, value).await.unwrap();
    }

    pub fn add_container(&self, id: &str, consumers: &[&str]) {
        self.documents.insert(container(id, consumers));
    }

    /// Reference indices and instance configs, raw
    pub fn live_state(&self) -> BTreeMap<String, Value> {
        self.storage
            .snapshot()
            .into_iter()
            .filter(|(k, _)| k.starts_with("usage:") || k.starts_with("macro-vars:"))
            .collect()
    }

    /// Keys in a namespace prefix such as `"deleted:"`
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.storage.keys_with_prefix(prefix)
    }
}

impl Default for World {
    fn default() -> Self {
        Self::new()
    }
}

/// Storage that fails operations on configured key prefixes
#[derive(Debug, Default)]
pub struct FaultyStorage {
    inner: Arc<MemoryStorage>,
    failing_writes: RwLock<Vec<String>>,
    failing_reads: RwLock<Vec<String>>,
}

impl FaultyStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &Arc<MemoryStorage> {
        &self.inner
    }

    /// Fail `set` and `delete` for keys under `prefix`
    pub fn fail_writes_with_prefix(&self, prefix: &str) {
        self.failing_writes.write().push(prefix.to_string());
    }

    /// Fail `get` and prefix queries touching keys under `prefix`
    pub fn fail_reads_with_prefix(&self, prefix: &str) {
        self.failing_reads.write().push(prefix.to_string());
    }

    pub fn clear_faults(&self) {
        self.failing_writes.write().clear();
        self.failing_reads.write().clear();
    }

    fn check(list: &RwLock<Vec<String>>, key: &str) -> Result<(), StorageError> {
        if list.read().iter().any(|p| key.starts_with(p.as_str())) {
            return Err(StorageError::Backend(format!("injected failure for '{key}'")));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FaultyStorage {
    async fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Self::check(&self.failing_reads, key)?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        Self::check(&self.failing_writes, key)?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        Self::check(&self.failing_writes, key)?;
        self.inner.delete(key).await
    }

    async fn query_by_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let hits = self.inner.query_by_prefix(prefix).await?;
        for (key, _) in &hits {
            Self::check(&self.failing_reads, key)?;
        }
        Ok(hits)
    }

    fn max_value_bytes(&self) -> usize {
        self.inner.max_value_bytes()
    }
}
