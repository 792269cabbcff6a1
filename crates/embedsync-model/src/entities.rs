//! Stored entity types
//!
//! Every type here is persisted as camelCase JSON under its own key namespace
//! (see [`crate::namespace`]). Maps use `BTreeMap` so their encoding, and
//! therefore their content hash, does not depend on insertion order.

use crate::hash::{ContentHash, HashError};
use crate::ids::{BackupId, ConsumerId, ContainerId, SourceId, VersionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-instance variable values, keyed by variable name
pub type VariableValues = BTreeMap<String, Value>;

/// Per-instance toggle states, keyed by toggle name
pub type ToggleStates = BTreeMap<String, bool>;

/// Variable declared by a source fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Toggle (optional section) declared by a source fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Toggle {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Reusable content fragment. Read-only to reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceEntity {
    pub id: SourceId,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub variables: Vec<Variable>,
    #[serde(default)]
    pub toggles: Vec<Toggle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<ContentHash>,
    pub updated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// The fields a source's content hash covers
#[derive(Serialize)]
struct HashedSourceFields<'a> {
    name: &'a str,
    category: Option<&'a str>,
    content: &'a str,
    variables: &'a [Variable],
    toggles: &'a [Toggle],
}

impl SourceEntity {
    /// Hash over `{name, category, content, variables, toggles}`
    ///
    /// # Errors
    /// Returns error if the fields cannot be encoded
    pub fn compute_content_hash(&self) -> Result<ContentHash, HashError> {
        ContentHash::compute_canonical(&HashedSourceFields {
            name: &self.name,
            category: self.category.as_deref(),
            content: &self.content,
            variables: &self.variables,
            toggles: &self.toggles,
        })
    }

    /// True when writing `candidate` over `self` would change nothing
    ///
    /// # Errors
    /// Returns error if either side cannot be hashed
    pub fn is_noop_update(&self, candidate: &SourceEntity) -> Result<bool, HashError> {
        Ok(self.compute_content_hash()? == candidate.compute_content_hash()?)
    }
}

/// One embed placement recorded in a source's reverse index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceEntry {
    pub consumer_id: ConsumerId,
    pub container_id: ContainerId,
    #[serde(default)]
    pub container_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor: Option<String>,
    #[serde(default)]
    pub variable_values: VariableValues,
    #[serde(default)]
    pub toggle_states: ToggleStates,
    pub updated_at: DateTime<Utc>,
}

/// Reverse index: which embed instances reference a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceIndex {
    #[serde(default)]
    pub source_id: SourceId,
    #[serde(default)]
    pub references: Vec<ReferenceEntry>,
}

impl ReferenceIndex {
    /// Create empty index for a source
    #[inline]
    #[must_use]
    pub fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            references: Vec::new(),
        }
    }

    /// Find the entry for a consumer
    #[must_use]
    pub fn find(&self, consumer_id: &ConsumerId) -> Option<&ReferenceEntry> {
        self.references
            .iter()
            .find(|r| &r.consumer_id == consumer_id)
    }

    /// Insert or replace the entry for `entry.consumer_id`
    ///
    /// Keeps the one-entry-per-consumer invariant: any existing entries for
    /// the same consumer are dropped first.
    pub fn upsert(&mut self, entry: ReferenceEntry) {
        self.references
            .retain(|r| r.consumer_id != entry.consumer_id);
        self.references.push(entry);
    }

    /// Remove every entry for a consumer, returning the last one removed
    pub fn remove(&mut self, consumer_id: &ConsumerId) -> Option<ReferenceEntry> {
        let mut removed = None;
        self.references.retain(|r| {
            if &r.consumer_id == consumer_id {
                removed = Some(r.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// True when no references remain
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }
}

/// Free-form text spliced into a rendered instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomInsertion {
    pub position: u32,
    pub content: String,
}

/// Live configuration of one embed instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    #[serde(default)]
    pub variable_values: VariableValues,
    #[serde(default)]
    pub toggle_states: ToggleStates,
    #[serde(default)]
    pub custom_insertions: Vec<CustomInsertion>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,
}

impl InstanceConfig {
    /// Source id, if present and non-blank
    #[must_use]
    pub fn resolved_source_id(&self) -> Option<&SourceId> {
        self.source_id.as_ref().filter(|id| !id.is_blank())
    }

    /// Whether the instance predates the source's last update
    #[inline]
    #[must_use]
    pub fn is_stale_against(&self, source_updated_at: DateTime<Utc>) -> bool {
        is_stale(source_updated_at, self.last_synced)
    }
}

/// Staleness law: stale iff the source was updated strictly after the last sync.
///
/// An instance that has never synced is stale.
#[inline]
#[must_use]
pub fn is_stale(source_updated_at: DateTime<Utc>, last_synced: Option<DateTime<Utc>>) -> bool {
    match last_synced {
        Some(synced) => source_updated_at > synced,
        None => true,
    }
}

/// Rendered content cache. Never authoritative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub content: String,
    pub cached_at: DateTime<Utc>,
}

/// Kind of mutation a version snapshot precedes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

/// Immutable point-in-time copy of one stored value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSnapshot {
    pub version_id: VersionId,
    pub entity_key: String,
    pub data: Value,
    pub change_type: ChangeType,
    pub timestamp: DateTime<Utc>,
    pub changed_by: String,
    pub content_hash: ContentHash,
    pub size: usize,
}

/// Version listing entry (snapshot without its payload)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSummary {
    pub version_id: VersionId,
    pub entity_key: String,
    pub change_type: ChangeType,
    pub timestamp: DateTime<Utc>,
    pub changed_by: String,
    pub content_hash: ContentHash,
    pub size: usize,
}

impl VersionSnapshot {
    /// Metadata view used by version listings
    #[must_use]
    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            version_id: self.version_id.clone(),
            entity_key: self.entity_key.clone(),
            change_type: self.change_type,
            timestamp: self.timestamp,
            changed_by: self.changed_by.clone(),
            content_hash: self.content_hash,
            size: self.size,
        }
    }
}

/// Context recorded alongside a quarantined instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletionMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<ContainerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_exists: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ReferenceEntry>,
}

/// Quarantined instance awaiting restore or expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedEntry {
    pub consumer_id: ConsumerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<InstanceConfig>,
    pub deleted_at: DateTime<Utc>,
    pub deleted_by: String,
    pub deletion_reason: String,
    pub can_recover: bool,
    #[serde(flatten)]
    pub metadata: DeletionMetadata,
    pub expires_at: DateTime<Utc>,
}

/// Metadata record of a full backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    pub backup_id: BackupId,
    pub created_at: DateTime<Utc>,
    pub operation: String,
    pub total_entities: usize,
}

/// One instance config captured by a backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntity {
    pub backup_id: BackupId,
    pub consumer_id: ConsumerId,
    pub config: InstanceConfig,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn entry(consumer: &str, minutes: i64) -> ReferenceEntry {
        ReferenceEntry {
            consumer_id: consumer.into(),
            container_id: "C1".into(),
            container_title: "Page".to_string(),
            anchor: None,
            variable_values: VariableValues::new(),
            toggle_states: ToggleStates::new(),
            updated_at: DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(minutes),
        }
    }

    fn source(content: &str) -> SourceEntity {
        let now = Utc::now();
        SourceEntity {
            id: "S1".into(),
            name: "Intro".to_string(),
            category: Some("general".to_string()),
            content: content.to_string(),
            variables: vec![Variable {
                name: "customer".to_string(),
                description: None,
            }],
            toggles: Vec::new(),
            content_hash: None,
            updated_at: now,
            created_at: now,
        }
    }

    #[test]
    fn reference_index_upsert_keeps_one_entry_per_consumer() {
        let mut index = ReferenceIndex::new("S1".into());
        index.upsert(entry("E1", 1));
        index.upsert(entry("E2", 1));
        index.upsert(entry("E1", 5));

        assert_eq!(index.references.len(), 2);
        assert_eq!(
            index.find(&"E1".into()).map(|e| e.updated_at),
            Some(DateTime::<Utc>::UNIX_EPOCH + Duration::minutes(5))
        );
    }

    #[test]
    fn reference_index_remove() {
        let mut index = ReferenceIndex::new("S1".into());
        index.upsert(entry("E1", 1));

        assert!(index.remove(&"E2".into()).is_none());
        assert!(index.remove(&"E1".into()).is_some());
        assert!(index.is_empty());
    }

    #[test]
    fn source_hash_ignores_timestamps() {
        let a = source("Hello {customer}");
        let mut b = a.clone();
        b.updated_at = a.updated_at + Duration::days(3);
        assert!(a.is_noop_update(&b).unwrap());

        let c = source("Goodbye {customer}");
        assert!(!a.is_noop_update(&c).unwrap());
    }

    #[test]
    fn staleness_boundary_is_not_stale() {
        let t = Utc::now();
        assert!(!is_stale(t, Some(t)));
        assert!(is_stale(t + Duration::milliseconds(1), Some(t)));
        assert!(is_stale(t, None));
    }

    #[test]
    fn instance_config_blank_source_is_unresolved() {
        let config = InstanceConfig {
            source_id: Some(SourceId::new(" ")),
            variable_values: VariableValues::new(),
            toggle_states: ToggleStates::new(),
            custom_insertions: Vec::new(),
            updated_at: Utc::now(),
            last_synced: None,
        };
        assert!(config.resolved_source_id().is_none());
    }

    #[test]
    fn deleted_entry_flattens_metadata() {
        let now = Utc::now();
        let deleted = DeletedEntry {
            consumer_id: "E1".into(),
            config: None,
            deleted_at: now,
            deleted_by: "reconciliation".to_string(),
            deletion_reason: "container deleted".to_string(),
            can_recover: false,
            metadata: DeletionMetadata {
                container_id: Some("C2".into()),
                container_exists: Some(false),
                source_id: None,
                reference: None,
            },
            expires_at: now,
        };
        let json = serde_json::to_value(&deleted).unwrap();
        assert_eq!(json["containerId"], "C2");
        assert_eq!(json["containerExists"], false);

        let back: DeletedEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, deleted);
    }

    proptest! {
        #[test]
        fn staleness_law(source_ms in 0i64..4_000_000_000_000, synced_ms in 0i64..4_000_000_000_000) {
            let updated = DateTime::from_timestamp_millis(source_ms).unwrap();
            let synced = DateTime::from_timestamp_millis(synced_ms).unwrap();
            prop_assert_eq!(is_stale(updated, Some(synced)), source_ms > synced_ms);
        }
    }
}
