//! Key namespaces and the tagged record union
//!
//! Every storage key is `<prefix>:<id>`. The prefix decides which record type
//! the value must decode as; [`Record::decode`] is the single place raw JSON
//! becomes a typed value.

use crate::entities::{
    BackupEntity, BackupMetadata, CacheEntry, DeletedEntry, InstanceConfig, ReferenceIndex,
    SourceEntity, VersionSnapshot,
};
use crate::error::ModelError;
use crate::progress::ProgressRecord;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Key namespace, derived from the key prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    Source,
    ReferenceIndex,
    InstanceConfig,
    Cache,
    Version,
    Deleted,
    BackupMeta,
    BackupData,
    Progress,
    /// Internal: fragments of values too large for one storage slot
    Chunk,
}

impl Namespace {
    /// Separator between prefix and id
    pub const SEPARATOR: char = ':';

    /// Every namespace
    pub const ALL: [Namespace; 10] = [
        Namespace::Source,
        Namespace::ReferenceIndex,
        Namespace::InstanceConfig,
        Namespace::Cache,
        Namespace::Version,
        Namespace::Deleted,
        Namespace::BackupMeta,
        Namespace::BackupData,
        Namespace::Progress,
        Namespace::Chunk,
    ];

    /// Key prefix (without separator)
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Namespace::Source => "source",
            Namespace::ReferenceIndex => "usage",
            Namespace::InstanceConfig => "macro-vars",
            Namespace::Cache => "macro-cache",
            Namespace::Version => "version",
            Namespace::Deleted => "deleted",
            Namespace::BackupMeta => "backup-meta",
            Namespace::BackupData => "backup-data",
            Namespace::Progress => "progress",
            Namespace::Chunk => "chunk",
        }
    }

    /// Full key for an id in this namespace
    #[must_use]
    pub fn key(self, id: impl fmt::Display) -> String {
        format!("{}{}{}", self.prefix(), Self::SEPARATOR, id)
    }

    /// Prefix that selects every key of this namespace
    #[must_use]
    pub fn scan_prefix(self) -> String {
        format!("{}{}", self.prefix(), Self::SEPARATOR)
    }

    /// Namespace a key belongs to
    ///
    /// # Errors
    /// Returns `ModelError::UnknownNamespace` for unrecognised prefixes
    pub fn of_key(key: &str) -> Result<Self, ModelError> {
        let (prefix, _) = key
            .split_once(Self::SEPARATOR)
            .ok_or_else(|| ModelError::UnknownNamespace(key.to_string()))?;
        Self::ALL
            .into_iter()
            .find(|ns| ns.prefix() == prefix)
            .ok_or_else(|| ModelError::UnknownNamespace(key.to_string()))
    }

    /// Id part of a key in this namespace
    #[must_use]
    pub fn id_of(self, key: &str) -> Option<&str> {
        key.strip_prefix(self.prefix())
            .and_then(|rest| rest.strip_prefix(Self::SEPARATOR))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A stored type bound to exactly one namespace
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Namespace this type lives in
    const NAMESPACE: Namespace;

    /// Storage key for an id
    fn key(id: impl fmt::Display) -> String {
        Self::NAMESPACE.key(id)
    }
}

impl Entity for SourceEntity {
    const NAMESPACE: Namespace = Namespace::Source;
}

impl Entity for ReferenceIndex {
    const NAMESPACE: Namespace = Namespace::ReferenceIndex;
}

impl Entity for InstanceConfig {
    const NAMESPACE: Namespace = Namespace::InstanceConfig;
}

impl Entity for CacheEntry {
    const NAMESPACE: Namespace = Namespace::Cache;
}

impl Entity for VersionSnapshot {
    const NAMESPACE: Namespace = Namespace::Version;
}

impl Entity for DeletedEntry {
    const NAMESPACE: Namespace = Namespace::Deleted;
}

impl Entity for BackupMetadata {
    const NAMESPACE: Namespace = Namespace::BackupMeta;
}

impl Entity for BackupEntity {
    const NAMESPACE: Namespace = Namespace::BackupData;
}

impl Entity for ProgressRecord {
    const NAMESPACE: Namespace = Namespace::Progress;
}

/// Any stored value, tagged by namespace
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Source(SourceEntity),
    ReferenceIndex(ReferenceIndex),
    InstanceConfig(InstanceConfig),
    Cache(CacheEntry),
    Version(Box<VersionSnapshot>),
    Deleted(Box<DeletedEntry>),
    BackupMeta(BackupMetadata),
    BackupData(BackupEntity),
    Progress(Box<ProgressRecord>),
}

impl Record {
    /// Decode a raw value according to its key's namespace
    ///
    /// # Errors
    /// - `ModelError::UnknownNamespace` for unrecognised keys
    /// - `ModelError::InvalidRecord` when the value has the wrong shape, or
    ///   the key is an internal chunk key
    pub fn decode(key: &str, value: Value) -> Result<Self, ModelError> {
        fn typed<T: Entity>(key: &str, value: Value) -> Result<T, ModelError> {
            serde_json::from_value(value).map_err(|e| ModelError::invalid_record(key, e.to_string()))
        }

        Ok(match Namespace::of_key(key)? {
            Namespace::Source => Record::Source(typed(key, value)?),
            Namespace::ReferenceIndex => Record::ReferenceIndex(typed(key, value)?),
            Namespace::InstanceConfig => Record::InstanceConfig(typed(key, value)?),
            Namespace::Cache => Record::Cache(typed(key, value)?),
            Namespace::Version => Record::Version(Box::new(typed(key, value)?)),
            Namespace::Deleted => Record::Deleted(Box::new(typed(key, value)?)),
            Namespace::BackupMeta => Record::BackupMeta(typed(key, value)?),
            Namespace::BackupData => Record::BackupData(typed(key, value)?),
            Namespace::Progress => Record::Progress(Box::new(typed(key, value)?)),
            Namespace::Chunk => {
                return Err(ModelError::invalid_record(
                    key,
                    "chunk fragments are not standalone records",
                ))
            }
        })
    }

    /// Namespace of this record
    #[must_use]
    pub fn namespace(&self) -> Namespace {
        match self {
            Record::Source(_) => Namespace::Source,
            Record::ReferenceIndex(_) => Namespace::ReferenceIndex,
            Record::InstanceConfig(_) => Namespace::InstanceConfig,
            Record::Cache(_) => Namespace::Cache,
            Record::Version(_) => Namespace::Version,
            Record::Deleted(_) => Namespace::Deleted,
            Record::BackupMeta(_) => Namespace::BackupMeta,
            Record::BackupData(_) => Namespace::BackupData,
            Record::Progress(_) => Namespace::Progress,
        }
    }

    /// Encode back to raw JSON
    ///
    /// # Errors
    /// Returns error if encoding fails
    pub fn to_value(&self) -> Result<Value, ModelError> {
        let value = match self {
            Record::Source(v) => serde_json::to_value(v)?,
            Record::ReferenceIndex(v) => serde_json::to_value(v)?,
            Record::InstanceConfig(v) => serde_json::to_value(v)?,
            Record::Cache(v) => serde_json::to_value(v)?,
            Record::Version(v) => serde_json::to_value(v)?,
            Record::Deleted(v) => serde_json::to_value(v)?,
            Record::BackupMeta(v) => serde_json::to_value(v)?,
            Record::BackupData(v) => serde_json::to_value(v)?,
            Record::Progress(v) => serde_json::to_value(v)?,
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prefixes_are_unique_and_roundtrip() {
        for ns in Namespace::ALL {
            let key = ns.key("abc");
            assert_eq!(Namespace::of_key(&key).unwrap(), ns);
            assert_eq!(ns.id_of(&key), Some("abc"));
        }
    }

    #[test]
    fn similar_prefixes_do_not_collide() {
        assert_eq!(
            Namespace::of_key("macro-vars:E1").unwrap(),
            Namespace::InstanceConfig
        );
        assert_eq!(Namespace::of_key("macro-cache:E1").unwrap(), Namespace::Cache);
        assert_eq!(Namespace::InstanceConfig.id_of("macro-cache:E1"), None);
    }

    #[test]
    fn unknown_prefix_is_rejected() {
        assert!(matches!(
            Namespace::of_key("settings:x"),
            Err(ModelError::UnknownNamespace(_))
        ));
        assert!(Namespace::of_key("no-separator").is_err());
    }

    #[test]
    fn decode_validates_shape() {
        let ok = Record::decode(
            "usage:S1",
            json!({"sourceId": "S1", "references": []}),
        )
        .unwrap();
        assert_eq!(ok.namespace(), Namespace::ReferenceIndex);

        let bad = Record::decode("macro-vars:E1", json!({"sourceId": 7}));
        assert!(matches!(bad, Err(ModelError::InvalidRecord { .. })));
    }

    #[test]
    fn chunk_keys_are_not_records() {
        assert!(Record::decode("chunk:usage:S1:0", json!("abc")).is_err());
    }

    #[test]
    fn entity_keys_use_namespace_prefix() {
        assert_eq!(InstanceConfig::key("E1"), "macro-vars:E1");
        assert_eq!(ReferenceIndex::key("S1"), "usage:S1");
    }
}
