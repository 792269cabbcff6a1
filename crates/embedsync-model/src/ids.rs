//! Identifier newtypes
//!
//! String identifiers (`SourceId`, `ConsumerId`, `ContainerId`, `ProgressId`)
//! are assigned by the editing platform and stored verbatim. Identifiers this
//! subsystem mints itself are ULIDs (sortable by creation time) or UUIDs.

use crate::error::ModelError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Wrap a raw identifier
            #[inline]
            #[must_use]
            pub fn new(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            /// Borrow the raw identifier
            #[inline]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// True when the identifier is empty or whitespace
            #[inline]
            #[must_use]
            pub fn is_blank(&self) -> bool {
                self.0.trim().is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(raw: &str) -> Self {
                Self(raw.to_string())
            }
        }

        impl From<String> for $name {
            fn from(raw: String) -> Self {
                Self(raw)
            }
        }
    };
}

string_id!(
    /// Identifier of a reusable content fragment
    SourceId
);
string_id!(
    /// Identifier of one embed placement (stable node id inside its container)
    ConsumerId
);
string_id!(
    /// Identifier of a page hosting embeds
    ContainerId
);
string_id!(
    /// Caller-chosen key under which a job's progress is published
    ProgressId
);

/// Identifier of a reconciliation job run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate new job ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a full backup snapshot (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BackupId(pub Ulid);

impl BackupId {
    /// Generate new backup ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for BackupId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BackupId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| ModelError::InvalidId(format!("backup id '{s}': {e}")))
    }
}

/// Identifier of one version snapshot
///
/// Rendered as `<entity-key>#<ulid>`. The entity key is the storage key of the
/// snapshotted value; the ULID orders snapshots of the same entity by time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionId {
    entity_key: String,
    ulid: Ulid,
}

impl VersionId {
    /// Separator between entity key and ULID
    pub const SEPARATOR: char = '#';

    /// Build from parts
    #[inline]
    #[must_use]
    pub fn new(entity_key: impl Into<String>, ulid: Ulid) -> Self {
        Self {
            entity_key: entity_key.into(),
            ulid,
        }
    }

    /// Storage key of the snapshotted entity
    #[inline]
    #[must_use]
    pub fn entity_key(&self) -> &str {
        &self.entity_key
    }

    /// Time-ordered component
    #[inline]
    #[must_use]
    pub fn ulid(&self) -> Ulid {
        self.ulid
    }

    /// Creation time encoded in the ULID
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        let millis = i64::try_from(self.ulid.timestamp_ms()).unwrap_or(i64::MAX);
        DateTime::from_timestamp_millis(millis).unwrap_or_default()
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.entity_key, Self::SEPARATOR, self.ulid)
    }
}

impl FromStr for VersionId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (entity_key, raw_ulid) = s
            .rsplit_once(Self::SEPARATOR)
            .ok_or_else(|| ModelError::InvalidId(format!("version id '{s}' has no separator")))?;
        if entity_key.is_empty() {
            return Err(ModelError::InvalidId(format!(
                "version id '{s}' has an empty entity key"
            )));
        }
        let ulid = Ulid::from_string(raw_ulid)
            .map_err(|e| ModelError::InvalidId(format!("version id '{s}': {e}")))?;
        Ok(Self::new(entity_key, ulid))
    }
}

impl Serialize for VersionId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for VersionId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_ids_detect_blank() {
        assert!(SourceId::new("").is_blank());
        assert!(SourceId::new("  ").is_blank());
        assert!(!SourceId::new("S1").is_blank());
    }

    #[test]
    fn version_id_roundtrips_with_colon_keys() {
        let id = VersionId::new("macro-vars:abc", Ulid::new());
        let parsed: VersionId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert_eq!(parsed.entity_key(), "macro-vars:abc");
    }

    #[test]
    fn version_id_rejects_garbage() {
        assert!("no-separator".parse::<VersionId>().is_err());
        assert!("#01ARZ3NDEKTSV4RRFFQ69G5FAV".parse::<VersionId>().is_err());
        assert!("key#not-a-ulid".parse::<VersionId>().is_err());
    }

    #[test]
    fn version_id_orders_by_time_within_entity() {
        let early = VersionId::new("k", Ulid::from_parts(1_000, 0));
        let late = VersionId::new("k", Ulid::from_parts(2_000, 0));
        assert!(early < late);
        assert_eq!(late.created_at().timestamp_millis(), 2_000);
    }

    #[test]
    fn job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }
}
