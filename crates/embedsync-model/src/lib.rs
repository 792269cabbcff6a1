//! Embedsync record model
//!
//! Typed records for the embed reference graph: source fragments, their
//! reverse indices, per-instance configs and caches, plus the recovery
//! records (version snapshots, quarantine entries, backups) and job progress.
//!
//! # Core Concepts
//!
//! - [`Namespace`]: key prefix that fixes the record type stored under a key
//! - [`Record`]: tagged union decoded at the storage boundary
//! - [`ContentHash`]: Blake3 digest over canonical JSON, used for no-op and
//!   duplicate-snapshot detection
//! - [`ContentNode`]: container content tree with a single node-id predicate
//! - [`Phase`] / [`ProgressRecord`]: reconciliation job state machine
//!
//! # Example
//!
//! ```rust,ignore
//! use embedsync_model::{Namespace, Record};
//!
//! let record = Record::decode("usage:S1", raw_json)?;
//! assert_eq!(record.namespace(), Namespace::ReferenceIndex);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod content;
mod entities;
mod error;
mod hash;
mod ids;
mod namespace;
mod progress;
mod report;

pub use content::{Container, ContentNode, EMBED_NODE_TYPE};
pub use entities::{
    is_stale, BackupEntity, BackupMetadata, CacheEntry, ChangeType, CustomInsertion,
    DeletedEntry, DeletionMetadata, InstanceConfig, ReferenceEntry, ReferenceIndex,
    SourceEntity, Toggle, ToggleStates, Variable, VariableValues, VersionSnapshot,
    VersionSummary,
};
pub use error::ModelError;
pub use hash::{ContentHash, HashError};
pub use ids::{BackupId, ConsumerId, ContainerId, JobId, ProgressId, SourceId, VersionId};
pub use namespace::{Entity, Namespace, Record};
pub use progress::{allowed_transitions, validate_transition, Phase, ProgressRecord};
pub use report::{
    ContainerError, DuplicateReference, InstanceOutcome, InstanceReport, ReconcileSummary,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
