//! Embedsync recovery managers
//!
//! Everything a destructive reconciliation run needs to be undoable.
//!
//! # Core Concepts
//!
//! - [`VersionManager`]: append-only snapshots per entity key, deduplicated
//!   by content hash, pruned after a retention window
//! - [`SoftDeleteManager`]: quarantine with recovery metadata and a recorded
//!   expiry
//! - [`BackupManager`]: full copies of every live instance config
//!
//! Snapshot failures on a destructive path are demoted to warnings unless a
//! manager is configured to block on them.
//!
//! # Example
//!
//! ```rust,ignore
//! use embedsync_recovery::{VersionManager, VersionMeta};
//!
//! let versions = VersionManager::new(records);
//! let outcome = versions
//!     .save_version("macro-vars:E1", &data, &VersionMeta::update("admin"))
//!     .await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod backup;
mod error;
mod soft_delete;
mod versions;

pub use backup::BackupManager;
pub use error::{BackupError, SoftDeleteError, VersionError, VersionResult};
pub use soft_delete::{
    RestoreDeletedOutcome, SoftDeleteManager, SoftDeleteOutcome, DEFAULT_QUARANTINE_TTL_DAYS,
};
pub use versions::{PruneReport, RestoreReceipt, SaveOutcome, VersionManager, VersionMeta};

/// Default snapshot retention
pub const DEFAULT_RETENTION_DAYS: u32 = 14;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
