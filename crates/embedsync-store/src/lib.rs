//! Embedsync storage layer
//!
//! Seams to the two platform services the subsystem depends on, plus the
//! record store every other crate writes through.
//!
//! # Core Concepts
//!
//! - [`Storage`]: raw key-value backend with a per-value size ceiling
//! - [`RecordStore`]: typed access keyed by [`embedsync_model::Namespace`],
//!   validating raw writes and chunking values over the ceiling
//! - [`DocumentService`]: container existence and content lookup
//!
//! # Example
//!
//! ```rust,ignore
//! use embedsync_store::{MemoryStorage, RecordStore};
//! use embedsync_model::ReferenceIndex;
//! use std::sync::Arc;
//!
//! let records = RecordStore::new(Arc::new(MemoryStorage::new()));
//! let index: Option<ReferenceIndex> = records.load("S1").await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod config;
mod document;
mod error;
mod records;
mod storage;

pub use config::StoreConfig;
pub use document::{ContainerLookup, DocumentError, DocumentService, StaticDocumentService};
pub use error::{StoreError, StoreResult};
pub use records::{RecordStore, RejectedRecord, Scan};
pub use storage::{MemoryStorage, Storage, StorageError, DEFAULT_MAX_VALUE_BYTES};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
