//! Embedsync reconciliation and recovery
//!
//! Background reconciliation of the embed reference graph against the
//! document service, with every destructive step preceded by a backup or a
//! version snapshot so it can be undone.
//!
//! # Core Concepts
//!
//! - [`ReconciliationWorker`]: the phase pipeline (backup, fetch, collect,
//!   check per container, finalize)
//! - [`JobQueue`] / [`JobHandle`]: spawn a run, cancel it, await its summary
//! - [`ProgressReporter`]: the single progress record callers poll
//! - [`Resolvers`]: caller-facing version, quarantine and backup operations
//! - [`InvalidationScheduler`]: debounced cache invalidation after restores
//!
//! Runs are dry by default. A dry run classifies everything and writes only
//! its progress record.
//!
//! # Example
//!
//! ```rust,ignore
//! use embedsync_core::{EmbedSync, ReconcileConfig};
//!
//! let sync = EmbedSync::new(records, documents, ReconcileConfig::default());
//! let job = sync.queue().enqueue("nightly".into(), false).await?;
//! let summary = job.join().await?;
//! println!("removed {}", summary.orphaned_entries_removed);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod cancel;
mod config;
mod error;
mod invalidation;
mod progress;
mod queue;
mod resolvers;
mod worker;

pub use cancel::CancelToken;
pub use config::ReconcileConfig;
pub use error::{ReconcileError, ReconcileResult, ResolverError};
pub use invalidation::InvalidationScheduler;
pub use progress::{checking_percent, ProgressReporter};
pub use queue::{JobHandle, JobQueue};
pub use resolvers::{PurgeReport, Resolvers};
pub use worker::ReconciliationWorker;

use embedsync_recovery::VersionManager;
use embedsync_store::{DocumentService, RecordStore};
use std::sync::Arc;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Worker, queue and resolvers wired to one store and one version history
#[derive(Debug)]
pub struct EmbedSync {
    records: RecordStore,
    worker: Arc<ReconciliationWorker>,
    queue: JobQueue,
    resolvers: Resolvers,
}

impl EmbedSync {
    /// Wire the subsystem together
    #[must_use]
    pub fn new(records: RecordStore, documents: Arc<dyn DocumentService>, config: ReconcileConfig) -> Self {
        let versions = Arc::new(VersionManager::new(records.clone()));
        let worker = Arc::new(ReconciliationWorker::new(
            records.clone(),
            documents,
            versions.clone(),
            config.clone(),
        ));
        let queue = JobQueue::new(worker.clone(), records.clone());
        let resolvers = Resolvers::new(records.clone(), versions, config);
        Self {
            records,
            worker,
            queue,
            resolvers,
        }
    }

    /// Record store
    #[inline]
    #[must_use]
    pub fn records(&self) -> &RecordStore {
        &self.records
    }

    /// Reconciliation worker
    #[inline]
    #[must_use]
    pub fn worker(&self) -> &Arc<ReconciliationWorker> {
        &self.worker
    }

    /// Job queue
    #[inline]
    #[must_use]
    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Recovery resolvers
    #[inline]
    #[must_use]
    pub fn resolvers(&self) -> &Resolvers {
        &self.resolvers
    }
}
