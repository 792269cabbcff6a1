//! Job queue for reconciliation runs
//!
//! `enqueue` writes the `queued` progress record, spawns the worker on the
//! tokio runtime and returns at once. Callers poll the progress record or
//! hold on to the [`JobHandle`].

use crate::cancel::CancelToken;
use crate::error::{ReconcileError, ReconcileResult};
use crate::progress::ProgressReporter;
use crate::worker::ReconciliationWorker;
use embedsync_model::{JobId, ProgressId, ReconcileSummary};
use embedsync_store::RecordStore;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Handle to a spawned reconciliation run
#[derive(Debug)]
pub struct JobHandle {
    job_id: JobId,
    progress_id: ProgressId,
    cancel: CancelToken,
    task: JoinHandle<ReconcileResult<ReconcileSummary>>,
}

impl JobHandle {
    /// Job id recorded on the progress record
    #[inline]
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Progress record key id
    #[inline]
    #[must_use]
    pub fn progress_id(&self) -> &ProgressId {
        &self.progress_id
    }

    /// Stop the run before its next container
    pub fn cancel(&self) {
        tracing::info!(job = %self.job_id, "cancellation requested");
        self.cancel.cancel();
    }

    /// True once the worker task has returned
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the run to finish
    ///
    /// # Errors
    /// Returns the run's fatal error, or `ReconcileError::JobAborted` if the
    /// task panicked
    pub async fn join(self) -> ReconcileResult<ReconcileSummary> {
        self.task
            .await
            .map_err(|e| ReconcileError::JobAborted(e.to_string()))?
    }
}

/// Spawns reconciliation runs
#[derive(Debug, Clone)]
pub struct JobQueue {
    worker: Arc<ReconciliationWorker>,
    records: RecordStore,
}

impl JobQueue {
    /// Create queue
    #[inline]
    #[must_use]
    pub fn new(worker: Arc<ReconciliationWorker>, records: RecordStore) -> Self {
        Self { worker, records }
    }

    /// Start a run in the configured default mode
    ///
    /// # Errors
    /// Returns error if the `queued` record cannot be written
    pub async fn enqueue_default(&self, progress_id: ProgressId) -> ReconcileResult<JobHandle> {
        let dry_run = self.worker.config().dry_run;
        self.enqueue(progress_id, dry_run).await
    }

    /// Start a run
    ///
    /// # Errors
    /// Returns error if the `queued` record cannot be written
    pub async fn enqueue(&self, progress_id: ProgressId, dry_run: bool) -> ReconcileResult<JobHandle> {
        let job_id = JobId::new();
        let reporter =
            ProgressReporter::start(self.records.clone(), progress_id.clone(), job_id, dry_run).await?;
        let cancel = CancelToken::new();

        let worker = self.worker.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { worker.execute(&reporter, dry_run, &token).await });

        tracing::info!(job = %job_id, progress = %progress_id, dry_run, "reconciliation enqueued");
        Ok(JobHandle {
            job_id,
            progress_id,
            cancel,
            task,
        })
    }
}
