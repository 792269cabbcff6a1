//! Progress reporting for reconciliation jobs
//!
//! One `progress:<id>` record per job, overwritten on every update. Writes go
//! through a single mutex so concurrent container checks cannot interleave
//! them, and the percent never moves backwards within a run.

use crate::error::ReconcileResult;
use chrono::Utc;
use embedsync_model::{
    validate_transition, JobId, Phase, ProgressId, ProgressRecord, ReconcileSummary,
};
use embedsync_store::RecordStore;
use tokio::sync::Mutex;

/// Serialized writer for one job's progress record
#[derive(Debug)]
pub struct ProgressReporter {
    records: RecordStore,
    progress_id: ProgressId,
    state: Mutex<ProgressRecord>,
}

impl ProgressReporter {
    /// Write a `queued` record and return its reporter
    ///
    /// # Errors
    /// Returns error if the record cannot be written
    pub async fn start(
        records: RecordStore,
        progress_id: ProgressId,
        job_id: JobId,
        dry_run: bool,
    ) -> ReconcileResult<Self> {
        let record = ProgressRecord::queued(job_id, dry_run);
        records.save(&progress_id, &record).await?;
        Ok(Self {
            records,
            progress_id,
            state: Mutex::new(record),
        })
    }

    /// Progress id this reporter writes to
    #[inline]
    #[must_use]
    pub fn progress_id(&self) -> &ProgressId {
        &self.progress_id
    }

    /// Copy of the last written record
    pub async fn current(&self) -> ProgressRecord {
        self.state.lock().await.clone()
    }

    /// Move to a new phase
    ///
    /// # Errors
    /// - `ReconcileError::Model` for a transition the state machine forbids
    /// - `ReconcileError::Store` if the record cannot be written
    pub async fn advance(&self, phase: Phase, percent: u8, status: impl Into<String>) -> ReconcileResult<()> {
        let mut state = self.state.lock().await;
        validate_transition(state.phase, phase)?;
        tracing::info!(progress = %self.progress_id, phase = %phase, "phase started");
        let mut next = state.clone();
        next.phase = phase;
        self.write(&mut state, next, percent, status.into()).await
    }

    /// Set the number of work units in the current phase
    ///
    /// # Errors
    /// Returns error if the record cannot be written
    pub async fn set_total(&self, total: usize, status: impl Into<String>) -> ReconcileResult<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.total = total;
        next.processed = 0;
        let percent = state.percent;
        self.write(&mut state, next, percent, status.into()).await
    }

    /// Record processed units without changing phase
    ///
    /// # Errors
    /// Returns error if the record cannot be written
    pub async fn record_processed(
        &self,
        processed: usize,
        percent: u8,
        status: impl Into<String>,
    ) -> ReconcileResult<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        next.processed = state.processed.max(processed);
        self.write(&mut state, next, percent, status.into()).await
    }

    /// Terminal success: `complete`, 100 percent, results attached
    ///
    /// # Errors
    /// Returns error on an illegal transition or failed write
    pub async fn complete(&self, summary: ReconcileSummary) -> ReconcileResult<()> {
        let mut state = self.state.lock().await;
        validate_transition(state.phase, Phase::Complete)?;
        let mut next = state.clone();
        next.phase = Phase::Complete;
        next.results = Some(summary);
        self.write(&mut state, next, 100, "Complete".to_string()).await
    }

    /// Terminal failure: `error` with message, partial results and counts kept
    ///
    /// A failed write is logged; there is nothing further to report it to.
    pub async fn fail(&self, message: &str, status: &str, partial: ReconcileSummary) {
        let mut state = self.state.lock().await;
        if state.phase.is_terminal() {
            tracing::warn!(progress = %self.progress_id, phase = %state.phase, "job already finished");
            return;
        }
        let mut next = state.clone();
        next.phase = Phase::Error;
        next.error = Some(message.to_string());
        next.results = Some(partial);
        let percent = state.percent;
        if let Err(e) = self.write(&mut state, next, percent, status.to_string()).await {
            tracing::error!(progress = %self.progress_id, error = %e, "could not record job failure");
        }
    }

    /// Persist `next`, then make it the current state
    ///
    /// On a failed write the in-memory record keeps its last persisted value.
    async fn write(
        &self,
        state: &mut ProgressRecord,
        mut next: ProgressRecord,
        percent: u8,
        status: String,
    ) -> ReconcileResult<()> {
        next.percent = state.percent.max(percent.min(100));
        next.status = status;
        next.updated_at = Utc::now();
        self.records.save(&self.progress_id, &next).await?;
        *state = next;
        Ok(())
    }
}

/// Percent for `processed` of `total` containers within the checking band
#[must_use]
pub fn checking_percent(processed: usize, total: usize) -> u8 {
    const START: usize = 20;
    const SPAN: usize = 75;
    if total == 0 {
        return u8::try_from(START + SPAN).unwrap_or(95);
    }
    let done = processed.min(total);
    u8::try_from(START + SPAN * done / total).unwrap_or(95)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReconcileError;
    use embedsync_store::MemoryStorage;
    use embedsync_test_utils::FaultyStorage;
    use proptest::prelude::*;
    use std::sync::Arc;

    async fn reporter() -> (RecordStore, ProgressReporter) {
        let records = RecordStore::new(Arc::new(MemoryStorage::new()));
        let reporter = ProgressReporter::start(records.clone(), "P1".into(), JobId::new(), true)
            .await
            .unwrap();
        (records, reporter)
    }

    #[tokio::test]
    async fn percent_never_decreases() {
        let (records, reporter) = reporter().await;
        reporter.advance(Phase::Initializing, 0, "Starting").await.unwrap();
        reporter.advance(Phase::Backup, 5, "Backup").await.unwrap();
        reporter.record_processed(0, 2, "late update").await.unwrap();

        let stored: ProgressRecord = records.load("P1").await.unwrap().unwrap();
        assert_eq!(stored.percent, 5);
        assert_eq!(stored.status, "late update");
    }

    #[tokio::test]
    async fn illegal_transition_is_rejected() {
        let (_, reporter) = reporter().await;
        let err = reporter.advance(Phase::Checking, 20, "skip ahead").await.unwrap_err();
        assert!(matches!(err, ReconcileError::Model(_)));
        assert_eq!(reporter.current().await.phase, Phase::Queued);
    }

    #[tokio::test]
    async fn failure_keeps_counts() {
        let (records, reporter) = reporter().await;
        reporter.advance(Phase::Initializing, 0, "Starting").await.unwrap();
        reporter.set_total(10, "Checking").await.unwrap();
        reporter.record_processed(4, 50, "4/10").await.unwrap();
        reporter
            .fail("boom", "failed", ReconcileSummary::new(JobId::new(), true))
            .await;

        let stored: ProgressRecord = records.load("P1").await.unwrap().unwrap();
        assert_eq!(stored.phase, Phase::Error);
        assert_eq!((stored.processed, stored.total), (4, 10));
        assert_eq!(stored.error.as_deref(), Some("boom"));
        assert!(stored.results.is_some());
    }

    #[tokio::test]
    async fn unpersisted_completion_can_still_fail() {
        let storage = Arc::new(FaultyStorage::new());
        let records = RecordStore::new(storage.clone());
        let reporter = ProgressReporter::start(records.clone(), "P1".into(), JobId::new(), false)
            .await
            .unwrap();
        for (phase, percent) in [
            (Phase::Initializing, 0),
            (Phase::Backup, 5),
            (Phase::Fetching, 10),
            (Phase::Collecting, 15),
            (Phase::Checking, 20),
            (Phase::Finalizing, 95),
        ] {
            reporter.advance(phase, percent, "step").await.unwrap();
        }

        storage.fail_writes_with_prefix("progress:");
        let summary = ReconcileSummary::new(JobId::new(), false);
        assert!(reporter.complete(summary.clone()).await.is_err());
        assert_eq!(reporter.current().await.phase, Phase::Finalizing);

        storage.clear_faults();
        reporter.fail("progress write failed", "failed", summary).await;

        let stored: ProgressRecord = records.load("P1").await.unwrap().unwrap();
        assert_eq!(stored.phase, Phase::Error);
        assert_eq!(stored.error.as_deref(), Some("progress write failed"));
        assert_eq!(stored.percent, 95);
    }

    proptest! {
        #[test]
        fn checking_percent_stays_in_band(processed in 0usize..500, total in 0usize..500) {
            let p = checking_percent(processed, total);
            prop_assert!((20..=95).contains(&p));
            if total > 0 && processed < total {
                prop_assert!(checking_percent(processed, total) <= checking_percent(processed + 1, total));
            }
        }
    }
}
