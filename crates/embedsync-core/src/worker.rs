//! Reconciliation worker
//!
//! Walks the whole reference graph and checks it against the document
//! service:
//!
//! ```text
//! initializing → backup → fetching → collecting → checking → finalizing → complete
//!                                                                  └──────→ error
//! ```
//!
//! Collection flattens every `usage:` index into one working set keyed by
//! consumer and grouped by container, so each container is fetched once.
//! Containers are checked concurrently; every index edit takes that index's
//! lock, and progress writes go through the [`ProgressReporter`] mutex.

use crate::cancel::CancelToken;
use crate::config::ReconcileConfig;
use crate::error::{ReconcileError, ReconcileResult};
use crate::progress::{checking_percent, ProgressReporter};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use embedsync_model::{
    is_stale, CacheEntry, Container, ContainerError, ContainerId, ConsumerId, DeletionMetadata,
    DuplicateReference, Entity, InstanceConfig, InstanceOutcome, InstanceReport, Phase,
    ReconcileSummary, ReferenceEntry, ReferenceIndex, SourceEntity, SourceId,
};
use embedsync_recovery::{BackupManager, SoftDeleteManager, VersionManager, VersionMeta};
use embedsync_store::{ContainerLookup, DocumentService, RecordStore, StoreError};
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

const CONTAINER_DELETED: &str = "container deleted";
const NODE_MISSING: &str = "node not found in container";
const SOURCE_DELETED: &str = "source deleted";
const SOURCE_UNRECOVERABLE: &str = "source id missing and unrecoverable";

/// Treat an undecodable per-instance record as absent and report it
///
/// Backend failures still propagate; a bad record only affects its own
/// instance.
fn tolerate_invalid<T>(
    loaded: Result<Option<T>, StoreError>,
    outcome: &mut ContainerOutcome,
    container_id: &ContainerId,
) -> ReconcileResult<Option<T>> {
    match loaded {
        Err(e) if e.is_invalid_record() => {
            tracing::warn!(container = %container_id, error = %e, "skipping undecodable record");
            outcome.errors.push(ContainerError {
                container_id: container_id.clone(),
                reason: e.to_string(),
            });
            Ok(None)
        }
        loaded => Ok(loaded?),
    }
}

/// One reference entry in the working set
#[derive(Debug, Clone)]
struct WorkItem {
    /// Id of the index holding the entry
    index_id: String,
    /// Source the index names, if any
    source_id: Option<SourceId>,
    entry: ReferenceEntry,
    /// Other indices that also listed this consumer
    superseded: Vec<String>,
}

#[derive(Debug, Default)]
struct WorkingSet {
    containers: BTreeMap<ContainerId, Vec<WorkItem>>,
    duplicates: Vec<DuplicateReference>,
}

#[derive(Debug, Default)]
struct ContainerOutcome {
    instances: Vec<InstanceReport>,
    removed: usize,
    duplicates_resolved: usize,
    errors: Vec<ContainerError>,
}

enum IndexEdit {
    Applied,
    Unchanged,
    Blocked(String),
}

struct RunState<'a> {
    dry_run: bool,
    sources: BTreeMap<SourceId, DateTime<Utc>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
    cancel: &'a CancelToken,
}

impl RunState<'_> {
    fn lock_for(&self, index_id: &str) -> Arc<Mutex<()>> {
        self.locks.entry(index_id.to_string()).or_default().clone()
    }
}

/// Multi-phase reconciliation pipeline
#[derive(Debug)]
pub struct ReconciliationWorker {
    records: RecordStore,
    documents: Arc<dyn DocumentService>,
    versions: Arc<VersionManager>,
    soft_delete: SoftDeleteManager,
    backups: BackupManager,
    config: ReconcileConfig,
}

impl ReconciliationWorker {
    /// Create worker
    #[must_use]
    pub fn new(
        records: RecordStore,
        documents: Arc<dyn DocumentService>,
        versions: Arc<VersionManager>,
        config: ReconcileConfig,
    ) -> Self {
        let soft_delete = SoftDeleteManager::new(records.clone(), versions.clone())
            .with_ttl_days(config.quarantine_ttl_days)
            .with_changed_by(config.changed_by.clone())
            .with_block_on_snapshot_failure(config.block_on_snapshot_failure);
        let backups = BackupManager::new(records.clone(), versions.clone())
            .with_changed_by(config.changed_by.clone());
        Self {
            records,
            documents,
            versions,
            soft_delete,
            backups,
            config,
        }
    }

    /// Worker configuration
    #[inline]
    #[must_use]
    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    /// Run all phases and write the terminal progress record
    ///
    /// On failure the progress record moves to `error` with the message and
    /// whatever was counted before the failure.
    ///
    /// # Errors
    /// Returns the fatal error that stopped the run
    pub async fn execute(
        &self,
        progress: &ProgressReporter,
        dry_run: bool,
        cancel: &CancelToken,
    ) -> ReconcileResult<ReconcileSummary> {
        let job_id = progress.current().await.job_id.unwrap_or_default();
        let mut summary = ReconcileSummary::new(job_id, dry_run);

        let result = match self.run(&mut summary, progress, dry_run, cancel).await {
            Ok(()) => progress.complete(summary.clone()).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                tracing::info!(
                    job = %job_id,
                    dry_run,
                    total = summary.total_checked,
                    active = summary.active_count,
                    orphaned = summary.orphaned_count,
                    broken = summary.broken_reference_count,
                    repaired = summary.repaired_reference_count,
                    stale = summary.stale_count,
                    removed = summary.orphaned_entries_removed,
                    "reconciliation complete"
                );
                Ok(summary)
            }
            Err(e) => {
                summary.tally();
                summary.finished_at = Utc::now();
                let status = if e.is_cancelled() { "cancelled" } else { "failed" };
                tracing::error!(job = %job_id, error = %e, status, "reconciliation stopped");
                progress.fail(&e.to_string(), status, summary).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        summary: &mut ReconcileSummary,
        progress: &ProgressReporter,
        dry_run: bool,
        cancel: &CancelToken,
    ) -> ReconcileResult<()> {
        progress.advance(Phase::Initializing, 0, "Initializing").await?;

        progress.advance(Phase::Backup, 5, "Creating backup").await?;
        if self.config.takes_backup(dry_run) {
            match self.backups.create_backup_snapshot("reconciliation").await {
                Ok(meta) => summary.backup_id = Some(meta.backup_id),
                Err(e) if self.config.require_backup => return Err(e.into()),
                Err(e) => tracing::warn!(error = %e, "backup failed, continuing without one"),
            }
        } else {
            tracing::debug!("backup skipped for dry run");
        }
        Self::check_cancelled(cancel)?;

        progress.advance(Phase::Fetching, 10, "Fetching sources").await?;
        let sources = self.fetch_sources().await?;
        Self::check_cancelled(cancel)?;

        progress.advance(Phase::Collecting, 15, "Collecting references").await?;
        let working = self.collect().await?;
        summary.duplicate_references = working.duplicates;
        Self::check_cancelled(cancel)?;

        let total = working.containers.len();
        progress
            .advance(Phase::Checking, 20, format!("Checking {total} containers"))
            .await?;
        progress.set_total(total, format!("Checked 0 of {total} containers")).await?;

        let state = RunState {
            dry_run,
            sources,
            locks: DashMap::new(),
            cancel,
        };
        let mut checks = stream::iter(working.containers)
            .map(|(container_id, items)| self.check_container(&state, container_id, items))
            .buffer_unordered(self.config.concurrency());

        let mut processed = 0;
        while let Some(outcome) = checks.next().await {
            let outcome = outcome?;
            processed += 1;
            summary.containers_checked += 1;
            summary.orphaned_entries_removed += outcome.removed;
            summary.duplicate_references_resolved += outcome.duplicates_resolved;
            summary.container_errors.extend(outcome.errors);
            summary.instances.extend(outcome.instances);
            progress
                .record_processed(
                    processed,
                    checking_percent(processed, total),
                    format!("Checked {processed} of {total} containers"),
                )
                .await?;
        }
        drop(checks);

        progress.advance(Phase::Finalizing, 95, "Finalizing").await?;
        summary
            .instances
            .sort_by(|a, b| (&a.container_id, &a.consumer_id).cmp(&(&b.container_id, &b.consumer_id)));
        summary
            .container_errors
            .sort_by(|a, b| a.container_id.cmp(&b.container_id));
        summary.tally();
        summary.finished_at = Utc::now();
        Ok(())
    }

    fn check_cancelled(cancel: &CancelToken) -> ReconcileResult<()> {
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        Ok(())
    }

    /// Known sources by id, with their last update
    async fn fetch_sources(&self) -> ReconcileResult<BTreeMap<SourceId, DateTime<Utc>>> {
        let scan = self.records.scan::<SourceEntity>().await?;
        if !scan.rejected.is_empty() {
            tracing::warn!(rejected = scan.rejected.len(), "ignoring malformed sources");
        }
        let sources: BTreeMap<_, _> = scan
            .records
            .into_iter()
            .map(|(id, source)| (SourceId::from(id), source.updated_at))
            .collect();
        tracing::debug!(count = sources.len(), "fetched sources");
        Ok(sources)
    }

    /// Flatten every index into one entry per consumer, grouped by container
    async fn collect(&self) -> ReconcileResult<WorkingSet> {
        let scan = self.records.scan::<ReferenceIndex>().await?;
        for rejected in &scan.rejected {
            tracing::warn!(key = %rejected.key, reason = %rejected.reason, "skipping malformed reference index");
        }

        let mut candidates: BTreeMap<ConsumerId, Vec<WorkItem>> = BTreeMap::new();
        for (index_id, index) in scan.records {
            let source_id = (!index.source_id.is_blank()).then(|| index.source_id.clone());
            for entry in index.references {
                let items = candidates.entry(entry.consumer_id.clone()).or_default();
                let item = WorkItem {
                    index_id: index_id.clone(),
                    source_id: source_id.clone(),
                    entry,
                    superseded: Vec::new(),
                };
                // Repeats inside one index: the later entry wins.
                match items.iter_mut().find(|i| i.index_id == index_id) {
                    Some(existing) => *existing = item,
                    None => items.push(item),
                }
            }
        }

        let mut working = WorkingSet::default();
        for (consumer_id, items) in candidates {
            let item = if items.len() > 1 {
                let (item, duplicate) = self.pick_winner(&consumer_id, items).await?;
                working.duplicates.push(duplicate);
                item
            } else {
                match items.into_iter().next() {
                    Some(item) => item,
                    None => continue,
                }
            };
            working
                .containers
                .entry(item.entry.container_id.clone())
                .or_default()
                .push(item);
        }

        tracing::info!(
            containers = working.containers.len(),
            duplicates = working.duplicates.len(),
            "collected references"
        );
        Ok(working)
    }

    /// Keep the entry from the index the instance config names, else the newest
    async fn pick_winner(
        &self,
        consumer_id: &ConsumerId,
        mut items: Vec<WorkItem>,
    ) -> ReconcileResult<(WorkItem, DuplicateReference)> {
        // An undecodable config is reported when the winner is classified.
        let config = match self.records.load::<InstanceConfig>(consumer_id).await {
            Err(e) if e.is_invalid_record() => None,
            loaded => loaded?,
        };
        let preferred = config.as_ref().and_then(InstanceConfig::resolved_source_id);

        let position = preferred
            .and_then(|p| items.iter().position(|i| i.source_id.as_ref() == Some(p)))
            .or_else(|| {
                items
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, i)| i.entry.updated_at)
                    .map(|(pos, _)| pos)
            })
            .unwrap_or(0);

        let mut winner = items.remove(position);
        winner.superseded = items.iter().map(|i| i.index_id.clone()).collect();

        let duplicate = DuplicateReference {
            consumer_id: consumer_id.clone(),
            kept_index: SourceId::from(winner.index_id.clone()),
            dropped_indices: winner.superseded.iter().map(|id| SourceId::from(id.as_str())).collect(),
        };
        tracing::warn!(
            consumer = %consumer_id,
            kept = %duplicate.kept_index,
            dropped = ?winner.superseded,
            "consumer referenced from multiple indices"
        );
        Ok((winner, duplicate))
    }

    async fn check_container(
        &self,
        state: &RunState<'_>,
        container_id: ContainerId,
        items: Vec<WorkItem>,
    ) -> ReconcileResult<ContainerOutcome> {
        Self::check_cancelled(state.cancel)?;
        let mut outcome = ContainerOutcome::default();

        match self.documents.get_container(&container_id).await {
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(container = %container_id, error = %reason, "container lookup failed, instances left unverified");
                for item in items {
                    let report = InstanceReport::new(
                        item.entry.consumer_id.clone(),
                        container_id.clone(),
                        InstanceOutcome::Unverified,
                    )
                    .with_title(item.entry.container_title.clone())
                    .with_source(item.source_id.clone())
                    .with_reason(reason.clone());
                    outcome.instances.push(report);
                }
                outcome.errors.push(ContainerError {
                    container_id: container_id.clone(),
                    reason,
                });
            }
            Ok(ContainerLookup::NotFound) => {
                for item in items {
                    self.orphan(state, &mut outcome, item, CONTAINER_DELETED, false).await?;
                }
            }
            Ok(ContainerLookup::Found(container)) => {
                for item in items {
                    if container.contains_consumer(&item.entry.consumer_id) {
                        self.classify(state, &mut outcome, &container, item).await?;
                    } else {
                        self.orphan(state, &mut outcome, item, NODE_MISSING, true).await?;
                    }
                }
            }
        }

        tracing::debug!(
            container = %container_id,
            instances = outcome.instances.len(),
            removed = outcome.removed,
            "container checked"
        );
        Ok(outcome)
    }

    async fn orphan(
        &self,
        state: &RunState<'_>,
        outcome: &mut ContainerOutcome,
        item: WorkItem,
        reason: &str,
        container_exists: bool,
    ) -> ReconcileResult<()> {
        let consumer_id = item.entry.consumer_id.clone();
        let container_id = item.entry.container_id.clone();
        let mut report =
            InstanceReport::new(consumer_id.clone(), container_id.clone(), InstanceOutcome::Orphaned)
                .with_title(item.entry.container_title.clone())
                .with_source(item.source_id.clone())
                .with_reason(reason);
        report.variable_values = item.entry.variable_values.clone();
        report.toggle_states = item.entry.toggle_states.clone();

        let metadata = DeletionMetadata {
            container_id: Some(container_id.clone()),
            container_exists: Some(container_exists),
            source_id: Some(SourceId::from(item.index_id.as_str())),
            reference: Some(item.entry.clone()),
        };

        match self
            .soft_delete
            .soft_delete(&consumer_id, reason, metadata, state.dry_run)
            .await
        {
            Ok(deleted) if deleted.quarantined => {
                let target = consumer_id.clone();
                match self
                    .edit_index(state, &item.index_id, move |index| index.remove(&target).is_some())
                    .await?
                {
                    IndexEdit::Applied => outcome.removed += 1,
                    IndexEdit::Unchanged => {}
                    IndexEdit::Blocked(reason) => outcome.errors.push(ContainerError {
                        container_id: container_id.clone(),
                        reason,
                    }),
                }
                self.drop_superseded(state, outcome, &item).await?;
            }
            Ok(_) => {}
            Err(e) if e.is_skippable() => {
                tracing::warn!(consumer = %consumer_id, error = %e, "quarantine skipped");
                outcome.errors.push(ContainerError {
                    container_id,
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }

        outcome.instances.push(report);
        Ok(())
    }

    async fn classify(
        &self,
        state: &RunState<'_>,
        outcome: &mut ContainerOutcome,
        container: &Container,
        item: WorkItem,
    ) -> ReconcileResult<()> {
        let consumer_id = item.entry.consumer_id.clone();
        let config = tolerate_invalid(
            self.records.load::<InstanceConfig>(&consumer_id).await,
            outcome,
            &container.id,
        )?;
        let base = InstanceReport::new(consumer_id.clone(), container.id.clone(), InstanceOutcome::Active)
            .with_title(container.title.clone());

        if let Some(source_id) = &item.source_id {
            let report = match state.sources.get(source_id) {
                Some(updated_at) => {
                    let report = self
                        .live_report(outcome, base, InstanceOutcome::Active, source_id, *updated_at, config, &item)
                        .await?;
                    self.drop_superseded(state, outcome, &item).await?;
                    report
                }
                None => broken(base, Some(source_id.clone()), SOURCE_DELETED.to_string()),
            };
            outcome.instances.push(report);
            return Ok(());
        }

        let recovered = config
            .as_ref()
            .and_then(InstanceConfig::resolved_source_id)
            .cloned();
        let resolved = recovered
            .as_ref()
            .and_then(|s| state.sources.get(s).map(|updated| (s.clone(), *updated)));

        let report = match (recovered, resolved) {
            (_, Some((source_id, updated_at))) => {
                let report = self
                    .live_report(outcome, base, InstanceOutcome::Repaired, &source_id, updated_at, config, &item)
                    .await?;
                if !state.dry_run {
                    self.repair(state, outcome, &item, &source_id).await?;
                }
                report
            }
            (Some(source_id), None) => {
                let reason = format!("recovered source {source_id} does not exist");
                broken(base, Some(source_id), reason)
            }
            (None, None) => broken(base, None, SOURCE_UNRECOVERABLE.to_string()),
        };
        outcome.instances.push(report);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn live_report(
        &self,
        outcome: &mut ContainerOutcome,
        base: InstanceReport,
        kind: InstanceOutcome,
        source_id: &SourceId,
        source_updated_at: DateTime<Utc>,
        config: Option<InstanceConfig>,
        item: &WorkItem,
    ) -> ReconcileResult<InstanceReport> {
        let mut report = base.with_source(Some(source_id.clone()));
        report.outcome = kind;
        report.source_updated_at = Some(source_updated_at);

        let last_synced = config.as_ref().and_then(|c| c.last_synced);
        report.last_synced = last_synced;
        report.is_stale = Some(is_stale(source_updated_at, last_synced));

        match config {
            Some(config) => {
                report.variable_values = config.variable_values;
                report.toggle_states = config.toggle_states;
            }
            None => {
                report.variable_values = item.entry.variable_values.clone();
                report.toggle_states = item.entry.toggle_states.clone();
            }
        }
        report.cached_content = tolerate_invalid(
            self.records.load::<CacheEntry>(&item.entry.consumer_id).await,
            outcome,
            &report.container_id,
        )?
        .map(|c| c.content);
        Ok(report)
    }

    /// Move the entry from its source-less index to the recovered source's index
    async fn repair(
        &self,
        state: &RunState<'_>,
        outcome: &mut ContainerOutcome,
        item: &WorkItem,
        source_id: &SourceId,
    ) -> ReconcileResult<()> {
        let consumer_id = item.entry.consumer_id.clone();
        let entry = item.entry.clone();
        let added = self
            .edit_index(state, source_id.as_str(), move |index| {
                if index.find(&entry.consumer_id).is_some() {
                    return false;
                }
                index.upsert(entry);
                true
            })
            .await?;
        if let IndexEdit::Blocked(reason) = added {
            outcome.errors.push(ContainerError {
                container_id: item.entry.container_id.clone(),
                reason,
            });
            return Ok(());
        }

        if item.index_id != source_id.as_str() {
            let target = consumer_id.clone();
            if let IndexEdit::Blocked(reason) = self
                .edit_index(state, &item.index_id, move |index| index.remove(&target).is_some())
                .await?
            {
                outcome.errors.push(ContainerError {
                    container_id: item.entry.container_id.clone(),
                    reason,
                });
            }
        }
        tracing::info!(consumer = %consumer_id, source = %source_id, "repaired reference");
        self.drop_superseded(state, outcome, item).await
    }

    /// Remove this consumer's entries from the indices that lost the duplicate check
    async fn drop_superseded(
        &self,
        state: &RunState<'_>,
        outcome: &mut ContainerOutcome,
        item: &WorkItem,
    ) -> ReconcileResult<()> {
        if state.dry_run {
            return Ok(());
        }
        for index_id in &item.superseded {
            let target = item.entry.consumer_id.clone();
            match self
                .edit_index(state, index_id, move |index| index.remove(&target).is_some())
                .await?
            {
                IndexEdit::Applied => outcome.duplicates_resolved += 1,
                IndexEdit::Unchanged => {}
                IndexEdit::Blocked(reason) => outcome.errors.push(ContainerError {
                    container_id: item.entry.container_id.clone(),
                    reason,
                }),
            }
        }
        Ok(())
    }

    /// Load, edit and write back one index under its lock
    ///
    /// The previous value is snapshotted first. An index left empty is deleted.
    async fn edit_index(
        &self,
        state: &RunState<'_>,
        index_id: &str,
        edit: impl FnOnce(&mut ReferenceIndex) -> bool + Send,
    ) -> ReconcileResult<IndexEdit> {
        let lock = state.lock_for(index_id);
        let _guard = lock.lock().await;

        let existing = self.records.load::<ReferenceIndex>(index_id).await?;
        let mut index = existing
            .clone()
            .unwrap_or_else(|| ReferenceIndex::new(SourceId::from(index_id)));
        if !edit(&mut index) {
            return Ok(IndexEdit::Unchanged);
        }

        if let Some(previous) = &existing {
            let key = ReferenceIndex::key(index_id);
            let data = serde_json::to_value(previous)?;
            let meta = if index.is_empty() {
                VersionMeta::delete(&self.config.changed_by)
            } else {
                VersionMeta::update(&self.config.changed_by)
            };
            if self.config.block_on_snapshot_failure {
                if let Err(e) = self.versions.save_version(&key, &data, &meta).await {
                    tracing::warn!(key = %key, error = %e, "index edit skipped, snapshot failed");
                    return Ok(IndexEdit::Blocked(format!("snapshot of {key} failed: {e}")));
                }
            } else {
                self.versions.snapshot_before_write(&key, &data, &meta).await;
            }
        }

        if index.is_empty() {
            self.records.remove::<ReferenceIndex>(index_id).await?;
        } else {
            self.records.save(index_id, &index).await?;
        }
        Ok(IndexEdit::Applied)
    }
}

fn broken(base: InstanceReport, source_id: Option<SourceId>, reason: String) -> InstanceReport {
    let mut report = base.with_source(source_id).with_reason(reason);
    report.outcome = InstanceOutcome::Broken;
    report
}
