//! Reconciliation results

use crate::entities::{ToggleStates, VariableValues};
use crate::ids::{BackupId, ConsumerId, ContainerId, JobId, SourceId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of one embed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InstanceOutcome {
    /// Node present, source resolves
    Active,
    /// Container or node gone; quarantined
    Orphaned,
    /// Source cannot be resolved; reported only
    Broken,
    /// Missing source id recovered from the instance config
    Repaired,
    /// Container fetch failed; nothing asserted
    Unverified,
}

impl InstanceOutcome {
    /// Node and source both resolve after this run
    #[inline]
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Active | Self::Repaired)
    }
}

/// Per-instance line of a reconciliation report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceReport {
    pub consumer_id: ConsumerId,
    pub container_id: ContainerId,
    #[serde(default)]
    pub container_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<SourceId>,
    pub outcome: InstanceOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_stale: Option<bool>,
    #[serde(default)]
    pub variable_values: VariableValues,
    #[serde(default)]
    pub toggle_states: ToggleStates,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_updated_at: Option<DateTime<Utc>>,
}

impl InstanceReport {
    /// Report line with only identity and outcome filled in
    #[must_use]
    pub fn new(
        consumer_id: ConsumerId,
        container_id: ContainerId,
        outcome: InstanceOutcome,
    ) -> Self {
        Self {
            consumer_id,
            container_id,
            container_title: String::new(),
            source_id: None,
            outcome,
            reason: None,
            is_stale: None,
            variable_values: VariableValues::new(),
            toggle_states: ToggleStates::new(),
            cached_content: None,
            last_synced: None,
            source_updated_at: None,
        }
    }

    /// With reason
    #[inline]
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// With source id
    #[inline]
    #[must_use]
    pub fn with_source(mut self, source_id: Option<SourceId>) -> Self {
        self.source_id = source_id;
        self
    }

    /// With container title
    #[inline]
    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.container_title = title.into();
        self
    }
}

/// Container that could not be verified or fully processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerError {
    pub container_id: ContainerId,
    pub reason: String,
}

/// A consumer found in more than one reference index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateReference {
    pub consumer_id: ConsumerId,
    /// Index whose entry was kept in the working set
    pub kept_index: SourceId,
    /// Indices whose entries were superseded
    pub dropped_indices: Vec<SourceId>,
}

/// Structured result of one reconciliation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub job_id: JobId,
    pub dry_run: bool,
    pub total_checked: usize,
    /// Live instances, repaired ones included
    pub active_count: usize,
    pub orphaned_count: usize,
    pub broken_reference_count: usize,
    pub repaired_reference_count: usize,
    pub stale_count: usize,
    pub orphaned_entries_removed: usize,
    pub unverified_count: usize,
    pub duplicate_references_resolved: usize,
    pub containers_checked: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_id: Option<BackupId>,
    #[serde(default)]
    pub container_errors: Vec<ContainerError>,
    #[serde(default)]
    pub duplicate_references: Vec<DuplicateReference>,
    /// Consumers whose source could not be resolved
    #[serde(default)]
    pub broken_references: Vec<ConsumerId>,
    #[serde(default)]
    pub instances: Vec<InstanceReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReconcileSummary {
    /// Empty summary for a run starting now
    #[must_use]
    pub fn new(job_id: JobId, dry_run: bool) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            dry_run,
            total_checked: 0,
            active_count: 0,
            orphaned_count: 0,
            broken_reference_count: 0,
            repaired_reference_count: 0,
            stale_count: 0,
            orphaned_entries_removed: 0,
            unverified_count: 0,
            duplicate_references_resolved: 0,
            containers_checked: 0,
            backup_id: None,
            container_errors: Vec::new(),
            duplicate_references: Vec::new(),
            broken_references: Vec::new(),
            instances: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    /// Recompute the per-outcome counters from `instances`
    pub fn tally(&mut self) {
        self.total_checked = self.instances.len();
        self.repaired_reference_count = self.count(InstanceOutcome::Repaired);
        self.active_count = self.count(InstanceOutcome::Active) + self.repaired_reference_count;
        self.orphaned_count = self.count(InstanceOutcome::Orphaned);
        self.broken_reference_count = self.count(InstanceOutcome::Broken);
        self.unverified_count = self.count(InstanceOutcome::Unverified);
        self.stale_count = self
            .instances
            .iter()
            .filter(|i| i.outcome.is_live() && i.is_stale == Some(true))
            .count();
        self.broken_references = self
            .with_outcome(InstanceOutcome::Broken)
            .map(|i| i.consumer_id.clone())
            .collect();
    }

    /// Instances with a given outcome
    pub fn with_outcome(&self, outcome: InstanceOutcome) -> impl Iterator<Item = &InstanceReport> {
        self.instances.iter().filter(move |i| i.outcome == outcome)
    }

    /// Report line for a consumer
    #[must_use]
    pub fn instance(&self, consumer_id: &ConsumerId) -> Option<&InstanceReport> {
        self.instances.iter().find(|i| &i.consumer_id == consumer_id)
    }

    fn count(&self, outcome: InstanceOutcome) -> usize {
        self.with_outcome(outcome).count()
    }
}
