//! Job phases and the progress record polled by callers

use crate::error::ModelError;
use crate::ids::JobId;
use crate::report::ReconcileSummary;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of a reconciliation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Queued,
    Initializing,
    Backup,
    Fetching,
    Collecting,
    Checking,
    Finalizing,
    Complete,
    Error,
}

impl Phase {
    /// Every phase, in pipeline order
    pub const ALL: [Phase; 9] = [
        Phase::Queued,
        Phase::Initializing,
        Phase::Backup,
        Phase::Fetching,
        Phase::Collecting,
        Phase::Checking,
        Phase::Finalizing,
        Phase::Complete,
        Phase::Error,
    ];

    /// `complete` and `error` end a run
    #[inline]
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Complete | Phase::Error)
    }

    /// Lowercase wire name
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Queued => "queued",
            Phase::Initializing => "initializing",
            Phase::Backup => "backup",
            Phase::Fetching => "fetching",
            Phase::Collecting => "collecting",
            Phase::Checking => "checking",
            Phase::Finalizing => "finalizing",
            Phase::Complete => "complete",
            Phase::Error => "error",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Phases reachable from `from`.
///
/// A non-terminal phase may also be re-entered, which is how per-container
/// progress is published while `checking`.
#[must_use]
pub fn allowed_transitions(from: Phase) -> Vec<Phase> {
    use Phase::*;
    match from {
        Queued => vec![Queued, Initializing, Error],
        Initializing => vec![Initializing, Backup, Error],
        Backup => vec![Backup, Fetching, Error],
        Fetching => vec![Fetching, Collecting, Error],
        Collecting => vec![Collecting, Checking, Error],
        Checking => vec![Checking, Finalizing, Error],
        Finalizing => vec![Finalizing, Complete, Error],
        Complete => vec![],
        Error => vec![],
    }
}

/// Validates a phase transition
///
/// # Errors
/// Returns `ModelError::IllegalTransition` when `to` is not reachable
pub fn validate_transition(from: Phase, to: Phase) -> Result<(), ModelError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(ModelError::IllegalTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Progress of one job, overwritten in place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub phase: Phase,
    pub percent: u8,
    pub status: String,
    pub total: usize,
    pub processed: usize,
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ReconcileSummary>,
}

impl ProgressRecord {
    /// Fresh record for a job that has been accepted but not started
    #[must_use]
    pub fn queued(job_id: JobId, dry_run: bool) -> Self {
        Self {
            phase: Phase::Queued,
            percent: 0,
            status: "Queued".to_string(),
            total: 0,
            processed: 0,
            dry_run,
            job_id: Some(job_id),
            updated_at: Utc::now(),
            error: None,
            results: None,
        }
    }

    /// True once the job reached `complete` or `error`
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.phase.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn happy_path_is_allowed() {
        let path = [
            Phase::Queued,
            Phase::Initializing,
            Phase::Backup,
            Phase::Fetching,
            Phase::Collecting,
            Phase::Checking,
            Phase::Checking,
            Phase::Finalizing,
            Phase::Complete,
        ];
        for pair in path.windows(2) {
            assert!(validate_transition(pair[0], pair[1]).is_ok(), "{pair:?}");
        }
    }

    #[test]
    fn terminal_phases_are_final() {
        assert!(validate_transition(Phase::Complete, Phase::Checking).is_err());
        assert!(validate_transition(Phase::Error, Phase::Error).is_err());
        assert!(validate_transition(Phase::Fetching, Phase::Complete).is_err());
    }

    #[test]
    fn phase_serializes_lowercase() {
        let json = serde_json::to_string(&Phase::Finalizing).unwrap();
        assert_eq!(json, "\"finalizing\"");
    }

    proptest! {
        #[test]
        fn every_non_terminal_phase_can_fail(idx in 0usize..9) {
            let phase = Phase::ALL[idx];
            prop_assert_eq!(
                validate_transition(phase, Phase::Error).is_ok(),
                !phase.is_terminal()
            );
        }
    }
}
