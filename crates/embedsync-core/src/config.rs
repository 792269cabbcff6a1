//! Reconciliation configuration

use crate::error::ReconcileError;
use embedsync_recovery::{DEFAULT_QUARANTINE_TTL_DAYS, DEFAULT_RETENTION_DAYS};
use embedsync_store::StoreConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for a reconciliation run and the recovery resolvers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Classify only; never quarantine or rewrite indices
    pub dry_run: bool,
    /// Containers checked concurrently
    pub container_concurrency: usize,
    /// Snapshot retention used by the pruning resolver
    pub version_retention_days: u32,
    /// Lifetime recorded on quarantine entries
    pub quarantine_ttl_days: u32,
    /// Take a full backup even in dry run
    pub backup_in_dry_run: bool,
    /// Abort the run when the backup fails
    pub require_backup: bool,
    /// Skip a destructive step when its snapshot fails
    pub block_on_snapshot_failure: bool,
    /// Actor stamped on snapshots and quarantine entries
    pub changed_by: String,
    /// Debounce for cache invalidation after restores
    pub cache_invalidation_delay_ms: u64,
    /// Record store chunking
    pub store: StoreConfig,
}

impl ReconcileConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML; missing fields take their defaults
    ///
    /// # Errors
    /// Returns `ReconcileError::Config` on malformed TOML or field types
    pub fn from_toml_str(raw: &str) -> Result<Self, ReconcileError> {
        Ok(toml::from_str(raw)?)
    }

    /// With dry run
    #[inline]
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// With container concurrency
    #[inline]
    #[must_use]
    pub fn with_container_concurrency(mut self, n: usize) -> Self {
        self.container_concurrency = n;
        self
    }

    /// With snapshot retention
    #[inline]
    #[must_use]
    pub fn with_version_retention_days(mut self, days: u32) -> Self {
        self.version_retention_days = days;
        self
    }

    /// With quarantine lifetime
    #[inline]
    #[must_use]
    pub fn with_quarantine_ttl_days(mut self, days: u32) -> Self {
        self.quarantine_ttl_days = days;
        self
    }

    /// With backup in dry run
    #[inline]
    #[must_use]
    pub fn with_backup_in_dry_run(mut self, enabled: bool) -> Self {
        self.backup_in_dry_run = enabled;
        self
    }

    /// With required backup
    #[inline]
    #[must_use]
    pub fn with_require_backup(mut self, required: bool) -> Self {
        self.require_backup = required;
        self
    }

    /// With blocking snapshot failures
    #[inline]
    #[must_use]
    pub fn with_block_on_snapshot_failure(mut self, block: bool) -> Self {
        self.block_on_snapshot_failure = block;
        self
    }

    /// With actor name
    #[inline]
    #[must_use]
    pub fn with_changed_by(mut self, changed_by: impl Into<String>) -> Self {
        self.changed_by = changed_by.into();
        self
    }

    /// With cache invalidation debounce
    #[inline]
    #[must_use]
    pub fn with_cache_invalidation_delay_ms(mut self, ms: u64) -> Self {
        self.cache_invalidation_delay_ms = ms;
        self
    }

    /// Effective concurrency, at least one
    #[inline]
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.container_concurrency.max(1)
    }

    /// Whether a run in the given mode takes a backup
    #[inline]
    #[must_use]
    pub fn takes_backup(&self, dry_run: bool) -> bool {
        !dry_run || self.backup_in_dry_run
    }

    /// Cache invalidation debounce
    #[inline]
    #[must_use]
    pub fn invalidation_delay(&self) -> Duration {
        Duration::from_millis(self.cache_invalidation_delay_ms)
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            container_concurrency: 4,
            version_retention_days: DEFAULT_RETENTION_DAYS,
            quarantine_ttl_days: DEFAULT_QUARANTINE_TTL_DAYS,
            backup_in_dry_run: false,
            require_backup: false,
            block_on_snapshot_failure: false,
            changed_by: "reconciliation".to_string(),
            cache_invalidation_delay_ms: 500,
            store: StoreConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_safe() {
        let config = ReconcileConfig::default();
        assert!(config.dry_run);
        assert_eq!(config.version_retention_days, 14);
        assert!(!config.takes_backup(true));
        assert!(config.takes_backup(false));
    }

    #[test]
    fn toml_overrides_subset() {
        let config = ReconcileConfig::from_toml_str(
            r#"
            dry_run = false
            container_concurrency = 0
            changed_by = "nightly"

            [store]
            max_value_bytes = 4096
            "#,
        )
        .unwrap();

        assert!(!config.dry_run);
        assert_eq!(config.concurrency(), 1);
        assert_eq!(config.changed_by, "nightly");
        assert_eq!(config.store.max_value_bytes, Some(4096));
        assert_eq!(config.quarantine_ttl_days, 30);
    }

    #[test]
    fn malformed_toml_is_config_error() {
        let err = ReconcileConfig::from_toml_str("dry_run = \"maybe\"").unwrap_err();
        assert!(matches!(err, ReconcileError::Config(_)));
    }
}
