//! Record store configuration

use serde::{Deserialize, Serialize};

/// Settings for [`crate::RecordStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Values whose encoding exceeds this many bytes are chunked. `None`
    /// uses the backend's own ceiling.
    pub max_value_bytes: Option<usize>,
}

impl StoreConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With an explicit chunking threshold
    #[inline]
    #[must_use]
    pub fn with_max_value_bytes(mut self, max: usize) -> Self {
        self.max_value_bytes = Some(max.max(1));
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_value_bytes: None,
        }
    }
}
