//! Document service seam
//!
//! The reconciliation worker asks the document service whether a container
//! still exists and, if so, for its current content tree. A definite
//! "not found" is a normal answer; anything else the service cannot answer
//! is a [`DocumentError`] and leaves the container unverified.

use async_trait::async_trait;
use dashmap::DashMap;
use embedsync_model::{Container, ContainerId};
use std::fmt::Debug;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Outcome of a container lookup
#[derive(Debug, Clone, PartialEq)]
pub enum ContainerLookup {
    /// Container exists; content is current
    Found(Container),
    /// Service definitively reports the container absent
    NotFound,
}

impl ContainerLookup {
    /// Container when found
    #[inline]
    #[must_use]
    pub fn found(&self) -> Option<&Container> {
        match self {
            Self::Found(c) => Some(c),
            Self::NotFound => None,
        }
    }
}

/// Document service failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DocumentError {
    /// Network or server failure
    #[error("document service transport error: {0}")]
    Transport(String),

    /// Caller lacks permission to read the container
    #[error("not authorized to read container")]
    Unauthorized,

    /// Service asked the caller to slow down
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    /// Response could not be interpreted
    #[error("malformed document response: {0}")]
    Malformed(String),
}

impl DocumentError {
    /// Check if the lookup may succeed when retried
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::RateLimited { .. })
    }
}

/// Platform document service
#[async_trait]
pub trait DocumentService: Send + Sync + Debug {
    /// Look up a container by id
    async fn get_container(&self, id: &ContainerId) -> Result<ContainerLookup, DocumentError>;
}

/// Document service backed by an in-memory map
///
/// Lookups for ids registered with [`StaticDocumentService::fail_with`]
/// return that error instead of consulting the map.
#[derive(Debug, Default)]
pub struct StaticDocumentService {
    containers: DashMap<ContainerId, Container>,
    failures: DashMap<ContainerId, DocumentError>,
    fetches: AtomicUsize,
}

impl StaticDocumentService {
    /// Create an empty service
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a service holding the given containers
    #[must_use]
    pub fn with_containers(containers: impl IntoIterator<Item = Container>) -> Self {
        let service = Self::new();
        for container in containers {
            service.insert(container);
        }
        service
    }

    /// Add or replace a container
    pub fn insert(&self, container: Container) {
        self.containers.insert(container.id.clone(), container);
    }

    /// Remove a container, returning it if present
    pub fn remove(&self, id: &ContainerId) -> Option<Container> {
        self.containers.remove(id).map(|(_, c)| c)
    }

    /// Make lookups of `id` fail
    pub fn fail_with(&self, id: impl Into<ContainerId>, error: DocumentError) {
        self.failures.insert(id.into(), error);
    }

    /// Stop failing lookups of `id`
    pub fn clear_failure(&self, id: &ContainerId) {
        self.failures.remove(id);
    }

    /// Number of lookups served so far
    #[inline]
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl DocumentService for StaticDocumentService {
    async fn get_container(&self, id: &ContainerId) -> Result<ContainerLookup, DocumentError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        if let Some(error) = self.failures.get(id) {
            return Err(error.value().clone());
        }
        Ok(self
            .containers
            .get(id)
            .map_or(ContainerLookup::NotFound, |c| ContainerLookup::Found(c.value().clone())))
    }
}
