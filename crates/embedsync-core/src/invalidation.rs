//! Debounced cache invalidation
//!
//! Restores change instance configs, which makes their rendered caches
//! wrong. The scheduler collects the affected consumers and deletes their
//! cache entries once no new restore has arrived for the configured delay.

use embedsync_model::{CacheEntry, ConsumerId};
use embedsync_store::{RecordStore, StoreResult};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug)]
struct Pending {
    consumers: BTreeSet<ConsumerId>,
    handle: JoinHandle<()>,
}

/// Cache invalidation task owned by its caller
///
/// Dropping the scheduler drops any pending invalidation.
#[derive(Debug)]
pub struct InvalidationScheduler {
    records: RecordStore,
    delay: Duration,
    pending: Mutex<Option<Pending>>,
}

impl InvalidationScheduler {
    /// Create scheduler
    #[must_use]
    pub fn new(records: RecordStore, delay: Duration) -> Self {
        Self {
            records,
            delay,
            pending: Mutex::new(None),
        }
    }

    /// Invalidate `consumers` after the delay, restarting the timer
    ///
    /// Consumers from a pending, not yet run invalidation are carried over.
    /// Must be called from within a tokio runtime.
    pub fn schedule(&self, consumers: impl IntoIterator<Item = ConsumerId>) {
        let mut pending = self.pending.lock();
        let mut all: BTreeSet<ConsumerId> = consumers.into_iter().collect();
        if let Some(previous) = pending.take() {
            let fired = previous.handle.is_finished();
            previous.handle.abort();
            if !fired {
                all.extend(previous.consumers);
            }
        }

        let records = self.records.clone();
        let delay = self.delay;
        let targets = all.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = invalidate(&records, &targets).await {
                tracing::warn!(error = %e, "cache invalidation failed");
            }
        });

        tracing::debug!(count = all.len(), delay_ms = delay.as_millis(), "cache invalidation scheduled");
        *pending = Some(Pending {
            consumers: all,
            handle,
        });
    }

    /// Run any pending invalidation now; returns the number of caches cleared
    ///
    /// # Errors
    /// Returns error if a cache entry cannot be deleted
    pub async fn flush(&self) -> StoreResult<usize> {
        let taken = self.pending.lock().take();
        match taken {
            Some(pending) => {
                pending.handle.abort();
                invalidate(&self.records, &pending.consumers).await?;
                Ok(pending.consumers.len())
            }
            None => Ok(0),
        }
    }

    /// Drop any pending invalidation; returns whether one was pending
    pub fn cancel(&self) -> bool {
        match self.pending.lock().take() {
            Some(pending) => {
                pending.handle.abort();
                true
            }
            None => false,
        }
    }

    /// Consumers waiting for invalidation
    #[must_use]
    pub fn pending(&self) -> Vec<ConsumerId> {
        self.pending
            .lock()
            .as_ref()
            .filter(|p| !p.handle.is_finished())
            .map(|p| p.consumers.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Drop for InvalidationScheduler {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.get_mut().take() {
            pending.handle.abort();
        }
    }
}

async fn invalidate(records: &RecordStore, consumers: &BTreeSet<ConsumerId>) -> StoreResult<()> {
    for consumer in consumers {
        records.remove::<CacheEntry>(consumer).await?;
    }
    tracing::debug!(count = consumers.len(), "cache entries invalidated");
    Ok(())
}
