//! Process-wide connection concurrency cap.
//!
//! [`ConcurrencyProvider`] is a cloneable handle passed into every component
//! that needs the cap (pool construction, range policy). Readers always see the
//! live value; only the settings bridge writes it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tracing::debug;

use super::constants::{DEFAULT_CONCURRENCY_CAP, MIN_RANGE_CONCURRENCY};

/// Shared handle over the live concurrency cap.
#[derive(Debug, Clone)]
pub struct ConcurrencyProvider {
    inner: Arc<ProviderState>,
}

#[derive(Debug)]
struct ProviderState {
    cap: AtomicUsize,
    changed: Notify,
}

impl Default for ConcurrencyProvider {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY_CAP)
    }
}

impl ConcurrencyProvider {
    /// Creates a provider with the given initial cap (clamped to at least 1).
    #[must_use]
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Arc::new(ProviderState {
                cap: AtomicUsize::new(cap.max(1)),
                changed: Notify::new(),
            }),
        }
    }

    /// Returns the current cap, never less than 1.
    #[must_use]
    pub fn get(&self) -> usize {
        self.inner.cap.load(Ordering::SeqCst).max(1)
    }

    /// Parallelism for ranged transfers: `max(cap / 4, 4)`.
    #[must_use]
    pub fn range_concurrency(&self) -> usize {
        (self.get() / 4).max(MIN_RANGE_CONCURRENCY)
    }

    /// Stores a new cap and wakes everything waiting on capacity.
    pub(crate) fn set(&self, cap: usize) {
        let cap = cap.max(1);
        let previous = self.inner.cap.swap(cap, Ordering::SeqCst);
        debug!(previous, cap, "concurrency cap updated");
        self.inner.changed.notify_waiters();
    }

    /// Resolves on the next [`set`](Self::set).
    pub(crate) fn changed(&self) -> Notified<'_> {
        self.inner.changed.notified()
    }
}
