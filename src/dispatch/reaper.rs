//! Reclaims pools that stay idle after draining.
//!
//! Every [`DrainEvent`] arms one check after the reap delay. At check time the
//! pool's live counts are read again; a pool that picked up new work survives,
//! and the drain that follows that work arms a fresh check.

use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::agent::PoolMap;
use super::{DrainEvent, Origin};

/// Drain-event consumer owned by a [`DispatchAgent`](super::DispatchAgent).
#[derive(Debug)]
pub(crate) struct PoolReaper {
    pools: Weak<PoolMap>,
    delay: Duration,
}

impl PoolReaper {
    pub(crate) fn new(pools: Weak<PoolMap>, delay: Duration) -> Self {
        Self { pools, delay }
    }

    /// Runs the reaper until every drain sender is gone.
    pub(crate) fn spawn(self, drain_rx: mpsc::UnboundedReceiver<DrainEvent>) {
        tokio::spawn(self.run(drain_rx));
    }

    async fn run(self, mut drain_rx: mpsc::UnboundedReceiver<DrainEvent>) {
        let mut checks = FuturesUnordered::new();
        loop {
            tokio::select! {
                event = drain_rx.recv() => {
                    let Some(DrainEvent { origin }) = event else {
                        break;
                    };
                    trace!(origin = %origin, delay_ms = self.delay.as_millis(), "reap check armed");
                    let delay = self.delay;
                    checks.push(async move {
                        tokio::time::sleep(delay).await;
                        origin
                    });
                }
                Some(origin) = checks.next(), if !checks.is_empty() => {
                    let Some(pools) = self.pools.upgrade() else {
                        break;
                    };
                    reap_if_idle(&pools, &origin);
                }
            }
        }
        debug!("pool reaper stopped");
    }
}

/// Evicts the origin's pool if it has no work at all.
///
/// The idle check, the switch to closing and the removal happen together
/// under the shard lock. A caller that cloned the pool before eviction is
/// rejected as closed and resolves the origin again. Returns whether the
/// pool was evicted.
pub(crate) fn reap_if_idle(pools: &PoolMap, origin: &Origin) -> bool {
    let Some(pool) = pools.get(origin).map(|entry| Arc::clone(entry.value())) else {
        return false;
    };

    let removed = pools
        .remove_if(origin, |_, current| {
            Arc::ptr_eq(current, &pool) && current.begin_close_if_idle()
        })
        .is_some();
    if removed {
        debug!(origin = %origin, "reaped idle pool");
    } else {
        trace!(origin = %origin, stats = ?pool.stats(), "pool busy again, not reaping");
    }
    removed
}
