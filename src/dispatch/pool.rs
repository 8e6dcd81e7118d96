//! Per-origin connection pools with live capacity.
//!
//! A [`Pool`] gates requests to one [`Origin`] and keeps the connection
//! accounting behind [`PoolStats`]. Capacity is read from the
//! [`ConcurrencyProvider`] on every admission check, so a cap change applies to
//! pools that already exist.
//!
//! # Capacity policy
//!
//! Lowering the cap never interrupts busy connections. New requests stay queued
//! until the busy count drops below the new cap, and connections released while
//! the pool holds more than the cap are closed instead of kept idle, so the
//! connection count converges to the cap.
//!
//! # Lifecycle
//!
//! - `Open`: normal operation.
//! - `Closing` (after [`Pool::close`]): new requests are rejected, queued and
//!   in-flight requests finish normally.
//! - `Destroyed` (after [`Pool::destroy`]): queued and in-flight requests fail
//!   with [`DispatchError::Destroyed`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::constants::KEEP_ALIVE_TIMEOUT;
use super::{ConcurrencyProvider, DispatchError, Origin};

/// Snapshot of a pool's connection and request counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Open connections (busy and idle).
    pub connected: usize,
    /// Idle connections available for reuse.
    pub free: usize,
    /// Admitted requests still waiting for response headers.
    pub pending: usize,
    /// Requests waiting for capacity.
    pub queued: usize,
    /// Requests whose headers arrived and whose body is still outstanding.
    pub running: usize,
    /// Connection slots held by the pool (`free + pending + running`).
    pub size: usize,
}

impl PoolStats {
    /// True when any of `connected`, `pending`, `running`, `queued`, `free` is nonzero.
    #[must_use]
    pub fn has_activity(&self) -> bool {
        self.connected > 0
            || self.pending > 0
            || self.running > 0
            || self.queued > 0
            || self.free > 0
    }

    /// Requests queued or in flight.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.queued + self.pending + self.running
    }
}

/// Kind of per-origin dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherKind {
    /// Multi-connection pool bounded by the live concurrency cap.
    Pool,
    /// Single-connection dispatcher, created when the cap is 1.
    Single,
}

/// Signal that an origin's dispatcher has no more queued or in-flight work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainEvent {
    /// Origin whose dispatcher drained.
    pub origin: Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closing,
    Destroyed,
}

#[derive(Debug)]
struct PoolState {
    /// Release time of each idle connection, oldest first.
    idle: VecDeque<Instant>,
    connected: usize,
    pending: usize,
    running: usize,
    queued: usize,
    lifecycle: Lifecycle,
}

impl PoolState {
    fn busy(&self) -> usize {
        self.pending + self.running
    }

    fn outstanding(&self) -> usize {
        self.queued + self.pending + self.running
    }

    /// Number of idle connections whose keep-alive window has passed.
    fn expired_idle(&self, now: Instant) -> usize {
        self.idle
            .iter()
            .take_while(|released| now.saturating_duration_since(**released) >= KEEP_ALIVE_TIMEOUT)
            .count()
    }

    fn drop_expired_idle(&mut self, now: Instant) {
        let expired = self.expired_idle(now);
        if expired > 0 {
            self.idle.drain(..expired);
            self.connected -= expired;
        }
    }
}

/// Connection pool for a single origin.
#[derive(Debug)]
pub struct Pool {
    origin: Origin,
    kind: DispatcherKind,
    concurrency: ConcurrencyProvider,
    client: RwLock<reqwest::Client>,
    state: Mutex<PoolState>,
    /// Woken whenever a slot is released or the lifecycle changes.
    released: Notify,
    destroyed: watch::Sender<bool>,
    drain_tx: mpsc::UnboundedSender<DrainEvent>,
}

impl Pool {
    /// Creates a pool. The kind is chosen from the cap at construction time.
    pub(crate) fn new(
        origin: Origin,
        concurrency: ConcurrencyProvider,
        client: reqwest::Client,
        drain_tx: mpsc::UnboundedSender<DrainEvent>,
    ) -> Arc<Self> {
        let kind = if concurrency.get() == 1 {
            DispatcherKind::Single
        } else {
            DispatcherKind::Pool
        };
        debug!(origin = %origin, ?kind, cap = concurrency.get(), "creating pool");
        let (destroyed, _) = watch::channel(false);
        Arc::new(Self {
            origin,
            kind,
            concurrency,
            client: RwLock::new(client),
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                connected: 0,
                pending: 0,
                running: 0,
                queued: 0,
                lifecycle: Lifecycle::Open,
            }),
            released: Notify::new(),
            destroyed,
            drain_tx,
        })
    }

    /// Origin served by this pool.
    #[must_use]
    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Whether this is a multi-connection pool or a single-connection dispatcher.
    #[must_use]
    pub fn kind(&self) -> DispatcherKind {
        self.kind
    }

    /// Current capacity, re-read on every call.
    #[must_use]
    pub fn capacity(&self) -> usize {
        match self.kind {
            DispatcherKind::Pool => self.concurrency.get(),
            DispatcherKind::Single => 1,
        }
    }

    /// Consistent snapshot of all six counters. Does not modify the pool.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.lock_state();
        let expired = state.expired_idle(Instant::now());
        let connected = state.connected - expired;
        PoolStats {
            connected,
            free: state.idle.len() - expired,
            pending: state.pending,
            queued: state.queued,
            running: state.running,
            size: connected,
        }
    }

    /// Requests queued or in flight.
    #[must_use]
    pub fn running_requests(&self) -> usize {
        self.lock_state().outstanding()
    }

    /// HTTP client used for new requests on this pool.
    pub(crate) fn client(&self) -> reqwest::Client {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps the client used for subsequent requests. In-flight requests keep theirs.
    pub(crate) fn set_client(&self, client: reqwest::Client) {
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = client;
    }

    /// Waits for capacity and admits one request.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Closed`] when the pool is closing and
    /// [`DispatchError::Destroyed`] when it was destroyed.
    pub(crate) async fn acquire(self: &Arc<Self>) -> Result<PoolPermit, DispatchError> {
        let mut slot = QueueSlot {
            pool: self.as_ref(),
            queued: false,
        };

        loop {
            let released = self.released.notified();
            let cap_changed = self.concurrency.changed();
            tokio::pin!(released, cap_changed);
            released.as_mut().enable();
            cap_changed.as_mut().enable();

            {
                let mut state = self.lock_state();
                match state.lifecycle {
                    Lifecycle::Destroyed => return Err(DispatchError::destroyed(self.origin.key())),
                    Lifecycle::Closing if !slot.queued => {
                        return Err(DispatchError::closed(self.origin.key()));
                    }
                    Lifecycle::Open | Lifecycle::Closing => {}
                }

                state.drop_expired_idle(Instant::now());
                let capacity = self.capacity();
                if state.busy() < capacity {
                    if slot.queued {
                        state.queued -= 1;
                        slot.queued = false;
                    }
                    let reused = state.idle.pop_back().is_some();
                    if !reused {
                        state.connected += 1;
                    }
                    state.pending += 1;
                    trace!(
                        origin = %self.origin,
                        reused,
                        busy = state.busy(),
                        capacity,
                        "request admitted"
                    );
                    return Ok(PoolPermit {
                        pool: Arc::clone(self),
                        running: false,
                        reusable: false,
                    });
                }

                if !slot.queued {
                    state.queued += 1;
                    slot.queued = true;
                    trace!(origin = %self.origin, queued = state.queued, capacity, "request queued");
                }
            }

            tokio::select! {
                () = &mut released => {}
                () = &mut cap_changed => {}
            }
        }
    }

    /// Stops accepting new work and waits for queued and in-flight work to finish.
    pub async fn close(&self) {
        {
            let mut state = self.lock_state();
            if state.lifecycle == Lifecycle::Open {
                state.lifecycle = Lifecycle::Closing;
                let idle = state.idle.len();
                state.idle.clear();
                state.connected -= idle;
                debug!(origin = %self.origin, outstanding = state.outstanding(), "closing pool");
            }
        }
        self.released.notify_waiters();

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            if self.lock_state().outstanding() == 0 {
                break;
            }
            released.await;
        }
        debug!(origin = %self.origin, "pool closed");
    }

    /// Moves an open pool straight to `Closing` if it has no work at all.
    ///
    /// A multi-connection pool must also hold no kept-alive connection; a
    /// single-connection dispatcher only needs an empty queue. The check and
    /// the transition share the state lock, so a concurrent [`acquire`] either
    /// got in first (and the pool stays open) or is rejected as closed.
    /// Nothing is outstanding afterwards, so the pool is fully closed on
    /// return.
    ///
    /// [`acquire`]: Self::acquire
    pub(crate) fn begin_close_if_idle(&self) -> bool {
        let mut state = self.lock_state();
        if state.lifecycle != Lifecycle::Open {
            return false;
        }
        state.drop_expired_idle(Instant::now());
        let idle = match self.kind {
            DispatcherKind::Pool => state.connected == 0 && state.outstanding() == 0,
            DispatcherKind::Single => state.outstanding() == 0,
        };
        if !idle {
            return false;
        }

        state.lifecycle = Lifecycle::Closing;
        let kept = state.idle.len();
        state.idle.clear();
        state.connected -= kept;
        drop(state);
        self.released.notify_waiters();
        debug!(origin = %self.origin, "idle pool closed");
        true
    }

    /// Aborts queued and in-flight work and drops idle connections.
    pub fn destroy(&self) {
        {
            let mut state = self.lock_state();
            if state.lifecycle == Lifecycle::Destroyed {
                return;
            }
            state.lifecycle = Lifecycle::Destroyed;
            let idle = state.idle.len();
            state.idle.clear();
            state.connected -= idle;
            debug!(origin = %self.origin, outstanding = state.outstanding(), "destroying pool");
        }
        self.destroyed.send_replace(true);
        self.released.notify_waiters();
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        *self.destroyed.borrow()
    }

    /// Resolves once the pool is destroyed.
    pub(crate) async fn destroyed(&self) {
        let mut receiver = self.destroyed.subscribe();
        // The sender lives as long as `self`, so this only returns on destroy.
        let _ = receiver.wait_for(|destroyed| *destroyed).await;
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes waiters and reports a drain once nothing is outstanding.
    fn after_release(&self, state: MutexGuard<'_, PoolState>) {
        let drained = state.outstanding() == 0 && state.lifecycle == Lifecycle::Open;
        drop(state);
        self.released.notify_waiters();
        if drained {
            trace!(origin = %self.origin, "pool drained");
            // The reaper may already be gone during shutdown.
            let _ = self.drain_tx.send(DrainEvent {
                origin: self.origin.clone(),
            });
        }
    }
}

/// Un-counts a queued request whose `acquire` future is dropped.
struct QueueSlot<'a> {
    pool: &'a Pool,
    queued: bool,
}

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        if self.queued {
            let mut state = self.pool.lock_state();
            state.queued -= 1;
            self.pool.after_release(state);
        }
    }
}

/// An admitted request's hold on a pool connection. Dropping it releases the slot.
#[derive(Debug)]
pub struct PoolPermit {
    pool: Arc<Pool>,
    running: bool,
    reusable: bool,
}

impl PoolPermit {
    /// The pool this permit belongs to.
    #[must_use]
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Moves the request from `pending` to `running` once headers arrived.
    pub(crate) fn mark_running(&mut self) {
        if self.running {
            return;
        }
        let mut state = self.pool.lock_state();
        state.pending -= 1;
        state.running += 1;
        self.running = true;
    }

    /// Marks the connection as fit for reuse (the exchange completed cleanly).
    pub(crate) fn mark_reusable(&mut self) {
        self.reusable = true;
    }
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        let mut state = self.pool.lock_state();
        if self.running {
            state.running -= 1;
        } else {
            state.pending -= 1;
        }

        let keep = self.reusable
            && state.lifecycle == Lifecycle::Open
            && state.connected <= self.pool.capacity();
        if keep {
            state.idle.push_back(Instant::now());
        } else {
            state.connected -= 1;
        }
        self.pool.after_release(state);
    }
}
