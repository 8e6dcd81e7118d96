//! Pluggable checkpoint storage for resumable transfers.
//!
//! The dispatch layer does not persist anything itself. Callers that resume
//! interrupted transfers hand a [`CheckpointStore`] to the
//! [`DispatchAgent`](crate::dispatch::DispatchAgent) and reach it through
//! [`DispatchAgent::checkpoints`](crate::dispatch::DispatchAgent::checkpoints).
//! The default store is [`NoopCheckpointStore`].

use std::fmt;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Resume point for one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// URL the checkpoint belongs to.
    pub url: String,
    /// Bytes already received.
    pub offset: u64,
    /// Total size when the server reported one.
    pub total_bytes: Option<u64>,
    /// `ETag` or `Last-Modified` value used to validate a resume.
    pub validator: Option<String>,
}

/// Checkpoint lookup/put/delete contract.
///
/// Implementations must not fail outward; a store that cannot persist simply
/// forgets.
#[async_trait]
pub trait CheckpointStore: Send + Sync + fmt::Debug {
    /// Returns the checkpoint stored for `url`, if any.
    async fn lookup(&self, url: &str) -> Option<Checkpoint>;

    /// Stores or replaces the checkpoint for `url`.
    async fn put(&self, url: &str, checkpoint: Checkpoint);

    /// Removes the checkpoint for `url`.
    async fn delete(&self, url: &str);
}

/// Store that keeps nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCheckpointStore;

#[async_trait]
impl CheckpointStore for NoopCheckpointStore {
    async fn lookup(&self, _url: &str) -> Option<Checkpoint> {
        None
    }

    async fn put(&self, _url: &str, _checkpoint: Checkpoint) {}

    async fn delete(&self, _url: &str) {}
}

/// In-process store, keyed by URL.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    entries: DashMap<String, Checkpoint>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored checkpoints.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn lookup(&self, url: &str) -> Option<Checkpoint> {
        self.entries.get(url).map(|entry| entry.value().clone())
    }

    async fn put(&self, url: &str, checkpoint: Checkpoint) {
        trace!(url, offset = checkpoint.offset, "checkpoint stored");
        self.entries.insert(url.to_string(), checkpoint);
    }

    async fn delete(&self, url: &str) {
        self.entries.remove(url);
    }
}
