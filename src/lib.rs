//! Dispatch Core Library
//!
//! Adaptive HTTP dispatch layer: per-origin connection pools with a live
//! concurrency cap, transient-failure retries with backoff, idle pool
//! reclamation, and runtime-mutable proxy routing.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`dispatch`] - Pools, retry policy, dispatch agent and pool reaper
//! - [`proxy`] - Proxy state and propagation to dispatchers
//! - [`settings`] - Bridge from settings change notifications to live state
//! - [`checkpoint`] - Pluggable checkpoint store for resumable transfers

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod dispatch;
pub mod proxy;
pub mod settings;

// Re-export commonly used types
pub use checkpoint::{Checkpoint, CheckpointStore, MemoryCheckpointStore, NoopCheckpointStore};
pub use dispatch::{
    AgentOptions, ConcurrencyProvider, ConnectorConfig, DEFAULT_MAX_RETRIES, DispatchAgent,
    DispatchError, DispatchRequest, DispatchResponse, ErrorCode, Origin, PoolStats, RetryDecision,
    RetryPolicy,
};
pub use proxy::{ProxyConfig, ProxyController, ProxyEnv, ProxyError, ProxyTarget};
pub use settings::{ConfigBridge, SettingsChange};
