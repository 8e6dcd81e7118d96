//! Adaptive HTTP dispatch: per-origin pools, retries, live concurrency cap.
//!
//! This module sits between request logic and outbound connections.
//!
//! # Features
//!
//! - One [`Pool`] per [`Origin`], created on first use and reclaimed after a
//!   quiet period
//! - Capacity read live from a shared [`ConcurrencyProvider`], so cap changes
//!   reach existing pools
//! - Transient failures retried per [`RetryPolicy`], honouring `Retry-After`
//! - Per-origin [`PoolStats`] for observability
//! - Proxy changes applied to existing pools without recreating them
//!
//! # Example
//!
//! ```no_run
//! use dispatch_core::dispatch::{AgentOptions, ConcurrencyProvider, DispatchAgent, DispatchRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let agent = DispatchAgent::new(AgentOptions::default(), ConcurrencyProvider::default())?;
//! let body = agent
//!     .dispatch(DispatchRequest::get("https://example.com/data.json"))
//!     .await?
//!     .text()
//!     .await?;
//! println!("{body}");
//! # Ok(())
//! # }
//! ```

mod agent;
mod concurrency;
mod connector;
pub mod constants;
mod error;
mod origin;
mod pool;
mod reaper;
mod retry;

pub use agent::{AgentOptions, DispatchAgent, DispatchRequest, DispatchResponse};
pub use concurrency::ConcurrencyProvider;
pub use connector::{ConnectorConfig, default_user_agent};
pub use error::{DispatchError, ErrorCode};
pub use origin::Origin;
pub use pool::{DispatcherKind, DrainEvent, Pool, PoolPermit, PoolStats};
pub use retry::{
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_ERROR_CODES, DEFAULT_RETRY_STATUS_CODES, RetryDecision,
    RetryPolicy, RetryState, retry_after_millis,
};
