//! The dispatch agent: per-origin pools, retries and pool lifecycle.
//!
//! # Overview
//!
//! [`DispatchAgent`] owns the origin→pool map. Each [`dispatch`] call resolves
//! (or lazily creates) the pool for the request's origin, waits for capacity,
//! sends the request with a headers timeout and, on a retryable failure, asks
//! the [`RetryPolicy`] whether and when to try again. The pool is resolved
//! again on every attempt, so a retry after the pool was reaped or destroyed
//! lands on a fresh pool.
//!
//! The retry wait is a timer inside the request future: dropping the future
//! cancels it, and destroying the origin's pool ends it with
//! [`DispatchError::Destroyed`].
//!
//! # Example
//!
//! ```no_run
//! use dispatch_core::dispatch::{AgentOptions, ConcurrencyProvider, DispatchAgent, DispatchRequest};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let agent = DispatchAgent::new(AgentOptions::default(), ConcurrencyProvider::default())?;
//! let response = agent
//!     .dispatch(DispatchRequest::get("https://example.com/file.bin"))
//!     .await?;
//! println!("{} -> {} bytes", response.status(), response.bytes().await?.len());
//!
//! for (origin, stats) in agent.get_status() {
//!     println!("{origin}: {stats:?}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! [`dispatch`]: DispatchAgent::dispatch

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::future::join_all;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::{GRACEFUL_CLOSE_DEADLINE, HEADERS_TIMEOUT, IDLE_REAP_DELAY};
use super::reaper::PoolReaper;
use super::{
    ConcurrencyProvider, ConnectorConfig, DispatchError, DispatcherKind, DrainEvent, Origin, Pool,
    PoolPermit, PoolStats, RetryDecision, RetryPolicy, RetryState,
};
use crate::checkpoint::{CheckpointStore, NoopCheckpointStore};
use crate::proxy::{ProxyError, ProxyTarget};

/// Origin→pool map shared between the agent and its reaper.
pub(crate) type PoolMap = DashMap<Origin, Arc<Pool>>;

/// Agent configuration.
///
/// # Default Values
///
/// - `connector`: [`ConnectorConfig::default`]
/// - `retry`: [`RetryPolicy::default`]
/// - `headers_timeout`: 45 seconds
/// - `idle_reap_delay`: 60 seconds
/// - `close_deadline`: 500ms
/// - `checkpoints`: [`NoopCheckpointStore`]
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Connection parameters for every pool.
    pub connector: ConnectorConfig,
    /// Retry policy used by requests that carry none of their own.
    pub retry: RetryPolicy,
    /// Maximum wait for response headers per attempt.
    pub headers_timeout: Duration,
    /// Quiet period after a drain before an idle pool is reclaimed.
    pub idle_reap_delay: Duration,
    /// Graceful close deadline for [`DispatchAgent::destroy_pool`].
    pub close_deadline: Duration,
    /// Checkpoint collaborator handed to callers.
    pub checkpoints: Arc<dyn CheckpointStore>,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            connector: ConnectorConfig::default(),
            retry: RetryPolicy::default(),
            headers_timeout: HEADERS_TIMEOUT,
            idle_reap_delay: IDLE_REAP_DELAY,
            close_deadline: GRACEFUL_CLOSE_DEADLINE,
            checkpoints: Arc::new(NoopCheckpointStore),
        }
    }
}

/// One logical request. The body is kept so it can be replayed on retry.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Option<Vec<u8>>,
    retry: Option<RetryPolicy>,
    retryable: bool,
}

impl DispatchRequest {
    /// Creates a request with no headers and no body.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            retry: None,
            retryable: true,
        }
    }

    /// Shorthand for a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// Replaces the request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Overrides the agent's retry policy for this request.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Disables retries for this request.
    #[must_use]
    pub fn non_retryable(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Request URL as given.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// A response whose headers arrived. Holds its pool slot until the body is
/// consumed or the response is dropped.
#[derive(Debug)]
pub struct DispatchResponse {
    response: reqwest::Response,
    permit: PoolPermit,
}

impl DispatchResponse {
    /// HTTP status.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.response.status()
    }

    /// Response headers.
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        self.response.headers()
    }

    /// Final URL after redirects.
    #[must_use]
    pub fn url(&self) -> &Url {
        self.response.url()
    }

    /// Body length announced by the server.
    #[must_use]
    pub fn content_length(&self) -> Option<u64> {
        self.response.content_length()
    }

    /// Reads the next body chunk; `None` once the body is complete.
    ///
    /// # Errors
    ///
    /// Returns a connection error when the body stalls past the body timeout
    /// or the connection fails, and [`DispatchError::Destroyed`] when the
    /// origin's pool is destroyed mid-body.
    pub async fn chunk(&mut self) -> Result<Option<Bytes>, DispatchError> {
        let pool = Arc::clone(self.permit.pool());
        let result = tokio::select! {
            result = self.response.chunk() => result,
            () = pool.destroyed() => return Err(DispatchError::destroyed(pool.origin().key())),
        };
        let next = result.map_err(|e| DispatchError::network(self.response.url().as_str(), e))?;
        if next.is_none() {
            self.permit.mark_reusable();
        }
        Ok(next)
    }

    /// Reads the whole body.
    ///
    /// # Errors
    ///
    /// Same as [`chunk`](Self::chunk).
    pub async fn bytes(self) -> Result<Bytes, DispatchError> {
        let Self {
            response,
            mut permit,
        } = self;
        let pool = Arc::clone(permit.pool());
        let url = response.url().to_string();
        let body = tokio::select! {
            result = response.bytes() => result.map_err(|e| DispatchError::network(url, e))?,
            () = pool.destroyed() => return Err(DispatchError::destroyed(pool.origin().key())),
        };
        permit.mark_reusable();
        Ok(body)
    }

    /// Reads the whole body as text, replacing invalid UTF-8.
    ///
    /// # Errors
    ///
    /// Same as [`chunk`](Self::chunk).
    pub async fn text(self) -> Result<String, DispatchError> {
        let body = self.bytes().await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }
}

/// Per-origin pooling HTTP dispatcher with retries.
///
/// Cloning is cheap; clones share pools, proxy state and the reaper. Must be
/// created inside a Tokio runtime because it starts the reaper task.
#[derive(Debug, Clone)]
pub struct DispatchAgent {
    inner: Arc<AgentInner>,
}

#[derive(Debug)]
struct AgentInner {
    pools: Arc<PoolMap>,
    concurrency: ConcurrencyProvider,
    connector: ConnectorConfig,
    /// Client handed to new pools; replaced on proxy change.
    client: RwLock<Client>,
    retry: RetryPolicy,
    headers_timeout: Duration,
    close_deadline: Duration,
    drain_tx: mpsc::UnboundedSender<DrainEvent>,
    checkpoints: Arc<dyn CheckpointStore>,
}

impl DispatchAgent {
    /// Creates an agent and starts its pool reaper.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Client`] if the HTTP client cannot be built.
    pub fn new(
        options: AgentOptions,
        concurrency: ConcurrencyProvider,
    ) -> Result<Self, DispatchError> {
        let client = options
            .connector
            .build_client(None)
            .map_err(|e| DispatchError::client("agent", e))?;
        let pools = Arc::new(PoolMap::new());
        let (drain_tx, drain_rx) = mpsc::unbounded_channel();

        PoolReaper::new(Arc::downgrade(&pools), options.idle_reap_delay).spawn(drain_rx);

        debug!(
            cap = concurrency.get(),
            max_retries = options.retry.max_retries(),
            headers_timeout_ms = options.headers_timeout.as_millis(),
            connect_timeout_ms = options.connector.connect_timeout.as_millis(),
            family_attempt_timeout_ms = options.connector.family_attempt_timeout.as_millis(),
            "dispatch agent created"
        );

        Ok(Self {
            inner: Arc::new(AgentInner {
                pools,
                concurrency,
                connector: options.connector,
                client: RwLock::new(client),
                retry: options.retry,
                headers_timeout: options.headers_timeout,
                close_deadline: options.close_deadline,
                drain_tx,
                checkpoints: options.checkpoints,
            }),
        })
    }

    /// Live concurrency cap handle.
    #[must_use]
    pub fn concurrency(&self) -> &ConcurrencyProvider {
        &self.inner.concurrency
    }

    /// The checkpoint collaborator.
    #[must_use]
    pub fn checkpoints(&self) -> Arc<dyn CheckpointStore> {
        Arc::clone(&self.inner.checkpoints)
    }

    /// Sends a request, retrying transient failures per the retry policy.
    ///
    /// Responses whose status is not retryable are returned as-is, including
    /// error statuses. Only a retryable status that exhausts its retries
    /// becomes [`DispatchError::Status`].
    ///
    /// # Errors
    ///
    /// Returns the last failure unchanged once the retry policy gives up.
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    pub async fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> Result<DispatchResponse, DispatchError> {
        let url = Url::parse(&request.url).map_err(|_| DispatchError::invalid_url(&request.url))?;
        let origin = Origin::from_url(&url)?;
        let policy = request.retry.as_ref().unwrap_or(&self.inner.retry);
        let mut state = if request.retryable {
            RetryState::new(request.method.clone())
        } else {
            RetryState::non_retryable(request.method.clone())
        };

        loop {
            let error = match self.attempt(&origin, &url, &request, policy).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            state.record_attempt();
            let pool = self.current_pool(&origin);
            let stats = pool.as_ref().map(|pool| pool.stats());

            match policy.decide(&error, &state, stats.as_ref()) {
                RetryDecision::Retry { wait, attempt } => {
                    info!(
                        url = %url,
                        attempt,
                        max_retries = policy.max_retries(),
                        wait_ms = wait.as_millis(),
                        error = %error,
                        "retrying dispatch"
                    );
                    match pool {
                        Some(pool) => {
                            tokio::select! {
                                () = tokio::time::sleep(wait) => {}
                                () = pool.destroyed() => {
                                    debug!(origin = %origin, "pool destroyed during retry wait");
                                    return Err(DispatchError::destroyed(origin.key()));
                                }
                            }
                        }
                        None => tokio::time::sleep(wait).await,
                    }
                }
                RetryDecision::DoNotRetry { reason } => {
                    debug!(url = %url, %reason, error = %error, "not retrying dispatch");
                    return Err(error);
                }
            }
        }
    }

    /// One attempt: admission, send, headers timeout, status check.
    async fn attempt(
        &self,
        origin: &Origin,
        url: &Url,
        request: &DispatchRequest,
        policy: &RetryPolicy,
    ) -> Result<DispatchResponse, DispatchError> {
        let mut permit = self.admit(origin).await?;
        let pool = Arc::clone(permit.pool());

        let mut builder = pool
            .client()
            .request(request.method.clone(), url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = tokio::select! {
            result = tokio::time::timeout(self.inner.headers_timeout, builder.send()) => match result {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => return Err(DispatchError::network(url.as_str(), e)),
                Err(_) => return Err(DispatchError::headers_timeout(url.as_str())),
            },
            () = pool.destroyed() => return Err(DispatchError::destroyed(origin.key())),
        };
        permit.mark_running();

        let status = response.status().as_u16();
        if policy.is_retryable_status(status) {
            return Err(DispatchError::status(
                url.as_str(),
                status,
                response.headers().clone(),
            ));
        }

        debug!(url = %url, status, "response headers received");
        Ok(DispatchResponse { response, permit })
    }

    /// Waits for a slot on the origin's pool.
    ///
    /// A pool that was evicted between lookup and admission rejects the request
    /// as closed; the lookup is then repeated against the map.
    async fn admit(&self, origin: &Origin) -> Result<PoolPermit, DispatchError> {
        loop {
            let pool = self.pool_for(origin);
            match pool.acquire().await {
                Err(DispatchError::Closed { .. }) if !self.is_current(origin, &pool) => {
                    debug!(origin = %origin, "pool evicted before admission, resolving again");
                }
                result => return result,
            }
        }
    }

    /// Returns the origin's pool, creating it if needed.
    pub(crate) fn pool_for(&self, origin: &Origin) -> Arc<Pool> {
        // Clone the Arc so the shard lock is released before any await.
        let entry = self.inner.pools.entry(origin.clone()).or_insert_with(|| {
            Pool::new(
                origin.clone(),
                self.inner.concurrency.clone(),
                self.current_client(),
                self.inner.drain_tx.clone(),
            )
        });
        Arc::clone(entry.value())
    }

    fn current_pool(&self, origin: &Origin) -> Option<Arc<Pool>> {
        self.inner
            .pools
            .get(origin)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn is_current(&self, origin: &Origin, pool: &Arc<Pool>) -> bool {
        self.inner
            .pools
            .get(origin)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), pool))
    }

    fn current_client(&self) -> Client {
        self.inner
            .client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stats for every tracked origin served by a multi-connection pool.
    ///
    /// Single-connection dispatchers are left out. Does not modify any pool.
    #[must_use]
    pub fn get_status(&self) -> BTreeMap<String, PoolStats> {
        self.inner
            .pools
            .iter()
            .filter(|entry| entry.value().kind() == DispatcherKind::Pool)
            .map(|entry| (entry.key().key(), entry.value().stats()))
            .collect()
    }

    /// Number of origins currently tracked, of any kind.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.inner.pools.len()
    }

    /// Closes the origin's pool and forgets it.
    ///
    /// A graceful close is raced against the close deadline; if the deadline
    /// wins, the pool is destroyed and its outstanding requests fail with
    /// [`DispatchError::Destroyed`]. The map entry is removed either way.
    #[instrument(skip(self), fields(origin = %origin))]
    pub async fn destroy_pool(&self, origin: &Origin) {
        let Some(pool) = self.current_pool(origin) else {
            debug!("no pool to destroy");
            return;
        };

        match tokio::time::timeout(self.inner.close_deadline, pool.close()).await {
            Ok(()) => debug!("pool closed gracefully"),
            Err(_) => {
                warn!(
                    deadline_ms = self.inner.close_deadline.as_millis(),
                    outstanding = pool.running_requests(),
                    "graceful close timed out, destroying pool"
                );
                pool.destroy();
            }
        }

        self.inner
            .pools
            .remove_if(origin, |_, current| Arc::ptr_eq(current, &pool));
    }

    /// Gracefully closes every pool and empties the map.
    #[instrument(skip(self))]
    pub async fn close(&self) {
        let pools: Vec<Arc<Pool>> = self
            .inner
            .pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        debug!(pools = pools.len(), "closing all pools");

        join_all(pools.iter().map(|pool| pool.close())).await;

        for pool in &pools {
            self.inner
                .pools
                .remove_if(pool.origin(), |_, current| Arc::ptr_eq(current, pool));
        }
    }
}

impl ProxyTarget for DispatchAgent {
    fn apply_proxy(&self, proxy: Option<&Url>) -> Result<(), ProxyError> {
        let client = self
            .inner
            .connector
            .build_client(proxy)
            .map_err(|e| ProxyError::client(proxy.map_or("", Url::as_str), e))?;

        *self
            .inner
            .client
            .write()
            .unwrap_or_else(PoisonError::into_inner) = client.clone();
        for entry in self.inner.pools.iter() {
            entry.value().set_client(client.clone());
        }

        info!(
            proxy = proxy.map_or("none", Url::as_str),
            pools = self.inner.pools.len(),
            "proxy applied to dispatch agent"
        );
        Ok(())
    }
}
