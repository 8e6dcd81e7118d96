//! Retry decisions for failed dispatches.
//!
//! [`RetryPolicy`] holds the retry options of a request and decides, for one
//! failure, whether to retry and how long to wait first. The decision is a pure
//! function of the failure, the request's [`RetryState`], and the origin pool's
//! live [`PoolStats`]; waiting is left to the caller.
//!
//! # Decision order
//!
//! The first matching rule wins:
//!
//! 1. Request marked non-retryable: fail.
//! 2. Error code other than [`ErrorCode::RequestRetry`] and not in
//!    `error_codes`: fail, except a connect timeout against an origin whose pool
//!    shows any activity, which is treated as contention and continues.
//! 3. `methods` configured and the method is not listed: fail.
//! 4. Status code present and not in `status_codes`: fail.
//! 5. Retry counter above `max_retries`: fail.
//! 6. Wait for a positive `Retry-After` delay (capped at `max_timeout`), or
//!    `min(min_timeout * timeout_factor^(counter - 1), max_timeout)`.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use dispatch_core::dispatch::{DispatchError, RetryDecision, RetryPolicy, RetryState};
//! use reqwest::Method;
//! use reqwest::header::HeaderMap;
//!
//! let policy = RetryPolicy::default();
//! let mut state = RetryState::new(Method::GET);
//! state.record_attempt();
//!
//! let error = DispatchError::status("https://example.com/file.bin", 503, HeaderMap::new());
//! match policy.decide(&error, &state, None) {
//!     RetryDecision::Retry { wait, attempt } => {
//!         assert_eq!(attempt, 1);
//!         assert_eq!(wait, Duration::from_millis(500));
//!     }
//!     RetryDecision::DoNotRetry { reason } => panic!("unexpected: {reason}"),
//! }
//! ```

use std::time::{Duration, SystemTime};

use reqwest::Method;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use tracing::{debug, instrument};

use super::{DispatchError, ErrorCode, PoolStats};

/// Default maximum number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default first backoff delay (500ms).
const DEFAULT_MIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Default backoff cap (30 seconds).
const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default backoff multiplier (doubles each retry).
const DEFAULT_TIMEOUT_FACTOR: f64 = 2.0;

/// Response statuses retried by default.
pub const DEFAULT_RETRY_STATUS_CODES: &[u16] = &[500, 502, 503, 504, 429];

/// Connection error codes retried by default.
pub const DEFAULT_RETRY_ERROR_CODES: &[ErrorCode] = &[
    ErrorCode::ConnectionReset,
    ErrorCode::ConnectionRefused,
    ErrorCode::DnsNotFound,
    ErrorCode::NetworkDown,
    ErrorCode::NetworkUnreachable,
    ErrorCode::HostUnreachable,
    ErrorCode::BrokenPipe,
    ErrorCode::Socket,
];

/// Decision on whether to retry a failed dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after waiting.
    Retry {
        /// How long to wait before the next attempt.
        wait: Duration,
        /// The retry counter this decision was made for (1 for the first retry).
        attempt: u32,
    },

    /// Surface the failure to the caller.
    DoNotRetry {
        /// Human-readable reason.
        reason: String,
    },
}

/// Per-request retry bookkeeping, created at request start.
#[derive(Debug, Clone)]
pub struct RetryState {
    counter: u32,
    method: Method,
    retryable: bool,
}

impl RetryState {
    /// Creates state for a retryable request.
    #[must_use]
    pub fn new(method: Method) -> Self {
        Self {
            counter: 0,
            method,
            retryable: true,
        }
    }

    /// Creates state for a request the caller marked as non-retryable.
    #[must_use]
    pub fn non_retryable(method: Method) -> Self {
        Self {
            retryable: false,
            ..Self::new(method)
        }
    }

    /// Counts one failed attempt. Called before each [`RetryPolicy::decide`],
    /// so the first evaluation sees a counter of 1.
    pub fn record_attempt(&mut self) -> u32 {
        self.counter += 1;
        self.counter
    }

    /// Failed attempts counted so far.
    #[must_use]
    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// Request method.
    #[must_use]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Whether the caller allows retries at all.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.retryable
    }
}

/// Retry options and the decision function.
///
/// # Default Values
///
/// - `max_retries`: 5
/// - `min_timeout`: 500ms
/// - `max_timeout`: 30 seconds
/// - `timeout_factor`: 2.0
/// - `status_codes`: 500, 502, 503, 504, 429
/// - `error_codes`: reset, refused, DNS, network down/unreachable, host
///   unreachable, broken pipe, socket
/// - `methods`: GET, HEAD, OPTIONS, PUT, DELETE, TRACE
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    min_timeout: Duration,
    max_timeout: Duration,
    timeout_factor: f64,
    status_codes: Vec<u16>,
    error_codes: Vec<ErrorCode>,
    /// `None` allows every method.
    methods: Option<Vec<Method>>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            min_timeout: DEFAULT_MIN_TIMEOUT,
            max_timeout: DEFAULT_MAX_TIMEOUT,
            timeout_factor: DEFAULT_TIMEOUT_FACTOR,
            status_codes: DEFAULT_RETRY_STATUS_CODES.to_vec(),
            error_codes: DEFAULT_RETRY_ERROR_CODES.to_vec(),
            methods: Some(vec![
                Method::GET,
                Method::HEAD,
                Method::OPTIONS,
                Method::PUT,
                Method::DELETE,
                Method::TRACE,
            ]),
        }
    }
}

impl RetryPolicy {
    /// Sets the maximum number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the first backoff delay and the cap for every wait.
    #[must_use]
    pub fn with_timeouts(mut self, min_timeout: Duration, max_timeout: Duration) -> Self {
        self.min_timeout = min_timeout;
        self.max_timeout = max_timeout;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_timeout_factor(mut self, timeout_factor: f64) -> Self {
        self.timeout_factor = timeout_factor;
        self
    }

    /// Replaces the retryable response statuses.
    #[must_use]
    pub fn with_status_codes(mut self, status_codes: impl Into<Vec<u16>>) -> Self {
        self.status_codes = status_codes.into();
        self
    }

    /// Replaces the retryable connection error codes.
    #[must_use]
    pub fn with_error_codes(mut self, error_codes: impl Into<Vec<ErrorCode>>) -> Self {
        self.error_codes = error_codes.into();
        self
    }

    /// Restricts retries to the given methods, or allows all with `None`.
    #[must_use]
    pub fn with_methods(mut self, methods: Option<Vec<Method>>) -> Self {
        self.methods = methods;
        self
    }

    /// Maximum number of retries.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Cap applied to every wait.
    #[must_use]
    pub fn max_timeout(&self) -> Duration {
        self.max_timeout
    }

    /// Whether a response with this status is turned into a retryable failure.
    ///
    /// Statuses below 300 and statuses not listed pass through to the caller.
    #[must_use]
    pub fn is_retryable_status(&self, status: u16) -> bool {
        status >= 300 && self.status_codes.contains(&status)
    }

    /// Decides whether to retry one failure.
    ///
    /// # Arguments
    ///
    /// * `error` - The failure of the attempt that just finished
    /// * `state` - The request's retry state, counter already incremented
    /// * `pool_stats` - Live stats of the origin's pool, if it has one
    #[instrument(skip_all, fields(counter = state.counter, method = %state.method))]
    pub fn decide(
        &self,
        error: &DispatchError,
        state: &RetryState,
        pool_stats: Option<&PoolStats>,
    ) -> RetryDecision {
        if !state.retryable {
            return RetryDecision::DoNotRetry {
                reason: "request marked non-retryable".to_string(),
            };
        }

        if let Some(code) = error.error_code()
            && code != ErrorCode::RequestRetry
            && !self.error_codes.contains(&code)
        {
            let contended = code == ErrorCode::ConnectTimeout
                && pool_stats.is_some_and(PoolStats::has_activity);
            if !contended {
                return RetryDecision::DoNotRetry {
                    reason: format!("error code {code} is not retryable"),
                };
            }
            debug!(?pool_stats, "connect timeout on a busy origin, treating as contention");
        }

        if let Some(methods) = &self.methods
            && !methods.contains(&state.method)
        {
            return RetryDecision::DoNotRetry {
                reason: format!("method {} is not retryable", state.method),
            };
        }

        if let Some(status) = error.status_code()
            && !self.status_codes.contains(&status)
        {
            return RetryDecision::DoNotRetry {
                reason: format!("status {status} is not retryable"),
            };
        }

        if state.counter > self.max_retries {
            debug!(max = self.max_retries, "max retries reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }

        let header_wait = error
            .headers()
            .and_then(retry_after_header)
            .and_then(retry_after_millis)
            .filter(|millis| *millis > 0)
            .map(|millis| {
                #[allow(clippy::cast_sign_loss)]
                let wait = Duration::from_millis(millis as u64);
                wait.min(self.max_timeout)
            });
        let wait = header_wait.unwrap_or_else(|| self.backoff(state.counter));

        debug!(
            wait_ms = wait.as_millis(),
            using_retry_after = header_wait.is_some(),
            "will retry"
        );

        RetryDecision::Retry {
            wait,
            attempt: state.counter,
        }
    }

    /// `min(min_timeout * timeout_factor^(counter - 1), max_timeout)`.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn backoff(&self, counter: u32) -> Duration {
        let exponent = i32::try_from(counter.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay_ms = self.min_timeout.as_millis() as f64 * self.timeout_factor.powi(exponent);
        let capped_ms = delay_ms.min(self.max_timeout.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }
}

fn retry_after_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Converts a `Retry-After` value into milliseconds from now.
///
/// Numeric values are seconds (fractions allowed); anything else is parsed as
/// an HTTP-date. Dates in the past yield a negative value. Returns `None` when
/// neither form parses.
///
/// # Examples
///
/// ```
/// use dispatch_core::dispatch::retry_after_millis;
///
/// assert_eq!(retry_after_millis("5"), Some(5000));
/// assert_eq!(retry_after_millis("0.25"), Some(250));
/// assert_eq!(retry_after_millis("soon"), None);
/// ```
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn retry_after_millis(value: &str) -> Option<i64> {
    let value = value.trim();

    if let Ok(seconds) = value.parse::<f64>() {
        return seconds
            .is_finite()
            .then(|| (seconds * 1000.0).round() as i64);
    }

    let date = httpdate::parse_http_date(value).ok()?;
    let now = SystemTime::now();
    let millis = match date.duration_since(now) {
        Ok(ahead) => i64::try_from(ahead.as_millis()).unwrap_or(i64::MAX),
        Err(behind) => -i64::try_from(behind.duration().as_millis()).unwrap_or(i64::MAX),
    };
    Some(millis)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use reqwest::header::HeaderValue;

    use super::*;

    fn state_at(counter: u32, method: Method) -> RetryState {
        let mut state = RetryState::new(method);
        for _ in 0..counter {
            state.record_attempt();
        }
        state
    }

    fn status_error(status: u16) -> DispatchError {
        DispatchError::status("https://example.com/file.bin", status, HeaderMap::new())
    }

    fn status_error_with_retry_after(status: u16, value: &str) -> DispatchError {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        DispatchError::status("https://example.com/file.bin", status, headers)
    }

    fn wait_of(decision: RetryDecision) -> Duration {
        match decision {
            RetryDecision::Retry { wait, .. } => wait,
            RetryDecision::DoNotRetry { reason } => panic!("expected retry, got: {reason}"),
        }
    }

    fn busy_stats() -> PoolStats {
        PoolStats {
            running: 1,
            ..PoolStats::default()
        }
    }

    // ==================== Defaults ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.min_timeout, Duration::from_millis(500));
        assert_eq!(policy.max_timeout, Duration::from_secs(30));
        assert!((policy.timeout_factor - 2.0).abs() < f64::EPSILON);
        assert_eq!(policy.status_codes, vec![500, 502, 503, 504, 429]);
        assert!(policy.methods.as_ref().unwrap().contains(&Method::PUT));
        assert!(!policy.methods.as_ref().unwrap().contains(&Method::POST));
    }

    #[test]
    fn test_retry_state_counter_starts_at_one() {
        let mut state = RetryState::new(Method::GET);
        assert_eq!(state.counter(), 0);
        assert_eq!(state.record_attempt(), 1);
        assert_eq!(state.counter(), 1);
    }

    // ==================== Decision order ====================

    #[test]
    fn test_non_retryable_request_fails_immediately() {
        let mut state = RetryState::non_retryable(Method::GET);
        state.record_attempt();
        let decision = RetryPolicy::default().decide(&status_error(503), &state, None);
        assert!(matches!(decision, RetryDecision::DoNotRetry { reason } if reason.contains("non-retryable")));
    }

    #[test]
    fn test_retryable_error_code_retries() {
        let error = DispatchError::connection("https://example.com", ErrorCode::ConnectionReset);
        let decision = RetryPolicy::default().decide(&error, &state_at(1, Method::GET), None);
        assert!(matches!(decision, RetryDecision::Retry { attempt: 1, .. }));
    }

    #[test]
    fn test_unlisted_error_code_fails() {
        let error = DispatchError::connection("https://example.com", ErrorCode::HeadersTimeout);
        let decision =
            RetryPolicy::default().decide(&error, &state_at(1, Method::GET), Some(&busy_stats()));
        assert!(matches!(decision, RetryDecision::DoNotRetry { reason } if reason.contains("headers_timeout")));
    }

    #[test]
    fn test_connect_timeout_retried_when_pool_is_busy() {
        let error = DispatchError::connection("https://example.com", ErrorCode::ConnectTimeout);
        let decision =
            RetryPolicy::default().decide(&error, &state_at(1, Method::GET), Some(&busy_stats()));
        assert!(matches!(decision, RetryDecision::Retry { .. }));
    }

    #[test]
    fn test_connect_timeout_fails_when_pool_is_idle() {
        let error = DispatchError::connection("https://example.com", ErrorCode::ConnectTimeout);
        let policy = RetryPolicy::default();
        let idle = PoolStats::default();
        assert!(matches!(
            policy.decide(&error, &state_at(1, Method::GET), Some(&idle)),
            RetryDecision::DoNotRetry { .. }
        ));
        assert!(matches!(
            policy.decide(&error, &state_at(1, Method::GET), None),
            RetryDecision::DoNotRetry { .. }
        ));
    }

    #[test]
    fn test_connect_timeout_on_busy_pool_still_checks_method() {
        let error = DispatchError::connection("https://example.com", ErrorCode::ConnectTimeout);
        let decision =
            RetryPolicy::default().decide(&error, &state_at(1, Method::POST), Some(&busy_stats()));
        assert!(matches!(decision, RetryDecision::DoNotRetry { reason } if reason.contains("POST")));
    }

    #[test]
    fn test_unlisted_method_fails() {
        let decision =
            RetryPolicy::default().decide(&status_error(503), &state_at(1, Method::POST), None);
        assert!(matches!(decision, RetryDecision::DoNotRetry { .. }));
    }

    #[test]
    fn test_unrestricted_methods_allow_post() {
        let policy = RetryPolicy::default().with_methods(None);
        let decision = policy.decide(&status_error(503), &state_at(1, Method::POST), None);
        assert!(matches!(decision, RetryDecision::Retry { .. }));
    }

    #[test]
    fn test_unlisted_status_fails() {
        let decision =
            RetryPolicy::default().decide(&status_error(404), &state_at(1, Method::GET), None);
        assert!(matches!(decision, RetryDecision::DoNotRetry { reason } if reason.contains("404")));
    }

    #[test]
    fn test_counter_above_max_retries_fails() {
        let policy = RetryPolicy::default().with_max_retries(3);
        assert!(matches!(
            policy.decide(&status_error(503), &state_at(3, Method::GET), None),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        let decision = policy.decide(&status_error(503), &state_at(4, Method::GET), None);
        assert!(matches!(decision, RetryDecision::DoNotRetry { reason } if reason.contains("exhausted")));
    }

    #[test]
    fn test_exhaustion_wins_over_everything_retryable() {
        let policy = RetryPolicy::default().with_max_retries(2);
        let errors = [
            status_error(503),
            status_error_with_retry_after(429, "1"),
            DispatchError::connection("https://example.com", ErrorCode::Socket),
        ];
        for error in &errors {
            assert!(matches!(
                policy.decide(error, &state_at(3, Method::GET), Some(&busy_stats())),
                RetryDecision::DoNotRetry { .. }
            ));
        }
    }

    // ==================== Wait calculation ====================

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::default().with_timeouts(
            Duration::from_millis(100),
            Duration::from_millis(100_000),
        );
        let wait = wait_of(policy.decide(&status_error(503), &state_at(3, Method::GET), None));
        assert_eq!(wait, Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_sequence_and_cap() {
        let policy = RetryPolicy::default()
            .with_max_retries(10)
            .with_timeouts(Duration::from_millis(500), Duration::from_millis(3000));
        let waits: Vec<u128> = (1..=5)
            .map(|counter| {
                wait_of(policy.decide(&status_error(502), &state_at(counter, Method::GET), None))
                    .as_millis()
            })
            .collect();
        assert_eq!(waits, vec![500, 1000, 2000, 3000, 3000]);
    }

    #[test]
    fn test_retry_after_seconds() {
        let policy = RetryPolicy::default().with_timeouts(
            Duration::from_millis(500),
            Duration::from_millis(10_000),
        );
        let error = status_error_with_retry_after(429, "5");
        let wait = wait_of(policy.decide(&error, &state_at(1, Method::GET), None));
        assert_eq!(wait, Duration::from_millis(5000));
    }

    #[test]
    fn test_retry_after_clamped_to_max_timeout() {
        let policy = RetryPolicy::default().with_timeouts(
            Duration::from_millis(500),
            Duration::from_millis(10_000),
        );
        let error = status_error_with_retry_after(503, "120");
        let wait = wait_of(policy.decide(&error, &state_at(1, Method::GET), None));
        assert_eq!(wait, Duration::from_millis(10_000));
    }

    #[test]
    fn test_retry_after_http_date() {
        let policy = RetryPolicy::default().with_timeouts(
            Duration::from_millis(500),
            Duration::from_millis(10_000),
        );
        let future = httpdate::fmt_http_date(SystemTime::now() + Duration::from_secs(2));
        let error = status_error_with_retry_after(503, &future);
        let wait = wait_of(policy.decide(&error, &state_at(1, Method::GET), None));
        // HTTP-dates have one-second resolution.
        assert!(
            wait >= Duration::from_millis(900) && wait <= Duration::from_millis(2100),
            "wait should be ~2s, got {wait:?}"
        );
    }

    #[test]
    fn test_zero_or_negative_retry_after_falls_back_to_backoff() {
        let policy = RetryPolicy::default();
        for value in ["0", "-3", "Wed, 01 Jan 2020 00:00:00 GMT", "garbage"] {
            let error = status_error_with_retry_after(503, value);
            let wait = wait_of(policy.decide(&error, &state_at(2, Method::GET), None));
            assert_eq!(wait, Duration::from_millis(1000), "value {value:?}");
        }
    }

    #[test]
    fn test_wait_never_exceeds_max_timeout() {
        let policy = RetryPolicy::default()
            .with_max_retries(20)
            .with_timeouts(Duration::from_millis(250), Duration::from_millis(4000));
        for counter in 1..=20 {
            let wait =
                wait_of(policy.decide(&status_error(500), &state_at(counter, Method::HEAD), None));
            assert!(wait <= Duration::from_millis(4000));
        }
    }

    // ==================== Response statuses ====================

    #[test]
    fn test_is_retryable_status() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable_status(503));
        assert!(policy.is_retryable_status(429));
        assert!(!policy.is_retryable_status(404));
        assert!(!policy.is_retryable_status(200));

        let odd = RetryPolicy::default().with_status_codes(vec![200, 503]);
        assert!(!odd.is_retryable_status(200));
    }

    // ==================== retry_after_millis ====================

    #[test]
    fn test_retry_after_millis_forms() {
        assert_eq!(retry_after_millis("120"), Some(120_000));
        assert_eq!(retry_after_millis("  7  "), Some(7000));
        assert_eq!(retry_after_millis("-2"), Some(-2000));
        assert_eq!(retry_after_millis("NaN"), None);
        assert_eq!(retry_after_millis(""), None);
        assert!(retry_after_millis("Wed, 01 Jan 2020 00:00:00 GMT").unwrap() < 0);
    }
}
