//! Error types for the dispatch module.
//!
//! Every failure site builds a [`DispatchError`] through one of the helper
//! constructors, so the retry policy can read the status code, error code and
//! response headers of any failure through the same accessors.

use std::error::Error as _;
use std::fmt;
use std::io;

use reqwest::header::HeaderMap;
use thiserror::Error;

/// Low-level failure code attached to connection-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Peer reset the connection.
    ConnectionReset,
    /// Peer refused the connection.
    ConnectionRefused,
    /// Host name could not be resolved.
    DnsNotFound,
    /// Local network is down.
    NetworkDown,
    /// No route to the network.
    NetworkUnreachable,
    /// No route to the host.
    HostUnreachable,
    /// Write on a connection the peer already closed.
    BrokenPipe,
    /// Socket closed or failed mid-request.
    Socket,
    /// Connection could not be established before the connect timeout.
    ConnectTimeout,
    /// Response headers did not arrive before the headers timeout.
    HeadersTimeout,
    /// Response body stalled longer than the body timeout.
    BodyTimeout,
    /// Sentinel for failures synthesized from a retryable response status.
    RequestRetry,
    /// The origin's pool was closed and accepts no new work.
    Closed,
    /// The origin's pool was destroyed while the request was outstanding.
    Destroyed,
    /// The request or dispatcher configuration was invalid.
    InvalidArgument,
    /// Anything not covered above.
    Other,
}

impl ErrorCode {
    /// Stable string form used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectionReset => "connection_reset",
            Self::ConnectionRefused => "connection_refused",
            Self::DnsNotFound => "dns_not_found",
            Self::NetworkDown => "network_down",
            Self::NetworkUnreachable => "network_unreachable",
            Self::HostUnreachable => "host_unreachable",
            Self::BrokenPipe => "broken_pipe",
            Self::Socket => "socket",
            Self::ConnectTimeout => "connect_timeout",
            Self::HeadersTimeout => "headers_timeout",
            Self::BodyTimeout => "body_timeout",
            Self::RequestRetry => "request_retry",
            Self::Closed => "closed",
            Self::Destroyed => "destroyed",
            Self::InvalidArgument => "invalid_argument",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by [`DispatchAgent::dispatch`](super::DispatchAgent::dispatch)
/// and the pool lifecycle.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Transport-level failure, classified by an [`ErrorCode`].
    #[error("connection error ({code}) dispatching {url}")]
    Connection {
        /// The URL being dispatched.
        url: String,
        /// Classification of the failure.
        code: ErrorCode,
        /// The underlying client error, when there is one.
        #[source]
        source: Option<reqwest::Error>,
    },

    /// The origin answered with a status listed as retryable and retries ran out.
    #[error("HTTP {status} dispatching {url}")]
    Status {
        /// The URL being dispatched.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Response headers, kept for Retry-After handling.
        headers: HeaderMap,
    },

    /// The request URL cannot be mapped to an origin.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The offending URL.
        url: String,
    },

    /// The origin's pool is closing and rejects new work.
    #[error("pool for {origin} is closed")]
    Closed {
        /// Origin key of the pool.
        origin: String,
    },

    /// The origin's pool was force-destroyed with this request outstanding.
    #[error("pool for {origin} was destroyed")]
    Destroyed {
        /// Origin key of the pool.
        origin: String,
    },

    /// The HTTP client for a pool could not be built.
    #[error("failed to build client for {origin}: {source}")]
    Client {
        /// Origin key of the pool.
        origin: String,
        /// The builder error.
        #[source]
        source: reqwest::Error,
    },
}

impl DispatchError {
    /// Creates a connection error from a client error, classifying its code.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Connection {
            url: url.into(),
            code: classify_reqwest_error(&source),
            source: Some(source),
        }
    }

    /// Creates a connection error with an explicit code and no underlying error.
    pub fn connection(url: impl Into<String>, code: ErrorCode) -> Self {
        Self::Connection {
            url: url.into(),
            code,
            source: None,
        }
    }

    /// Creates a headers-timeout error.
    pub fn headers_timeout(url: impl Into<String>) -> Self {
        Self::connection(url, ErrorCode::HeadersTimeout)
    }

    /// Creates a status error carrying the response headers.
    pub fn status(url: impl Into<String>, status: u16, headers: HeaderMap) -> Self {
        Self::Status {
            url: url.into(),
            status,
            headers,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a closed-pool error.
    pub fn closed(origin: impl Into<String>) -> Self {
        Self::Closed {
            origin: origin.into(),
        }
    }

    /// Creates a destroyed-pool error.
    pub fn destroyed(origin: impl Into<String>) -> Self {
        Self::Destroyed {
            origin: origin.into(),
        }
    }

    /// Creates a client-build error.
    pub fn client(origin: impl Into<String>, source: reqwest::Error) -> Self {
        Self::Client {
            origin: origin.into(),
            source,
        }
    }

    /// HTTP status code carried by the failure, if any.
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Low-level error code carried by the failure, if any.
    ///
    /// Status failures report [`ErrorCode::RequestRetry`].
    #[must_use]
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Self::Connection { code, .. } => Some(*code),
            Self::Status { .. } => Some(ErrorCode::RequestRetry),
            Self::InvalidUrl { .. } | Self::Client { .. } => Some(ErrorCode::InvalidArgument),
            Self::Closed { .. } => Some(ErrorCode::Closed),
            Self::Destroyed { .. } => Some(ErrorCode::Destroyed),
        }
    }

    /// Response headers carried by the failure, if any.
    #[must_use]
    pub fn headers(&self) -> Option<&HeaderMap> {
        match self {
            Self::Status { headers, .. } => Some(headers),
            _ => None,
        }
    }
}

/// Maps a client error onto an [`ErrorCode`].
///
/// Timeouts are checked first, then the first `io::Error` in the source chain.
/// Resolver failures carry no `io::ErrorKind` and are detected by message.
fn classify_reqwest_error(error: &reqwest::Error) -> ErrorCode {
    if error.is_timeout() {
        return if error.is_connect() {
            ErrorCode::ConnectTimeout
        } else {
            ErrorCode::BodyTimeout
        };
    }

    if let Some(kind) = io_error_kind(error) {
        match kind {
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                return ErrorCode::ConnectionReset;
            }
            io::ErrorKind::ConnectionRefused => return ErrorCode::ConnectionRefused,
            io::ErrorKind::NetworkDown => return ErrorCode::NetworkDown,
            io::ErrorKind::NetworkUnreachable => return ErrorCode::NetworkUnreachable,
            io::ErrorKind::HostUnreachable => return ErrorCode::HostUnreachable,
            io::ErrorKind::BrokenPipe => return ErrorCode::BrokenPipe,
            io::ErrorKind::TimedOut => return ErrorCode::ConnectTimeout,
            io::ErrorKind::UnexpectedEof => return ErrorCode::Socket,
            _ => {}
        }
    }

    let message = error_chain_text(error).to_lowercase();
    if message.contains("dns error") || message.contains("failed to lookup address") {
        return ErrorCode::DnsNotFound;
    }

    if error.is_connect() || error.is_request() || error.is_body() || error.is_decode() {
        ErrorCode::Socket
    } else {
        ErrorCode::Other
    }
}

fn io_error_kind(error: &reqwest::Error) -> Option<io::ErrorKind> {
    let mut source = error.source();
    while let Some(inner) = source {
        if let Some(io_error) = inner.downcast_ref::<io::Error>() {
            return Some(io_error.kind());
        }
        source = inner.source();
    }
    None
}

fn error_chain_text(error: &reqwest::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}
