//! Constants for the dispatch module (timeouts, pool lifecycle, concurrency).

use std::time::Duration;

/// Connect timeout for establishing a raw connection (25 seconds).
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(25_000);

/// Per-family attempt timeout for dual-stack connection racing (850ms).
pub const AUTO_SELECT_FAMILY_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(850);

/// Maximum time to wait for response headers (45 seconds).
pub const HEADERS_TIMEOUT: Duration = Duration::from_millis(45_000);

/// Maximum idle time between body chunks (60 seconds).
pub const BODY_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Maximum number of redirects followed per request.
pub const MAX_REDIRECTS: usize = 5;

/// Quiet period after a drain event before an idle pool is reclaimed (60 seconds).
pub const IDLE_REAP_DELAY: Duration = Duration::from_millis(60_000);

/// Deadline for a graceful pool close before it is force-destroyed (500ms).
pub const GRACEFUL_CLOSE_DEADLINE: Duration = Duration::from_millis(500);

/// How long an idle connection is kept alive for reuse (4 seconds).
pub const KEEP_ALIVE_TIMEOUT: Duration = Duration::from_millis(4_000);

/// Default process-wide connection concurrency cap.
pub const DEFAULT_CONCURRENCY_CAP: usize = 64;

/// Lower bound for range (parallel chunk) concurrency.
pub const MIN_RANGE_CONCURRENCY: usize = 4;
