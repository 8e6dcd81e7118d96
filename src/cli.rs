//! CLI argument definitions using clap derive macros.

use clap::Parser;

use dispatch_core::DEFAULT_MAX_RETRIES;
use dispatch_core::dispatch::constants::DEFAULT_CONCURRENCY_CAP;

/// Fetch URLs through the adaptive dispatch layer.
///
/// Requests are pooled per origin, capped by the socket limit, and retried on
/// transient failures with exponential backoff.
#[derive(Parser, Debug)]
#[command(name = "dispatch")]
#[command(author, version, about)]
pub struct Args {
    /// URLs to fetch (reads stdin, one per line, when omitted)
    pub urls: Vec<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Maximum concurrent connections per origin (1-1024)
    #[arg(short = 's', long, default_value_t = DEFAULT_CONCURRENCY_CAP as u16, value_parser = clap::value_parser!(u16).range(1..=1024))]
    pub max_sockets: u16,

    /// Maximum retries for transient failures (0-10)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES as u8, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: u8,

    /// Route requests through this HTTP(S) proxy
    #[arg(short = 'p', long)]
    pub proxy: Option<String>,

    /// Ignore HTTP_PROXY / HTTPS_PROXY / ALL_PROXY from the environment
    #[arg(long)]
    pub no_env_proxy: bool,

    /// Print per-origin pool statistics as JSON after all requests finish
    #[arg(long)]
    pub status: bool,
}
