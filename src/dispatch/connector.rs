//! Connection parameters and HTTP client construction.
//!
//! [`ConnectorConfig`] is fixed for the lifetime of a
//! [`DispatchAgent`](super::DispatchAgent). Every pool gets its own
//! `reqwest::Client` from [`ConnectorConfig::build_client`], and a proxy
//! change rebuilds those clients from the same config.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::{Client, ClientBuilder, Proxy, redirect};
use tracing::debug;
use url::Url;

use super::constants::{
    AUTO_SELECT_FAMILY_ATTEMPT_TIMEOUT, BODY_TIMEOUT, CONNECT_TIMEOUT, KEEP_ALIVE_TIMEOUT,
    MAX_REDIRECTS,
};

const PROJECT_UA_URL: &str = "https://github.com/dispatch-core/dispatch-core";

/// Default User-Agent sent on every dispatched request.
#[must_use]
pub fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("dispatch-core/{version} (+{PROJECT_UA_URL})")
}

/// Immutable parameters for establishing connections.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Time allowed to establish a connection (TCP and TLS).
    pub connect_timeout: Duration,
    /// Per-address attempt window when a host resolves to several families.
    ///
    /// The HTTP stack races address families internally and exposes no knob for
    /// this window; the agent logs it at startup. Pin a family with
    /// [`local_address`](Self::local_address).
    pub family_attempt_timeout: Duration,
    /// Local address to bind outgoing connections to. Its family decides
    /// whether IPv4 or IPv6 is used.
    pub local_address: Option<IpAddr>,
    /// Refuse plain-HTTP URLs.
    pub https_only: bool,
    /// Disable Nagle's algorithm on connection sockets.
    pub tcp_nodelay: bool,
    /// How long an idle connection is kept for reuse.
    pub keep_alive_timeout: Duration,
    /// User-Agent header value.
    pub user_agent: String,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
            family_attempt_timeout: AUTO_SELECT_FAMILY_ATTEMPT_TIMEOUT,
            local_address: None,
            https_only: false,
            tcp_nodelay: true,
            keep_alive_timeout: KEEP_ALIVE_TIMEOUT,
            user_agent: default_user_agent(),
        }
    }
}

impl ConnectorConfig {
    /// Builds a client for one pool.
    ///
    /// The client speaks HTTP/1.1 only, so each admitted request holds one
    /// physical connection. It applies the connect timeout, a body read
    /// timeout, a redirect limit and gzip decoding. With `proxy` set, every
    /// request is routed through it; without, environment and system proxies
    /// are ignored so that proxy routing is controlled by the caller alone.
    ///
    /// # Errors
    ///
    /// Returns the builder error when the proxy URL is rejected or the TLS
    /// backend fails to initialise.
    pub fn build_client(&self, proxy: Option<&Url>) -> Result<Client, reqwest::Error> {
        self.client_builder(proxy)?.build()
    }

    fn client_builder(&self, proxy: Option<&Url>) -> Result<ClientBuilder, reqwest::Error> {
        let builder = Client::builder()
            .http1_only()
            .connect_timeout(self.connect_timeout)
            .read_timeout(BODY_TIMEOUT)
            .redirect(redirect::Policy::limited(MAX_REDIRECTS))
            .pool_idle_timeout(self.keep_alive_timeout)
            .https_only(self.https_only)
            .tcp_nodelay(self.tcp_nodelay)
            .local_address(self.local_address)
            .user_agent(self.user_agent.as_str())
            .gzip(true);

        Ok(match proxy {
            Some(url) => {
                debug!(proxy = %url, "building client with proxy");
                builder.proxy(Proxy::all(url.as_str())?)
            }
            None => builder.no_proxy(),
        })
    }
}
