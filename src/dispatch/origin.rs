//! Origin keys identifying a remote endpoint.

use std::fmt;

use url::Url;

use super::DispatchError;

/// Scheme + host + port identity of a remote endpoint.
///
/// Pools are keyed by `Origin`; its string form `scheme://host:port` is the key
/// used in status reports.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin {
    scheme: String,
    host: String,
    port: u16,
}

impl Origin {
    /// Derives the origin of a URL.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidUrl`] when the URL has no host or its
    /// scheme has no known default port and none is given.
    pub fn from_url(url: &Url) -> Result<Self, DispatchError> {
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| DispatchError::invalid_url(url.as_str()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| DispatchError::invalid_url(url.as_str()))?;

        Ok(Self {
            scheme: url.scheme().to_ascii_lowercase(),
            host: host.to_ascii_lowercase(),
            port,
        })
    }

    /// Parses a URL string and derives its origin.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::InvalidUrl`] for unparseable URLs.
    pub fn parse(url: &str) -> Result<Self, DispatchError> {
        let parsed = Url::parse(url).map_err(|_| DispatchError::invalid_url(url))?;
        Self::from_url(&parsed)
    }

    /// URL scheme (lowercase).
    #[must_use]
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name or address literal (lowercase).
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Explicit or default port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The `scheme://host:port` key.
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_uses_default_port() {
        let origin = Origin::parse("https://Example.COM/path/file.bin").unwrap();
        assert_eq!(origin.key(), "https://example.com:443");
        assert_eq!(origin.host(), "example.com");
    }

    #[test]
    fn test_origin_keeps_explicit_port() {
        let origin = Origin::parse("http://localhost:8080/x?y=1").unwrap();
        assert_eq!(origin.key(), "http://localhost:8080");
        assert_eq!(origin.port(), 8080);
    }

    #[test]
    fn test_same_origin_for_different_paths() {
        let a = Origin::parse("https://example.com/a").unwrap();
        let b = Origin::parse("https://example.com:443/b").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_origin_rejects_hostless_url() {
        assert!(matches!(
            Origin::parse("data:text/plain,hello"),
            Err(DispatchError::InvalidUrl { .. })
        ));
        assert!(matches!(
            Origin::parse("not a url"),
            Err(DispatchError::InvalidUrl { .. })
        ));
    }
}
