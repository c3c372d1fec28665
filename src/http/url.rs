//! Target address parsing
//!
//! Only plain `http://host[:port][/path][?query]` URLs are accepted.
//! Credentials and fragments are never sent.

use super::{Error, Result, DEFAULT_HTTP_PORT};
use std::fmt;
use url::Url;

/// IPv4 loopback literal that triggers the `localhost` resolution override
pub const LOCALHOST_IPV4: &str = "127.0.0.1";

/// Host name pinned to the loopback address when a URL targets it
pub const LOCALHOST_NAME: &str = "localhost";

/// Parsed request target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    path: String,
}

impl Endpoint {
    /// Parse an `http://` URL
    pub fn parse(url: &str) -> Result<Self> {
        let parsed = Url::parse(url.trim())
            .map_err(|err| Error::InvalidUrl(format!("{}: {}", err, url)))?;

        if parsed.scheme() != "http" {
            return Err(Error::InvalidUrl(format!(
                "unsupported scheme '{}' in {}",
                parsed.scheme(),
                url
            )));
        }

        let host = match parsed.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => return Err(Error::InvalidUrl(format!("missing host in {}", url))),
        };
        let port = parsed.port_or_known_default().unwrap_or(DEFAULT_HTTP_PORT);

        let path = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        };

        Ok(Endpoint { host, port, path })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path and query, always starting with `/`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port`, as sent in the `Host` header
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check whether the host is the IPv4 loopback literal
    pub fn is_ipv4_loopback(&self) -> bool {
        self.host == LOCALHOST_IPV4
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}:{}{}", self.host, self.port, self.path)
    }
}
