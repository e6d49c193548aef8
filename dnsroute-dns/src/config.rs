//! Upstream resolver address parsing
//!
//! Upstreams are plain `host:port` pairs reachable over both UDP and TCP:
//! - `IP` - port 53
//! - `IP:port`
//! - `[IPv6]` or `[IPv6]:port`

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default DNS port
pub const DEFAULT_DNS_PORT: u16 = 53;

/// Transport protocol used for a single exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// Datagram exchange (first attempt)
    Udp,
    /// Stream exchange with 2-byte length prefix (fallback)
    Tcp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Udp => write!(f, "udp"),
            Protocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Per-exchange deadlines
///
/// Each phase is bounded independently so an unresponsive upstream
/// can never hold a query task longer than the sum of the three.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Socket bind / TCP connect
    pub dial: Duration,
    /// Waiting for the response
    pub read: Duration,
    /// Sending the query
    pub write: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(5),
            read: Duration::from_secs(5),
            write: Duration::from_secs(5),
        }
    }
}

/// Parse an upstream resolver address, defaulting the port to 53
///
/// Supported formats:
/// - `8.8.8.8` - 8.8.8.8:53
/// - `10.10.1.2:5353` - 10.10.1.2:5353
/// - `[2001:4860:4860::8888]` - port 53
/// - `[2001:4860:4860::8888]:5353`
pub fn parse_upstream(s: &str) -> Result<SocketAddr> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::Config("empty upstream address".into()));
    }
    parse_socket_addr(s, DEFAULT_DNS_PORT)
}

/// Parse an IP address with optional port, defaulting to the given port
fn parse_socket_addr(s: &str, default_port: u16) -> Result<SocketAddr> {
    // Try parsing as full socket address first
    if let Ok(addr) = SocketAddr::from_str(s) {
        return Ok(addr);
    }

    // Handle IPv6 addresses in brackets [::1]:port or [::1]
    if s.starts_with('[') {
        if let Some(bracket_end) = s.find(']') {
            let ip_str = &s[1..bracket_end];
            let ip = ip_str
                .parse::<IpAddr>()
                .map_err(|e| Error::Config(format!("invalid IP address '{}': {}", ip_str, e)))?;

            let port = if s.len() > bracket_end + 1 && s.as_bytes()[bracket_end + 1] == b':' {
                s[bracket_end + 2..]
                    .parse::<u16>()
                    .map_err(|e| Error::Config(format!("invalid port: {}", e)))?
            } else {
                default_port
            };

            return Ok(SocketAddr::new(ip, port));
        }
    }

    // Bare IP address (no port)
    if let Ok(ip) = s.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    // IPv4 with port that failed the strict parse, e.g. a bad port number
    if let Some(colon_pos) = s.rfind(':') {
        let ip_str = &s[..colon_pos];
        let port_str = &s[colon_pos + 1..];

        let ip = ip_str
            .parse::<IpAddr>()
            .map_err(|e| Error::Config(format!("invalid IP address '{}': {}", ip_str, e)))?;
        let port = port_str
            .parse::<u16>()
            .map_err(|e| Error::Config(format!("invalid port '{}': {}", port_str, e)))?;

        return Ok(SocketAddr::new(ip, port));
    }

    Err(Error::Config(format!(
        "cannot parse upstream address '{}'",
        s
    )))
}
