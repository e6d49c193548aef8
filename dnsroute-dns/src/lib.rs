//! dnsroute-dns - DNS forwarding plumbing
//!
//! This crate provides the wire-level half of the dnsroute proxy:
//! - Upstream exchanges over UDP and TCP with bounded timeouts
//! - A forwarder that retries once over TCP on UDP failure or truncation
//! - Message helpers (IPv6 stripping, SERVFAIL, UDP truncation)
//! - A UDP+TCP listener that dispatches queries to a [`RequestHandler`]
//!
//! Routing decisions and side effects live in `dnsroute-engine`.
//!
//! # Example
//!
//! ```no_run
//! use dnsroute_dns::{parse_upstream, Forwarder, Timeouts};
//!
//! # async fn example(query: &[u8]) -> dnsroute_dns::Result<()> {
//! let upstream = parse_upstream("192.168.0.200")?;
//! let forwarder = Forwarder::with_timeouts(Timeouts::default());
//!
//! let exchange = forwarder.exchange(query, upstream).await?;
//! println!("{} answers via {}", exchange.response.answers().len(), exchange.protocol);
//! # Ok(())
//! # }
//! ```

mod config;
pub mod error;
mod forwarder;
pub mod message;
mod server;
pub mod transport;

pub use config::{parse_upstream, Protocol, Timeouts, DEFAULT_DNS_PORT};
pub use error::{Error, Result};
pub use forwarder::{Exchange, Forwarder};
pub use message::{normalize, normalize_name, servfail, strip_ipv6, truncate_for_udp};
pub use server::{DnsServer, Request, RequestHandler, DEFAULT_TCP_IDLE_TIMEOUT};
pub use transport::{DnsTransport, NetworkTransport};

// Re-exported so dependents build messages against the same version
pub use hickory_proto;
