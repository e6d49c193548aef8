//! Upstream forwarding with UDP to TCP fallback
//!
//! One call to [`Forwarder::exchange`] makes at most two attempts: UDP first,
//! then a single TCP retry when UDP failed or came back truncated. The TCP
//! outcome is final.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;

use crate::config::{Protocol, Timeouts};
use crate::error::{Error, Result};
use crate::transport::{DnsTransport, NetworkTransport};

/// A completed upstream exchange
#[derive(Debug, Clone)]
pub struct Exchange {
    /// Parsed upstream response
    pub response: Message,
    /// Raw upstream bytes, relayed as-is when no rewrite is needed
    pub raw: Vec<u8>,
    /// Protocol of the attempt that produced the response
    pub protocol: Protocol,
    /// Time spent across all attempts
    pub elapsed: Duration,
}

/// Forwards raw queries to an upstream resolver
#[derive(Clone)]
pub struct Forwarder {
    transport: Arc<dyn DnsTransport>,
}

impl Forwarder {
    /// Create a forwarder over the given transport
    pub fn new(transport: Arc<dyn DnsTransport>) -> Self {
        Self { transport }
    }

    /// Create a forwarder over real sockets
    pub fn with_timeouts(timeouts: Timeouts) -> Self {
        Self::new(Arc::new(NetworkTransport::new(timeouts)))
    }

    /// Exchange `query` with `upstream`
    pub async fn exchange(&self, query: &[u8], upstream: SocketAddr) -> Result<Exchange> {
        let start = Instant::now();

        match self.attempt(Protocol::Udp, query, upstream).await {
            Ok((response, raw)) if !response.truncated() => {
                return Ok(Exchange {
                    response,
                    raw,
                    protocol: Protocol::Udp,
                    elapsed: start.elapsed(),
                });
            }
            Ok(_) => {
                log::debug!("Truncated UDP response from {}, retrying over TCP", upstream);
            }
            Err(e) => {
                log::debug!(
                    "UDP exchange with {} failed after {:?}: {}, retrying over TCP",
                    upstream,
                    start.elapsed(),
                    e
                );
            }
        }

        match self.attempt(Protocol::Tcp, query, upstream).await {
            Ok((response, raw)) => Ok(Exchange {
                response,
                raw,
                protocol: Protocol::Tcp,
                elapsed: start.elapsed(),
            }),
            Err(e) => {
                log::warn!(
                    "Upstream {} unreachable after {:?}: {}",
                    upstream,
                    start.elapsed(),
                    e
                );
                Err(e)
            }
        }
    }

    async fn attempt(
        &self,
        protocol: Protocol,
        query: &[u8],
        upstream: SocketAddr,
    ) -> Result<(Message, Vec<u8>)> {
        let raw = self.transport.exchange(protocol, upstream, query).await?;
        let response = Message::from_vec(&raw).map_err(|e| {
            Error::Dns(format!("invalid {} response from {}: {}", protocol, upstream, e))
        })?;
        Ok((response, raw))
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder").finish_non_exhaustive()
    }
}
