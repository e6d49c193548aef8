//! Upstream transports
//!
//! A [`DnsTransport`] performs exactly one request/response exchange with an
//! upstream resolver over a given [`Protocol`]. Retry and fallback policy
//! belongs to [`crate::Forwarder`]; transports only enforce deadlines.
//!
//! The [`mock`] module provides a scripted transport for exercising that
//! policy without sockets.

pub mod mock;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};

use crate::config::{Protocol, Timeouts};
use crate::error::{Error, Result};

/// Maximum UDP DNS response size
pub(crate) const MAX_UDP_RESPONSE_SIZE: usize = 4096;

/// Maximum TCP DNS message size
pub(crate) const MAX_TCP_MESSAGE_SIZE: usize = 65535;

/// DNS header length; anything shorter cannot carry a message id
pub(crate) const DNS_HEADER_LEN: usize = 12;

/// A single upstream exchange over a chosen protocol
#[async_trait]
pub trait DnsTransport: Send + Sync {
    /// Send `query` to `upstream` and return the raw response bytes
    ///
    /// Implementations must bound every phase of the exchange; a missing
    /// response surfaces as [`Error::Timeout`].
    async fn exchange(
        &self,
        protocol: Protocol,
        upstream: SocketAddr,
        query: &[u8],
    ) -> Result<Vec<u8>>;
}

/// Transport over real UDP and TCP sockets
#[derive(Debug, Clone, Default)]
pub struct NetworkTransport {
    timeouts: Timeouts,
}

impl NetworkTransport {
    /// Create a transport with the given per-phase deadlines
    pub fn new(timeouts: Timeouts) -> Self {
        Self { timeouts }
    }

    /// Get the configured deadlines
    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Send a DNS query over UDP
    ///
    /// Datagrams from other sources or carrying another message id are
    /// discarded; the read deadline covers the whole wait.
    async fn exchange_udp(&self, upstream: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
        if query.len() < DNS_HEADER_LEN {
            return Err(Error::Dns("DNS query too short".into()));
        }

        let bind_addr = if upstream.is_ipv6() {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        };

        let socket = match tokio::time::timeout(self.timeouts.dial, UdpSocket::bind(bind_addr)).await {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(Error::Dns(format!("failed to bind UDP socket: {}", e))),
            Err(_) => return Err(Error::Timeout("UDP socket bind timed out".into())),
        };

        match tokio::time::timeout(self.timeouts.write, socket.send_to(query, upstream)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(Error::Dns(format!("failed to send DNS query: {}", e))),
            Err(_) => return Err(Error::Timeout(format!("UDP send to {} timed out", upstream))),
        }

        let query_id = [query[0], query[1]];
        let deadline = tokio::time::Instant::now() + self.timeouts.read;
        let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];

        loop {
            let result = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await;

            match result {
                Ok(Ok((len, from))) => {
                    if from != upstream || len < DNS_HEADER_LEN || buf[..2] != query_id {
                        log::debug!("Discarding unexpected {}-byte datagram from {}", len, from);
                        continue;
                    }
                    buf.truncate(len);
                    return Ok(buf);
                }
                Ok(Err(e)) => {
                    return Err(Error::Dns(format!("failed to receive DNS response: {}", e)))
                }
                Err(_) => {
                    return Err(Error::Timeout(format!(
                        "no UDP response from {} within {:?}",
                        upstream, self.timeouts.read
                    )))
                }
            }
        }
    }

    /// Send a DNS query over TCP
    async fn exchange_tcp(&self, upstream: SocketAddr, query: &[u8]) -> Result<Vec<u8>> {
        let result = tokio::time::timeout(self.timeouts.dial, TcpStream::connect(upstream)).await;

        let mut stream = match result {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                return Err(Error::Dns(format!("TCP connect to {} failed: {}", upstream, e)))
            }
            Err(_) => return Err(Error::Timeout(format!("TCP connect to {} timed out", upstream))),
        };

        match tokio::time::timeout(self.timeouts.write, write_frame(&mut stream, query)).await {
            Ok(result) => result?,
            Err(_) => return Err(Error::Timeout(format!("TCP write to {} timed out", upstream))),
        }

        match tokio::time::timeout(self.timeouts.read, read_frame(&mut stream)).await {
            Ok(Ok(Some(response))) => Ok(response),
            Ok(Ok(None)) => Err(Error::Dns(format!(
                "{} closed the connection without answering",
                upstream
            ))),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout(format!("TCP read from {} timed out", upstream))),
        }
    }
}

#[async_trait]
impl DnsTransport for NetworkTransport {
    async fn exchange(
        &self,
        protocol: Protocol,
        upstream: SocketAddr,
        query: &[u8],
    ) -> Result<Vec<u8>> {
        match protocol {
            Protocol::Udp => self.exchange_udp(upstream, query).await,
            Protocol::Tcp => self.exchange_tcp(upstream, query).await,
        }
    }
}

/// Write one length-prefixed DNS message to a stream
pub(crate) async fn write_frame<S>(stream: &mut S, message: &[u8]) -> Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    if message.len() > MAX_TCP_MESSAGE_SIZE {
        return Err(Error::Dns(format!(
            "DNS message of {} bytes exceeds TCP frame limit",
            message.len()
        )));
    }

    let len = message.len() as u16;
    let mut frame = Vec::with_capacity(2 + message.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(message);

    stream
        .write_all(&frame)
        .await
        .map_err(|e| Error::Dns(format!("stream write failed: {}", e)))
}

/// Read one length-prefixed DNS message from a stream
///
/// Returns `Ok(None)` when the peer closed the stream cleanly before a new frame.
pub(crate) async fn read_frame<S>(stream: &mut S) -> Result<Option<Vec<u8>>>
where
    S: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 2];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(Error::Dns(format!("stream read failed: {}", e))),
    }

    let len = u16::from_be_bytes(len_buf) as usize;
    if len < DNS_HEADER_LEN {
        return Err(Error::Dns(format!("DNS frame of {} bytes is too short", len)));
    }

    let mut message = vec![0u8; len];
    stream
        .read_exact(&mut message)
        .await
        .map_err(|e| Error::Dns(format!("stream read failed: {}", e)))?;

    Ok(Some(message))
}
