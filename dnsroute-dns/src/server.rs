//! DNS listener
//!
//! Accepts queries over UDP and TCP on one address and hands every parsed
//! query to a [`RequestHandler`] on its own task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;

use crate::config::Protocol;
use crate::error::{Error, Result};
use crate::message::truncate_for_udp;
use crate::transport::{read_frame, write_frame, MAX_UDP_RESPONSE_SIZE};

/// Default idle time before a client TCP connection is closed
pub const DEFAULT_TCP_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// An inbound DNS query
#[derive(Debug, Clone)]
pub struct Request {
    /// Parsed query
    pub message: Message,
    /// Query bytes as received, forwarded upstream unchanged
    pub raw: Vec<u8>,
    /// Client address
    pub src: SocketAddr,
    /// Protocol the query arrived on
    pub protocol: Protocol,
}

/// Produces the reply for one inbound query
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Handle `request`, returning the wire bytes to send back
    ///
    /// `None` means no reply is sent.
    async fn handle(&self, request: &Request) -> Option<Vec<u8>>;
}

/// UDP + TCP DNS listener
pub struct DnsServer {
    udp: Arc<UdpSocket>,
    tcp: TcpListener,
    handler: Arc<dyn RequestHandler>,
    tcp_idle_timeout: Duration,
}

impl DnsServer {
    /// Bind UDP and TCP sockets on `listen`
    ///
    /// With port 0 the UDP socket picks the port and TCP binds the same one.
    pub async fn bind(listen: SocketAddr, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let udp = UdpSocket::bind(listen)
            .await
            .map_err(|e| Error::Dns(format!("failed to bind UDP listener to {}: {}", listen, e)))?;
        let addr = udp.local_addr()?;

        let tcp = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Dns(format!("failed to bind TCP listener to {}: {}", addr, e)))?;

        Ok(Self {
            udp: Arc::new(udp),
            tcp,
            handler,
            tcp_idle_timeout: DEFAULT_TCP_IDLE_TIMEOUT,
        })
    }

    /// Set how long an idle client TCP connection is kept open
    pub fn with_tcp_idle_timeout(mut self, timeout: Duration) -> Self {
        self.tcp_idle_timeout = timeout;
        self
    }

    /// Get the bound address (shared by UDP and TCP)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp.local_addr()?)
    }

    /// Serve queries until a shutdown signal arrives
    ///
    /// In-flight query tasks are not awaited; they finish on their own.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        log::info!("DNS server listening on {} (udp+tcp)", self.local_addr()?);

        let mut buf = vec![0u8; MAX_UDP_RESPONSE_SIZE];

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    log::info!("DNS server shutting down");
                    break;
                }

                result = self.udp.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => {
                            let raw = buf[..len].to_vec();
                            let socket = self.udp.clone();
                            let handler = self.handler.clone();
                            tokio::spawn(async move {
                                serve_datagram(socket, handler, raw, src).await;
                            });
                        }
                        Err(e) => {
                            log::error!("DNS server UDP recv error: {}", e);
                        }
                    }
                }

                result = self.tcp.accept() => {
                    match result {
                        Ok((stream, src)) => {
                            let handler = self.handler.clone();
                            let idle = self.tcp_idle_timeout;
                            let shutdown = shutdown_rx.resubscribe();
                            tokio::spawn(async move {
                                serve_connection(stream, src, handler, idle, shutdown).await;
                            });
                        }
                        Err(e) => {
                            log::error!("DNS server TCP accept error: {}", e);
                        }
                    }
                }
            }
        }

        Ok(())
    }
}

fn parse_request(raw: Vec<u8>, src: SocketAddr, protocol: Protocol) -> Option<Request> {
    match Message::from_vec(&raw) {
        Ok(message) => Some(Request {
            message,
            raw,
            src,
            protocol,
        }),
        Err(e) => {
            log::debug!("Dropping unparseable {} query from {}: {}", protocol, src, e);
            None
        }
    }
}

async fn serve_datagram(
    socket: Arc<UdpSocket>,
    handler: Arc<dyn RequestHandler>,
    raw: Vec<u8>,
    src: SocketAddr,
) {
    let Some(request) = parse_request(raw, src, Protocol::Udp) else {
        return;
    };

    let Some(mut response) = handler.handle(&request).await else {
        return;
    };

    if let Some(truncated) = truncate_for_udp(&request.message, &response) {
        log::debug!(
            "Reply to {} is {} bytes, sending truncated",
            src,
            response.len()
        );
        response = truncated;
    }

    if let Err(e) = socket.send_to(&response, src).await {
        log::debug!("Failed to send DNS reply to {}: {}", src, e);
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    src: SocketAddr,
    handler: Arc<dyn RequestHandler>,
    idle: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let frame = tokio::select! {
            _ = shutdown_rx.recv() => break,
            frame = tokio::time::timeout(idle, read_frame(&mut stream)) => frame,
        };

        let raw = match frame {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => break,
            Ok(Err(e)) => {
                log::debug!("TCP connection from {} failed: {}", src, e);
                break;
            }
            Err(_) => {
                log::debug!("Closing idle TCP connection from {}", src);
                break;
            }
        };

        let Some(request) = parse_request(raw, src, Protocol::Tcp) else {
            continue;
        };

        if let Some(response) = handler.handle(&request).await {
            if let Err(e) = write_frame(&mut stream, &response).await {
                log::debug!("Failed to send DNS reply to {}: {}", src, e);
                break;
            }
        }
    }
}
