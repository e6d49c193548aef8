//! Mock transport for testing
//!
//! [`MockTransport`] answers exchanges from per-protocol scripts and records
//! every call, so fallback and timeout policy can be tested without sockets.
//!
//! # Example
//!
//! ```ignore
//! use dnsroute_dns::transport::mock::{MockReply, MockTransport};
//! use dnsroute_dns::Protocol;
//!
//! let transport = MockTransport::new();
//! transport.push(Protocol::Udp, MockReply::Timeout);
//! transport.push(Protocol::Tcp, MockReply::Response(answer_bytes));
//! ```

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;

use async_trait::async_trait;

use super::DnsTransport;
use crate::config::Protocol;
use crate::error::{Error, Result};

/// Scripted outcome of one exchange
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return these bytes as the response
    Response(Vec<u8>),
    /// Fail with [`Error::Timeout`]
    Timeout,
    /// Fail with [`Error::Dns`]
    Fail(String),
}

impl MockReply {
    fn into_result(self) -> Result<Vec<u8>> {
        match self {
            MockReply::Response(bytes) => Ok(bytes),
            MockReply::Timeout => Err(Error::Timeout("mock exchange timed out".into())),
            MockReply::Fail(msg) => Err(Error::Dns(msg)),
        }
    }
}

/// A recorded exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    pub protocol: Protocol,
    pub upstream: SocketAddr,
    pub query: Vec<u8>,
}

type Responder = Box<dyn Fn(Protocol, &[u8]) -> MockReply + Send + Sync>;

/// Scripted [`DnsTransport`]
///
/// Scripted replies are consumed first; once a protocol's script is empty
/// the responder (if any) answers, otherwise the exchange fails.
#[derive(Default)]
pub struct MockTransport {
    udp: Mutex<VecDeque<MockReply>>,
    tcp: Mutex<VecDeque<MockReply>>,
    responder: Mutex<Option<Responder>>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockTransport {
    /// Create an empty mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next exchange over `protocol`
    pub fn push(&self, protocol: Protocol, reply: MockReply) {
        self.queue(protocol).lock().unwrap().push_back(reply);
    }

    /// Answer unscripted exchanges with a callback
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(Protocol, &[u8]) -> MockReply + Send + Sync + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// Get all recorded exchanges in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Get the protocols used, in order
    pub fn protocols(&self) -> Vec<Protocol> {
        self.calls.lock().unwrap().iter().map(|c| c.protocol).collect()
    }

    fn queue(&self, protocol: Protocol) -> &Mutex<VecDeque<MockReply>> {
        match protocol {
            Protocol::Udp => &self.udp,
            Protocol::Tcp => &self.tcp,
        }
    }
}

#[async_trait]
impl DnsTransport for MockTransport {
    async fn exchange(
        &self,
        protocol: Protocol,
        upstream: SocketAddr,
        query: &[u8],
    ) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(MockCall {
            protocol,
            upstream,
            query: query.to_vec(),
        });

        let scripted = self.queue(protocol).lock().unwrap().pop_front();
        let reply = match scripted {
            Some(reply) => reply,
            None => match self.responder.lock().unwrap().as_ref() {
                Some(responder) => responder(protocol, query),
                None => MockReply::Fail(format!("no scripted {} reply", protocol)),
            },
        };

        reply.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream() -> SocketAddr {
        "127.0.0.1:53".parse().unwrap()
    }

    #[tokio::test]
    async fn test_scripted_replies_in_order() {
        let mock = MockTransport::new();
        mock.push(Protocol::Udp, MockReply::Timeout);
        mock.push(Protocol::Udp, MockReply::Response(vec![1, 2]));

        let first = mock.exchange(Protocol::Udp, upstream(), &[0]).await;
        assert!(first.unwrap_err().is_timeout());

        let second = mock.exchange(Protocol::Udp, upstream(), &[0]).await.unwrap();
        assert_eq!(second, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unscripted_uses_responder_or_fails() {
        let mock = MockTransport::new();
        assert!(mock.exchange(Protocol::Tcp, upstream(), &[9]).await.is_err());

        mock.respond_with(|_, query| MockReply::Response(query.to_vec()));
        let echoed = mock.exchange(Protocol::Tcp, upstream(), &[9]).await.unwrap();
        assert_eq!(echoed, vec![9]);

        assert_eq!(mock.protocols(), vec![Protocol::Tcp, Protocol::Tcp]);
        assert_eq!(mock.calls()[1].query, vec![9]);
    }
}
