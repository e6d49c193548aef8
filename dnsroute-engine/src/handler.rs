//! Query handler
//!
//! Per query: classify the first question's name, forward to the class's
//! upstream, apply the answer records, strip IPv6 and reply. A forwarding
//! failure becomes SERVFAIL and leaves all shared state untouched.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::answer::AnswerProcessor;
use crate::patterns::{PatternStore, Route};
use dnsroute_dns::{normalize, servfail, strip_ipv6, Forwarder, Request, RequestHandler};

/// Routes and answers DNS queries
pub struct QueryHandler {
    patterns: Arc<PatternStore>,
    forwarder: Forwarder,
    default_upstream: SocketAddr,
    class_upstreams: Vec<SocketAddr>,
    answers: AnswerProcessor,
}

impl QueryHandler {
    /// `class_upstreams[i]` is the upstream of class `i`
    pub fn new(
        patterns: Arc<PatternStore>,
        forwarder: Forwarder,
        default_upstream: SocketAddr,
        class_upstreams: Vec<SocketAddr>,
        answers: AnswerProcessor,
    ) -> Self {
        Self {
            patterns,
            forwarder,
            default_upstream,
            class_upstreams,
            answers,
        }
    }

    /// Upstream serving a route
    pub fn upstream_for(&self, route: Route) -> SocketAddr {
        route
            .class_index()
            .and_then(|index| self.class_upstreams.get(index).copied())
            .unwrap_or(self.default_upstream)
    }

    /// Produce the wire reply for `request`
    pub async fn resolve(&self, request: &Request) -> Option<Vec<u8>> {
        let (qname, qtype) = match request.message.queries().first() {
            Some(q) => (normalize(q.name()), q.query_type().to_string()),
            None => {
                log::debug!("Query from {} has no question", request.src);
                (String::new(), String::new())
            }
        };

        let route = self.patterns.classify(&qname);
        let upstream = self.upstream_for(route);
        log::debug!(
            "{} query for {} from {} via {} ({})",
            qtype,
            qname,
            request.src,
            self.patterns.class_name(route),
            upstream
        );

        let exchange = match self.forwarder.exchange(&request.raw, upstream).await {
            Ok(exchange) => exchange,
            Err(e) => {
                log::warn!("Failed to resolve {} {} via {}: {}", qtype, qname, upstream, e);
                return encode(servfail(&request.message));
            }
        };

        let summary = self.answers.process(&qname, route, &exchange.response).await;
        log::debug!(
            "Answered {} {} via {} in {:?}: {} address(es), {} new",
            qtype,
            qname,
            exchange.protocol,
            exchange.elapsed,
            summary.answer_addrs.len(),
            summary.map_inserts
        );

        match strip_ipv6(&exchange.response) {
            Some(stripped) => match stripped.to_vec() {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    log::warn!("Failed to encode filtered response for {}: {}", qname, e);
                    encode(servfail(&request.message))
                }
            },
            None => Some(exchange.raw),
        }
    }
}

fn encode(message: hickory_proto::op::Message) -> Option<Vec<u8>> {
    match message.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::warn!("Failed to encode SERVFAIL: {}", e);
            None
        }
    }
}

#[async_trait]
impl RequestHandler for QueryHandler {
    async fn handle(&self, request: &Request) -> Option<Vec<u8>> {
        self.resolve(request).await
    }
}
