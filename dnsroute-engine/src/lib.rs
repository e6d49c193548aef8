//! dnsroute engine
//!
//! Split-horizon DNS routing: each query is classified by substring
//! patterns, forwarded to its class's upstream, and the IPv4 addresses in
//! the reply are fed back into that class's address set so the firewall
//! routes the following connections the same way.
//!
//! # Architecture
//!
//! ```text
//!  client ──► DnsServer (dnsroute-dns) ──► QueryHandler
//!                                            │  classify (PatternStore)
//!                                            │  forward  (Forwarder, UDP then TCP)
//!                                            ▼
//!                                      AnswerProcessor
//!                              ┌─────────────┼──────────────┐
//!                              ▼             ▼              ▼
//!                         AddressMap    AddressSet      AuditSink
//!                              │        (dnsroute-ipset)  (SQLite)
//!                              └──── PersistScheduler ◄─────┘ signals
//!                                    (JSON map + ipset save)
//! ```

pub mod addr_map;
pub mod admin;
pub mod answer;
pub mod audit;
pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod patterns;
pub mod persist;

pub use addr_map::{AddressMap, Snapshot};
pub use admin::{Admin, ClassPatterns, DomainInfo, PatternChange, PatternInfo};
pub use audit::{AuditRow, AuditSink, AuditStore, NoAudit, SqliteAudit};
pub use config::{ClassConfig, Config};
pub use engine::Engine;
pub use error::{Error, Result};
pub use handler::QueryHandler;
pub use patterns::{PatternStore, Route};
pub use persist::{PersistHandle, PersistScheduler, SaveKind};
