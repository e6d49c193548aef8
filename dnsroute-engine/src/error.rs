//! Error types for the routing engine

use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the routing engine
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to parse configuration file
    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Address map (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// DNS plumbing error
    #[error("DNS error: {0}")]
    Dns(#[from] dnsroute_dns::Error),

    /// Address-set gateway error
    #[error("ipset error: {0}")]
    IpSet(#[from] dnsroute_ipset::IpSetError),

    /// Audit database error
    #[error("audit log error: {0}")]
    Audit(#[from] rusqlite::Error),

    /// Invalid pattern
    #[error("invalid pattern: {0}")]
    Pattern(String),

    /// No routing class with this name
    #[error("unknown routing class: {0}")]
    UnknownClass(String),

    /// Already running
    #[error("engine is already running")]
    AlreadyRunning,
}

impl Error {
    /// Check if this is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config(_) | Error::ConfigParse(_))
    }
}
