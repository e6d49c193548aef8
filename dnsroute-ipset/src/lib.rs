//! Address-set gateway for dnsroute.
//!
//! This crate adds, removes and tests addresses in named Linux ipset sets
//! by invoking the external `ipset` tool, one command per call. The
//! [`AddressSet`] trait is the seam the engine depends on; [`mock`] provides
//! an in-memory implementation for tests.
//!
//! Calls are never retried here. `add` is idempotent, and "not a member"
//! from `remove`/`test` is an ordinary `Ok(false)`, distinct from a tool
//! failure.

pub mod ipset;
pub mod mock;

pub use ipset::{IpsetCommand, DEFAULT_COMMAND_TIMEOUT};

use std::net::IpAddr;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Maximum set name length accepted by the kernel, including the NUL
pub const IPSET_MAXNAMELEN: usize = 32;

/// Error type for address-set operations.
#[derive(Error, Debug)]
pub enum IpSetError {
    #[error("Invalid set name: {0}")]
    InvalidSetName(String),

    #[error("Invalid address family for {0}")]
    InvalidAddressFamily(IpAddr),

    #[error("Set not found: {0}")]
    SetNotFound(String),

    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Failed to run address-set tool: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Address-set tool did not finish within {0:?}")]
    Timeout(Duration),
}

pub type Result<T> = std::result::Result<T, IpSetError>;

/// Check a set name against the kernel's limits
pub fn validate_set_name(setname: &str) -> Result<()> {
    if setname.is_empty() || setname.len() >= IPSET_MAXNAMELEN {
        return Err(IpSetError::InvalidSetName(setname.to_string()));
    }
    if setname.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(IpSetError::InvalidSetName(setname.to_string()));
    }
    Ok(())
}

/// Named address sets managed outside the process
#[async_trait]
pub trait AddressSet: Send + Sync {
    /// Create `setname` if it does not exist yet
    async fn create(&self, setname: &str) -> Result<()>;

    /// Add `addr` to `setname`; already being a member is not an error
    async fn add(&self, setname: &str, addr: IpAddr) -> Result<()>;

    /// Remove `addr` from `setname`, returning `false` if it was not a member
    async fn remove(&self, setname: &str, addr: IpAddr) -> Result<bool>;

    /// Check whether `addr` is a member of `setname`
    async fn test(&self, setname: &str, addr: IpAddr) -> Result<bool>;

    /// Dump every set in the tool's own restorable text format
    async fn save(&self) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_set_name() {
        assert!(validate_set_name("proxied_nl").is_ok());
        assert!(validate_set_name(&"a".repeat(IPSET_MAXNAMELEN - 1)).is_ok());

        assert!(matches!(
            validate_set_name(""),
            Err(IpSetError::InvalidSetName(_))
        ));
        assert!(validate_set_name(&"a".repeat(IPSET_MAXNAMELEN)).is_err());
        assert!(validate_set_name("two words").is_err());
    }

    #[test]
    fn test_error_display() {
        let err = IpSetError::CommandFailed {
            command: "ipset add s 1.2.3.4 -exist".into(),
            status: "exit status: 1".into(),
            stderr: "boom".into(),
        };
        assert_eq!(
            err.to_string(),
            "`ipset add s 1.2.3.4 -exist` failed (exit status: 1): boom"
        );
    }
}
