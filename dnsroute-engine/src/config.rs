//! Configuration types for the routing engine

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};
use dnsroute_dns::{parse_upstream, Timeouts};
use dnsroute_ipset::{validate_set_name, IpsetCommand};

/// Environment variable consulted when no default upstream is configured
pub const UPSTREAM_ENV: &str = "DNSROUTE_UPSTREAM";

/// System resolver configuration consulted last
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Reserved name of the default routing class
pub const DIRECT_CLASS: &str = "direct";

/// Main configuration structure
///
/// Routing classes are listed as `[[class]]` tables. Their order in the
/// file is the classification priority: when a domain matches patterns of
/// several classes, the first listed class wins.
///
/// # Example Configuration
///
/// ```toml
/// log_level = "info"
///
/// [server]
/// listen = "10.200.0.1:53"
/// upstream = "192.168.0.200:53"
///
/// [[class]]
/// name = "nl"
/// patterns = "/root/site_nl"
/// upstream = "10.10.1.2:53"
/// ipset = "proxied_nl"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Listener and default upstream
    #[serde(default)]
    pub server: ServerConfig,

    /// Upstream exchange deadlines
    #[serde(default)]
    pub forwarder: ForwarderConfig,

    /// Pattern file reloading
    #[serde(default)]
    pub patterns: PatternsConfig,

    /// Snapshot files and batching
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Address-set tool
    #[serde(default)]
    pub ipset: IpsetConfig,

    /// Query audit log
    #[serde(default)]
    pub audit: AuditConfig,

    /// Proxied routing classes in priority order
    #[serde(default, rename = "class")]
    pub classes: Vec<ClassConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            forwarder: ForwarderConfig::default(),
            patterns: PatternsConfig::default(),
            persistence: PersistenceConfig::default(),
            ipset: IpsetConfig::default(),
            audit: AuditConfig::default(),
            classes: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.forwarder.validate()?;
        self.persistence.validate()?;

        if self.patterns.reload_interval == 0 {
            return Err(Error::Config("patterns.reload_interval must be > 0".into()));
        }
        if self.ipset.timeout == 0 {
            return Err(Error::Config("ipset.timeout must be > 0".into()));
        }
        if self.ipset.maxelem == Some(0) {
            return Err(Error::Config("ipset.maxelem must be > 0".into()));
        }

        let mut names = HashSet::new();
        for class in &self.classes {
            class.validate()?;
            if !names.insert(class.name.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate routing class '{}'",
                    class.name
                )));
            }
        }

        Ok(())
    }

    /// Look up a proxied class by name
    pub fn class(&self, name: &str) -> Result<&ClassConfig> {
        self.classes
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::UnknownClass(name.to_string()))
    }

    /// Resolve the upstream for the default class
    ///
    /// Order: `server.upstream`, then `DNSROUTE_UPSTREAM`, then the first
    /// nameserver in `/etc/resolv.conf`.
    pub fn default_upstream(&self) -> Result<SocketAddr> {
        let env = std::env::var(UPSTREAM_ENV).ok();
        let resolv_conf = std::fs::read_to_string(RESOLV_CONF).ok();
        resolve_default_upstream(
            self.server.upstream.as_deref(),
            env.as_deref(),
            resolv_conf.as_deref(),
        )
    }

    /// Generate a sample configuration
    pub fn sample() -> String {
        r#"# dnsroute configuration

# Log level: "error", "warn", "info", "debug", "trace"
# RUST_LOG overrides this when set.
log_level = "info"

[server]
# Address for the DNS listener (UDP and TCP)
listen = "10.200.0.1:53"

# Upstream for domains that match no class.
# When omitted, DNSROUTE_UPSTREAM is used, then the first nameserver
# in /etc/resolv.conf.
upstream = "192.168.0.200:53"

# Seconds before an idle client TCP connection is closed
tcp_idle_timeout = 30

[forwarder]
# Per-exchange deadlines in seconds. A failed or truncated UDP exchange
# is retried once over TCP.
dial_timeout = 5
read_timeout = 5
write_timeout = 5

[patterns]
# Seconds between pattern file reloads
reload_interval = 5

[persistence]
# Domain -> addresses snapshot (JSON)
map_file = "/root/map.json"

# Output of `ipset save`
ipset_save_file = "/etc/ipset.conf"

# Dirty snapshots are flushed on this tick (seconds)...
save_interval = 10

# ...or after this much quiet time following a change (seconds)
batch_timeout = 2

# Change signals beyond this many pending ones are dropped
signal_capacity = 100

[ipset]
command = "ipset"

# Seconds per invocation
timeout = 3

# Run `ipset create <set> hash:ip family inet -exist` at startup
create_sets = true

# Capacity of created sets (ipset's default is 65536)
# maxelem = 262144

[audit]
# SQLite database receiving one row per observed (domain, address).
# Comment out to disable.
database = "/root/dns_log.db"

# Routing classes. Order is priority: a domain matching several classes
# goes to the first one listed. Pattern files hold one substring per line;
# blank lines and lines starting with '#' are ignored.

[[class]]
name = "nl"
patterns = "/root/site_nl"
upstream = "10.10.1.2:53"
ipset = "proxied_nl"

[[class]]
name = "usa"
patterns = "/root/site_usa"
upstream = "10.24.0.2:53"
ipset = "proxied_usa"
"#
        .to_string()
    }
}

/// Pick the default upstream from the configured value, the environment
/// and resolv.conf contents, in that order
pub fn resolve_default_upstream(
    configured: Option<&str>,
    env: Option<&str>,
    resolv_conf: Option<&str>,
) -> Result<SocketAddr> {
    if let Some(upstream) = configured.filter(|s| !s.trim().is_empty()) {
        return Ok(parse_upstream(upstream)?);
    }
    if let Some(upstream) = env.filter(|s| !s.trim().is_empty()) {
        return Ok(parse_upstream(upstream)?);
    }
    if let Some(nameserver) = resolv_conf.and_then(first_nameserver) {
        return Ok(parse_upstream(nameserver)?);
    }
    Err(Error::Config(format!(
        "no default upstream: set server.upstream, {} or a nameserver in {}",
        UPSTREAM_ENV, RESOLV_CONF
    )))
}

/// First `nameserver` entry of a resolv.conf
fn first_nameserver(content: &str) -> Option<&str> {
    content.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        match (fields.next(), fields.next()) {
            (Some("nameserver"), Some(addr)) => Some(addr),
            _ => None,
        }
    })
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address, `IP[:port]`
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Default (direct) upstream, `IP[:port]`
    #[serde(default)]
    pub upstream: Option<String>,

    /// Idle client TCP connection timeout in seconds
    #[serde(default = "default_tcp_idle_timeout")]
    pub tcp_idle_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            upstream: None,
            tcp_idle_timeout: default_tcp_idle_timeout(),
        }
    }
}

impl ServerConfig {
    /// Validate listener settings
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        if let Some(ref upstream) = self.upstream {
            parse_upstream(upstream)?;
        }
        if self.tcp_idle_timeout == 0 {
            return Err(Error::Config("server.tcp_idle_timeout must be > 0".into()));
        }
        Ok(())
    }

    /// Parsed listen address (port defaults to 53)
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_upstream(&self.listen)
            .map_err(|e| Error::Config(format!("invalid listen address: {}", e)))
    }

    pub fn tcp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_idle_timeout)
    }
}

/// Upstream exchange deadlines in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwarderConfig {
    #[serde(default = "default_exchange_timeout")]
    pub dial_timeout: u64,

    #[serde(default = "default_exchange_timeout")]
    pub read_timeout: u64,

    #[serde(default = "default_exchange_timeout")]
    pub write_timeout: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            dial_timeout: default_exchange_timeout(),
            read_timeout: default_exchange_timeout(),
            write_timeout: default_exchange_timeout(),
        }
    }
}

impl ForwarderConfig {
    fn validate(&self) -> Result<()> {
        if self.dial_timeout == 0 || self.read_timeout == 0 || self.write_timeout == 0 {
            return Err(Error::Config("forwarder timeouts must be > 0".into()));
        }
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            dial: Duration::from_secs(self.dial_timeout),
            read: Duration::from_secs(self.read_timeout),
            write: Duration::from_secs(self.write_timeout),
        }
    }
}

/// Pattern reload settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternsConfig {
    /// Seconds between reloads
    #[serde(default = "default_reload_interval")]
    pub reload_interval: u64,
}

impl Default for PatternsConfig {
    fn default() -> Self {
        Self {
            reload_interval: default_reload_interval(),
        }
    }
}

impl PatternsConfig {
    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.reload_interval)
    }
}

/// Snapshot persistence settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Domain -> addresses JSON snapshot
    #[serde(default = "default_map_file")]
    pub map_file: PathBuf,

    /// Destination of the address-set tool's save output
    #[serde(default = "default_ipset_save_file")]
    pub ipset_save_file: PathBuf,

    /// Periodic flush interval in seconds
    #[serde(default = "default_save_interval")]
    pub save_interval: u64,

    /// Quiet time after a signal before a batched flush, in seconds
    #[serde(default = "default_batch_timeout")]
    pub batch_timeout: u64,

    /// Bounded signal channel capacity
    #[serde(default = "default_signal_capacity")]
    pub signal_capacity: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            map_file: default_map_file(),
            ipset_save_file: default_ipset_save_file(),
            save_interval: default_save_interval(),
            batch_timeout: default_batch_timeout(),
            signal_capacity: default_signal_capacity(),
        }
    }
}

impl PersistenceConfig {
    fn validate(&self) -> Result<()> {
        if self.save_interval == 0 || self.batch_timeout == 0 {
            return Err(Error::Config(
                "persistence intervals must be > 0".into(),
            ));
        }
        if self.signal_capacity == 0 {
            return Err(Error::Config(
                "persistence.signal_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn save_interval(&self) -> Duration {
        Duration::from_secs(self.save_interval)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_timeout)
    }
}

/// Address-set tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpsetConfig {
    /// Program invoked for set operations
    #[serde(default = "default_ipset_command")]
    pub command: String,

    /// Per-invocation timeout in seconds
    #[serde(default = "default_ipset_timeout")]
    pub timeout: u64,

    /// Create every class's set at startup
    #[serde(default = "default_true")]
    pub create_sets: bool,

    /// Capacity of created sets; the tool's default when unset
    #[serde(default)]
    pub maxelem: Option<u32>,
}

impl Default for IpsetConfig {
    fn default() -> Self {
        Self {
            command: default_ipset_command(),
            timeout: default_ipset_timeout(),
            create_sets: true,
            maxelem: None,
        }
    }
}

impl IpsetConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Address-set gateway invoking the configured tool
    pub fn command(&self) -> IpsetCommand {
        IpsetCommand::new(self.command.clone())
            .with_timeout(self.timeout())
            .with_maxelem(self.maxelem)
    }
}

/// Audit log settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// SQLite database path; auditing is off when unset
    #[serde(default)]
    pub database: Option<PathBuf>,
}

/// A proxied routing class
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassConfig {
    /// Class name, used by administrative commands
    pub name: String,

    /// Newline-delimited pattern file
    pub patterns: PathBuf,

    /// Upstream resolver for matching domains, `IP[:port]`
    pub upstream: String,

    /// Address set receiving observed addresses
    pub ipset: String,
}

impl ClassConfig {
    fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(Error::Config("class name is required".into()));
        }
        if name.eq_ignore_ascii_case(DIRECT_CLASS) {
            return Err(Error::Config(format!(
                "class name '{}' is reserved for unmatched domains",
                DIRECT_CLASS
            )));
        }
        if self.patterns.as_os_str().is_empty() {
            return Err(Error::Config(format!(
                "class '{}' needs a pattern file",
                self.name
            )));
        }
        parse_upstream(&self.upstream).map_err(|e| {
            Error::Config(format!("class '{}' upstream: {}", self.name, e))
        })?;
        validate_set_name(&self.ipset)
            .map_err(|e| Error::Config(format!("class '{}': {}", self.name, e)))?;
        Ok(())
    }

    /// Parsed upstream address
    pub fn upstream_addr(&self) -> Result<SocketAddr> {
        Ok(parse_upstream(&self.upstream)?)
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:53".to_string()
}

fn default_tcp_idle_timeout() -> u64 {
    30
}

fn default_exchange_timeout() -> u64 {
    5
}

fn default_reload_interval() -> u64 {
    5
}

fn default_map_file() -> PathBuf {
    PathBuf::from("/root/map.json")
}

fn default_ipset_save_file() -> PathBuf {
    PathBuf::from("/etc/ipset.conf")
}

fn default_save_interval() -> u64 {
    10
}

fn default_batch_timeout() -> u64 {
    2
}

fn default_signal_capacity() -> usize {
    100
}

fn default_ipset_command() -> String {
    "ipset".to_string()
}

fn default_ipset_timeout() -> u64 {
    3
}

fn default_true() -> bool {
    true
}
