//! Routing engine
//!
//! Wires the pattern store, address map, address-set gateway, persistence
//! scheduler, audit log and query handler together behind a DNS listener.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;

use crate::addr_map::AddressMap;
use crate::answer::AnswerProcessor;
use crate::audit::{AuditSink, NoAudit, SqliteAudit, DEFAULT_AUDIT_QUEUE};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::handler::QueryHandler;
use crate::patterns::{spawn_reload_task, PatternStore};
use crate::persist::{PersistScheduler, Snapshots};
use dnsroute_dns::{DnsServer, DnsTransport, Forwarder, NetworkTransport};
use dnsroute_ipset::AddressSet;

/// Upper bound on waiting for queued audit rows at shutdown
const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Split-horizon DNS proxy
pub struct Engine {
    config: Config,
    default_upstream: SocketAddr,
    sets: Arc<dyn AddressSet>,
    transport: Arc<dyn DnsTransport>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    ready_tx: Option<oneshot::Sender<SocketAddr>>,
    running: AtomicBool,
}

impl Engine {
    /// Create an engine using the `ipset` tool and real sockets
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let default_upstream = config.default_upstream()?;

        let sets = config.ipset.command();
        let transport = NetworkTransport::new(config.forwarder.timeouts());

        Ok(Self {
            config,
            default_upstream,
            sets: Arc::new(sets),
            transport: Arc::new(transport),
            shutdown_tx: None,
            ready_tx: None,
            running: AtomicBool::new(false),
        })
    }

    /// Replace the address-set gateway
    pub fn with_address_set(mut self, sets: Arc<dyn AddressSet>) -> Self {
        self.sets = sets;
        self
    }

    /// Replace the upstream transport
    pub fn with_transport(mut self, transport: Arc<dyn DnsTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Upstream for unmatched domains
    pub fn default_upstream(&self) -> SocketAddr {
        self.default_upstream
    }

    /// Create a shutdown handle before running the engine
    ///
    /// Sending on the handle stops the listener and the reload task. The
    /// scheduler keeps running until queries already in flight finish, and
    /// [`Engine::run`] returns after its final flush.
    pub fn create_shutdown_handle(&mut self) -> broadcast::Sender<()> {
        let (shutdown_tx, _) = broadcast::channel(1);
        self.shutdown_tx = Some(shutdown_tx.clone());
        shutdown_tx
    }

    /// Receive the listener's address once it is bound
    pub fn listen_notifier(&mut self) -> oneshot::Receiver<SocketAddr> {
        let (tx, rx) = oneshot::channel();
        self.ready_tx = Some(tx);
        rx
    }

    /// Serve queries until shutdown
    pub async fn run(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }
        let result = self.serve().await;
        self.running.store(false, Ordering::SeqCst);
        result
    }

    async fn serve(&mut self) -> Result<()> {
        let shutdown_tx = match self.shutdown_tx.clone() {
            Some(tx) => tx,
            None => self.create_shutdown_handle(),
        };
        let config = &self.config;

        let class_upstreams = config
            .classes
            .iter()
            .map(|c| c.upstream_addr())
            .collect::<Result<Vec<_>>>()?;
        let set_names: Vec<String> = config.classes.iter().map(|c| c.ipset.clone()).collect();

        let map = Arc::new(AddressMap::load(&config.persistence.map_file));

        let patterns = Arc::new(PatternStore::new(&config.classes));
        patterns.reload().await;

        if config.ipset.create_sets {
            for name in &set_names {
                match self.sets.create(name).await {
                    Ok(()) => log::debug!("Address set {} ready", name),
                    Err(e) => log::warn!("Failed to create address set {}: {}", name, e),
                }
            }
        }

        let (audit, audit_writer) = open_audit(config);

        let reload_task = spawn_reload_task(
            patterns.clone(),
            config.patterns.reload_interval(),
            shutdown_tx.subscribe(),
        );

        let snapshots = Arc::new(Snapshots::new(
            map.clone(),
            self.sets.clone(),
            &config.persistence,
        ));
        let (scheduler, persist) = PersistScheduler::new(snapshots, &config.persistence);
        let scheduler_task = scheduler.spawn();

        let answers = AnswerProcessor::new(
            patterns.clone(),
            map.clone(),
            self.sets.clone(),
            set_names,
            persist,
            audit,
        );
        let handler = Arc::new(QueryHandler::new(
            patterns,
            Forwarder::new(self.transport.clone()),
            self.default_upstream,
            class_upstreams,
            answers,
        ));

        let served = match bind(config, handler).await {
            Ok(server) => {
                log::info!(
                    "Routing {} class(es), default upstream {}",
                    config.classes.len(),
                    self.default_upstream
                );
                if let (Some(ready), Ok(addr)) = (self.ready_tx.take(), server.local_addr()) {
                    let _ = ready.send(addr);
                }
                server.run(shutdown_tx.subscribe()).await.map_err(Error::from)
            }
            Err(e) => Err(e),
        };

        // Stop the reload task if the listener ended on its own
        let _ = shutdown_tx.send(());
        if let Err(e) = reload_task.await {
            log::warn!("Pattern reload task failed: {}", e);
        }
        // Ends once the last in-flight query drops its handler
        if let Err(e) = scheduler_task.await {
            log::warn!("Persistence task failed: {}", e);
        }
        if let Some(writer) = audit_writer {
            if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, writer).await.is_err() {
                log::warn!("Audit writer still busy at shutdown");
            }
        }

        log::info!("Engine stopped with {} domain(s) recorded", map.len());
        served
    }
}

async fn bind(config: &Config, handler: Arc<QueryHandler>) -> Result<DnsServer> {
    let listen = config.server.listen_addr()?;
    let server = DnsServer::bind(listen, handler)
        .await?
        .with_tcp_idle_timeout(config.server.tcp_idle_timeout());
    Ok(server)
}

fn open_audit(config: &Config) -> (Arc<dyn AuditSink>, Option<JoinHandle<()>>) {
    let Some(path) = config.audit.database.as_ref() else {
        return (Arc::new(NoAudit), None);
    };
    match SqliteAudit::open(path, DEFAULT_AUDIT_QUEUE) {
        Ok((audit, writer)) => {
            log::info!("Audit log at {}", path.display());
            (Arc::new(audit), Some(writer))
        }
        Err(e) => {
            log::warn!("Audit log disabled, cannot open {}: {}", path.display(), e);
            (Arc::new(NoAudit), None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnsroute_ipset::mock::MemoryAddressSet;

    fn config(toml: &str) -> Config {
        Config::from_toml(toml).unwrap()
    }

    #[test]
    fn test_new_resolves_default_upstream() {
        let engine = Engine::new(config(
            r#"
            [server]
            listen = "127.0.0.1:0"
            upstream = "192.168.0.200"
            "#,
        ))
        .unwrap();

        assert_eq!(engine.default_upstream(), "192.168.0.200:53".parse().unwrap());
    }

    #[tokio::test]
    async fn test_already_running() {
        let mut engine = Engine::new(config(
            r#"
            [server]
            listen = "127.0.0.1:0"
            upstream = "127.0.0.1:1"
            "#,
        ))
        .unwrap();
        engine.running.store(true, Ordering::SeqCst);

        assert!(matches!(engine.run().await, Err(Error::AlreadyRunning)));
    }

    #[tokio::test]
    async fn test_bind_failure_stops_background_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let toml = format!(
            r#"
            [server]
            listen = "{}"
            upstream = "127.0.0.1:1"

            [persistence]
            map_file = "{}"
            ipset_save_file = "{}"

            [ipset]
            create_sets = false
            "#,
            taken.local_addr().unwrap(),
            dir.path().join("map.json").display(),
            dir.path().join("ipset.conf").display(),
        );
        let mut engine = Engine::new(config(&toml))
            .unwrap()
            .with_address_set(Arc::new(MemoryAddressSet::new()));

        let result = tokio::time::timeout(Duration::from_secs(5), engine.run()).await;

        assert!(matches!(result, Ok(Err(Error::Dns(_)))));
    }
}
