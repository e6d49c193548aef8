//! Persistence scheduler
//!
//! Query tasks never write snapshots themselves. They raise a [`SaveKind`]
//! signal through a [`PersistHandle`]; a single background task owns one
//! dirty flag per kind and flushes dirty snapshots either after a quiet
//! period following the last signal or on a periodic tick, whichever comes
//! first. The tick bounds the delay under continuous signal traffic.
//!
//! The signal channel is bounded and signals are dropped when it is full.
//! A dropped signal only delays a save: the flag it would have set is
//! already pending or will be set by a later signal.
//!
//! The scheduler has no shutdown signal of its own. It stops once every
//! [`PersistHandle`] is gone, so queries still in flight when the listener
//! stops get their signals into the final flush.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::addr_map::{write_atomic, AddressMap};
use crate::config::PersistenceConfig;
use crate::error::Result;
use dnsroute_ipset::AddressSet;

/// Which snapshot needs saving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaveKind {
    /// The address-set tool's own state
    AddressSet,
    /// The domain -> addresses map
    AddressMap,
}

/// Writes one kind of snapshot
#[async_trait]
pub trait SnapshotTarget: Send + Sync {
    async fn flush(&self, kind: SaveKind) -> Result<()>;
}

/// Snapshot files on disk
pub struct Snapshots {
    map: Arc<AddressMap>,
    sets: Arc<dyn AddressSet>,
    map_file: PathBuf,
    ipset_save_file: PathBuf,
}

impl Snapshots {
    pub fn new(
        map: Arc<AddressMap>,
        sets: Arc<dyn AddressSet>,
        config: &PersistenceConfig,
    ) -> Self {
        Self {
            map,
            sets,
            map_file: config.map_file.clone(),
            ipset_save_file: config.ipset_save_file.clone(),
        }
    }
}

#[async_trait]
impl SnapshotTarget for Snapshots {
    async fn flush(&self, kind: SaveKind) -> Result<()> {
        match kind {
            SaveKind::AddressMap => {
                self.map.save(&self.map_file).await?;
                log::debug!(
                    "Saved address map ({} domains) to {}",
                    self.map.len(),
                    self.map_file.display()
                );
            }
            SaveKind::AddressSet => {
                let dump = self.sets.save().await?;
                write_atomic(&self.ipset_save_file, dump.as_bytes()).await?;
                log::debug!("Saved address sets to {}", self.ipset_save_file.display());
            }
        }
        Ok(())
    }
}

/// Non-blocking sender of save signals
#[derive(Debug, Clone)]
pub struct PersistHandle {
    tx: mpsc::Sender<SaveKind>,
}

impl PersistHandle {
    /// Create a handle and the receiving end, for wiring or tests
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SaveKind>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Mark `kind` dirty; returns `false` if the signal was dropped
    pub fn signal(&self, kind: SaveKind) -> bool {
        match self.tx.try_send(kind) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("Persistence signal queue full, dropping {:?}", kind);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::debug!("Persistence scheduler gone, dropping {:?}", kind);
                false
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Dirty {
    address_set: bool,
    address_map: bool,
}

impl Dirty {
    fn mark(&mut self, kind: SaveKind) {
        match kind {
            SaveKind::AddressSet => self.address_set = true,
            SaveKind::AddressMap => self.address_map = true,
        }
    }

    fn any(&self) -> bool {
        self.address_set || self.address_map
    }
}

/// Background batching loop
pub struct PersistScheduler {
    target: Arc<dyn SnapshotTarget>,
    rx: mpsc::Receiver<SaveKind>,
    save_interval: Duration,
    batch_timeout: Duration,
    dirty: Dirty,
}

impl PersistScheduler {
    /// Create a scheduler configured from `config`
    pub fn new(target: Arc<dyn SnapshotTarget>, config: &PersistenceConfig) -> (Self, PersistHandle) {
        Self::with_timing(
            target,
            config.signal_capacity,
            config.save_interval(),
            config.batch_timeout(),
        )
    }

    /// Create a scheduler with explicit timing
    pub fn with_timing(
        target: Arc<dyn SnapshotTarget>,
        capacity: usize,
        save_interval: Duration,
        batch_timeout: Duration,
    ) -> (Self, PersistHandle) {
        let (handle, rx) = PersistHandle::channel(capacity);
        let scheduler = Self {
            target,
            rx,
            save_interval,
            batch_timeout,
            dirty: Dirty::default(),
        };
        (scheduler, handle)
    }

    /// Run the loop on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until every handle is dropped, then flush whatever is still dirty
    pub async fn run(mut self) {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.save_interval, self.save_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let batch = tokio::time::sleep(self.batch_timeout);
        tokio::pin!(batch);
        let mut batch_armed = false;

        loop {
            tokio::select! {
                signal = self.rx.recv() => match signal {
                    Some(kind) => {
                        self.dirty.mark(kind);
                        batch.as_mut().reset(Instant::now() + self.batch_timeout);
                        batch_armed = true;
                    }
                    None => break,
                },

                _ = &mut batch, if batch_armed => {
                    batch_armed = false;
                    self.flush().await;
                }

                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }

        if self.dirty.any() {
            log::info!("Flushing pending snapshots before exit");
            self.flush().await;
        }
        log::debug!("Persistence scheduler stopped");
    }

    async fn flush(&mut self) {
        if self.dirty.address_set {
            self.dirty.address_set = !self.flush_one(SaveKind::AddressSet).await;
        }
        if self.dirty.address_map {
            self.dirty.address_map = !self.flush_one(SaveKind::AddressMap).await;
        }
    }

    async fn flush_one(&self, kind: SaveKind) -> bool {
        match self.target.flush(kind).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to save {:?} snapshot, will retry: {}", kind, e);
                false
            }
        }
    }
}
