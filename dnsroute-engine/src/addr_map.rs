//! Domain to address map
//!
//! Records every address ever observed for a domain. Entries are only ever
//! added; the JSON snapshot on disk is rewritten whole on each save.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::error::Result;
use dnsroute_dns::normalize_name;

/// Point-in-time copy of the map, sorted for stable output
pub type Snapshot = BTreeMap<String, Vec<String>>;

/// Concurrent domain -> addresses map
#[derive(Debug, Default)]
pub struct AddressMap {
    inner: RwLock<HashMap<String, Vec<String>>>,
}

impl AddressMap {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from a snapshot, normalizing names and dropping repeats
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let map = Self::new();
        for (domain, addrs) in snapshot {
            for addr in addrs {
                map.insert(&domain, &addr);
            }
        }
        map
    }

    /// Load the map from a JSON snapshot file
    ///
    /// A missing, unreadable or corrupt file yields an empty map; the data
    /// is rebuilt from live traffic.
    pub fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match read_snapshot(path) {
            Ok(snapshot) => {
                let map = Self::from_snapshot(snapshot);
                log::info!(
                    "Loaded address map with {} domain(s) from {}",
                    map.len(),
                    path.display()
                );
                map
            }
            Err(e) => {
                log::warn!(
                    "Starting with an empty address map, cannot load {}: {}",
                    path.display(),
                    e
                );
                Self::new()
            }
        }
    }

    /// Record `addr` for `domain`; returns whether it was new
    pub fn insert(&self, domain: &str, addr: &str) -> bool {
        let domain = normalize_name(domain);
        let addr = addr.trim();
        if domain.is_empty() || addr.is_empty() {
            return false;
        }

        // Most answers repeat known pairs; only take the write lock for news
        if self
            .read()
            .get(&domain)
            .is_some_and(|addrs| addrs.iter().any(|a| a == addr))
        {
            return false;
        }

        let mut inner = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let addrs = inner.entry(domain).or_default();
        if addrs.iter().any(|a| a == addr) {
            return false;
        }
        addrs.push(addr.to_string());
        true
    }

    /// Addresses recorded for `domain`
    pub fn get(&self, domain: &str) -> Vec<String> {
        let domain = normalize_name(domain);
        self.read()
            .get(&domain)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of domains
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Consistent copy of the whole map
    pub fn snapshot(&self) -> Snapshot {
        self.read()
            .iter()
            .map(|(domain, addrs)| (domain.clone(), addrs.clone()))
            .collect()
    }

    /// Pretty-printed JSON of the current contents
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Overwrite `path` with the current contents
    ///
    /// Written to a sibling temporary file first and renamed into place, so
    /// readers never see a half-written snapshot.
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = self.to_json()?;
        write_atomic(path.as_ref(), json.as_bytes()).await
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Vec<String>>> {
        match self.inner.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Replace `path` with `contents` via a sibling temporary file
///
/// The temporary name is unique per process and call, so the proxy and an
/// admin command saving the same file never rename each other's data.
pub(crate) async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(
        ".{}.{}.tmp",
        std::process::id(),
        TMP_SEQ.fetch_add(1, Ordering::Relaxed)
    ));

    let written = match tokio::fs::write(&tmp, contents).await {
        Ok(()) => tokio::fs::rename(&tmp, path).await,
        Err(e) => Err(e),
    };
    if written.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    Ok(written?)
}

/// Read a JSON snapshot file
pub fn read_snapshot<P: AsRef<Path>>(path: P) -> Result<Snapshot> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Entries of `snapshot` whose domain contains `pattern`
pub fn domains_matching<'a>(
    snapshot: &'a Snapshot,
    pattern: &str,
) -> impl Iterator<Item = (&'a String, &'a Vec<String>)> {
    let pattern = pattern.trim().to_lowercase();
    snapshot
        .iter()
        .filter(move |(domain, _)| !pattern.is_empty() && domain.contains(pattern.as_str()))
}

/// Distinct addresses of every domain containing `pattern`
pub fn addresses_matching(snapshot: &Snapshot, pattern: &str) -> BTreeSet<String> {
    domains_matching(snapshot, pattern)
        .flat_map(|(_, addrs)| addrs.iter().cloned())
        .collect()
}
