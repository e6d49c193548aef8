//! In-memory address sets for testing
//!
//! [`MemoryAddressSet`] behaves like the real tool (idempotent add, `false`
//! for non-members) and records every call. Failures can be injected per
//! address or globally.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{validate_set_name, AddressSet, IpSetError, Result};

/// A recorded gateway call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetCall {
    Create(String),
    Add(String, IpAddr),
    Remove(String, IpAddr),
    Test(String, IpAddr),
    Save,
}

/// In-memory [`AddressSet`]
#[derive(Debug, Default)]
pub struct MemoryAddressSet {
    sets: Mutex<BTreeMap<String, BTreeSet<IpAddr>>>,
    calls: Mutex<Vec<SetCall>>,
    failing: Mutex<HashSet<IpAddr>>,
    fail_all: Mutex<bool>,
    require_create: bool,
}

impl MemoryAddressSet {
    /// Sets spring into existence on first use
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations on sets that were never created fail with `SetNotFound`
    pub fn strict() -> Self {
        Self {
            require_create: true,
            ..Self::default()
        }
    }

    /// Make every operation touching `addr` fail
    pub fn fail_on(&self, addr: IpAddr) {
        self.failing.lock().unwrap().insert(addr);
    }

    /// Make every operation fail (or stop failing)
    pub fn set_failing(&self, fail: bool) {
        *self.fail_all.lock().unwrap() = fail;
    }

    /// Current members of `setname`
    pub fn members(&self, setname: &str) -> Vec<IpAddr> {
        self.sets
            .lock()
            .unwrap()
            .get(setname)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// All recorded calls in order
    pub fn calls(&self) -> Vec<SetCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded `add` calls in order
    pub fn adds(&self) -> Vec<(String, IpAddr)> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter_map(|c| match c {
                SetCall::Add(set, addr) => Some((set.clone(), *addr)),
                _ => None,
            })
            .collect()
    }

    /// Number of `save` calls
    pub fn saves(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, SetCall::Save))
            .count()
    }

    fn record(&self, call: SetCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn injected_failure(&self, command: &str, addr: Option<IpAddr>) -> Result<()> {
        let fail = *self.fail_all.lock().unwrap()
            || addr.is_some_and(|a| self.failing.lock().unwrap().contains(&a));
        if fail {
            return Err(IpSetError::CommandFailed {
                command: command.to_string(),
                status: "exit status: 1".to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn with_set<T>(
        &self,
        setname: &str,
        f: impl FnOnce(&mut BTreeSet<IpAddr>) -> T,
    ) -> Result<T> {
        let mut sets = self.sets.lock().unwrap();
        if self.require_create && !sets.contains_key(setname) {
            return Err(IpSetError::SetNotFound(setname.to_string()));
        }
        Ok(f(sets.entry(setname.to_string()).or_default()))
    }
}

#[async_trait]
impl AddressSet for MemoryAddressSet {
    async fn create(&self, setname: &str) -> Result<()> {
        self.record(SetCall::Create(setname.to_string()));
        validate_set_name(setname)?;
        self.injected_failure("create", None)?;
        self.sets
            .lock()
            .unwrap()
            .entry(setname.to_string())
            .or_default();
        Ok(())
    }

    async fn add(&self, setname: &str, addr: IpAddr) -> Result<()> {
        self.record(SetCall::Add(setname.to_string(), addr));
        validate_set_name(setname)?;
        self.injected_failure("add", Some(addr))?;
        self.with_set(setname, |set| {
            set.insert(addr);
        })
    }

    async fn remove(&self, setname: &str, addr: IpAddr) -> Result<bool> {
        self.record(SetCall::Remove(setname.to_string(), addr));
        validate_set_name(setname)?;
        self.injected_failure("del", Some(addr))?;
        self.with_set(setname, |set| set.remove(&addr))
    }

    async fn test(&self, setname: &str, addr: IpAddr) -> Result<bool> {
        self.record(SetCall::Test(setname.to_string(), addr));
        validate_set_name(setname)?;
        self.injected_failure("test", Some(addr))?;
        self.with_set(setname, |set| set.contains(&addr))
    }

    async fn save(&self) -> Result<String> {
        self.record(SetCall::Save);
        self.injected_failure("save", None)?;

        let sets = self.sets.lock().unwrap();
        let mut out = String::new();
        for (name, members) in sets.iter() {
            out.push_str(&format!("create {} hash:ip family inet\n", name));
            for addr in members {
                out.push_str(&format!("add {} {}\n", name, addr));
            }
        }
        Ok(out)
    }
}
