//! Administrative operations
//!
//! Pattern edits made while the proxy runs. The pattern files are the
//! source of truth; a running proxy picks edits up on its next reload.
//! Because classification only affects future queries, adding or removing
//! a pattern also reconciles the address sets against every address the
//! address map has ever recorded for matching domains.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::addr_map::{addresses_matching, domains_matching, read_snapshot, write_atomic, Snapshot};
use crate::config::{ClassConfig, Config};
use crate::error::{Error, Result};
use crate::patterns::{parse_patterns, PatternStore};
use crate::persist::{SaveKind, SnapshotTarget, Snapshots};
use dnsroute_ipset::AddressSet;

/// Outcome of a pattern edit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternChange {
    pub class: String,
    pub pattern: String,
    /// Whether the class's pattern file was rewritten
    pub file_changed: bool,
    /// Other classes' files the pattern was removed from
    pub moved_from: Vec<String>,
    /// Historical addresses added to the class's set
    pub added: usize,
    /// Historical addresses removed from a set
    pub removed: usize,
    /// Set operations that failed
    pub failed: usize,
}

/// A pattern and how many addresses it has covered so far
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternInfo {
    pub pattern: String,
    pub addresses: usize,
}

/// Patterns of one class
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassPatterns {
    pub class: String,
    pub patterns: Vec<PatternInfo>,
}

/// A recorded address and the class sets currently holding it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    pub addr: String,
    pub member_of: Vec<String>,
}

/// A recorded domain matching a lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub domain: String,
    /// Class the domain classifies to now
    pub class: String,
    pub addresses: Vec<AddressInfo>,
}

/// Pattern and address-set administration
pub struct Admin {
    classes: Vec<ClassConfig>,
    map_file: PathBuf,
    sets: Arc<dyn AddressSet>,
    snapshots: Snapshots,
}

impl Admin {
    pub fn new(config: &Config, sets: Arc<dyn AddressSet>) -> Self {
        // Map saves go through the proxy; only the set dump is written here
        let snapshots = Snapshots::new(Arc::default(), sets.clone(), &config.persistence);
        Self {
            classes: config.classes.clone(),
            map_file: config.persistence.map_file.clone(),
            sets,
            snapshots,
        }
    }

    /// Route `pattern` to `class`
    ///
    /// The pattern leaves every other class. Recorded addresses of matching
    /// domains move into the class's set and out of the other sets.
    pub async fn add_pattern(&self, class: &str, pattern: &str) -> Result<PatternChange> {
        let target = self.class_position(class)?;
        let pattern = normalize_pattern(pattern)?;
        let mut change = PatternChange {
            class: class.to_string(),
            pattern: pattern.clone(),
            ..Default::default()
        };

        for (index, other) in self.classes.iter().enumerate() {
            if index != target && remove_line(&other.patterns, &pattern).await? {
                log::info!("Moved pattern {} out of class {}", pattern, other.name);
                change.moved_from.push(other.name.clone());
            }
        }
        change.file_changed = append_line(&self.classes[target].patterns, &pattern).await?;

        let snapshot = self.snapshot()?;
        for addr in addresses_matching(&snapshot, &pattern) {
            let Some(ip) = parse_addr(&addr, &mut change.failed) else {
                continue;
            };
            let target_set = &self.classes[target].ipset;
            match self.sets.add(target_set, ip).await {
                Ok(()) => change.added += 1,
                Err(e) => {
                    log::warn!("Failed to add {} to {}: {}", ip, target_set, e);
                    change.failed += 1;
                }
            }
            for (index, other) in self.classes.iter().enumerate() {
                if index != target {
                    self.remove_from_set(&other.ipset, ip, &mut change).await;
                }
            }
        }

        self.finish(&change).await;
        Ok(change)
    }

    /// Stop routing `pattern` to `class`
    ///
    /// Recorded addresses of matching domains leave the class's set.
    pub async fn remove_pattern(&self, class: &str, pattern: &str) -> Result<PatternChange> {
        let index = self.class_position(class)?;
        let pattern = normalize_pattern(pattern)?;
        let class_config = &self.classes[index];
        let mut change = PatternChange {
            class: class.to_string(),
            pattern: pattern.clone(),
            ..Default::default()
        };

        change.file_changed = remove_line(&class_config.patterns, &pattern).await?;

        let snapshot = self.snapshot()?;
        for addr in addresses_matching(&snapshot, &pattern) {
            if let Some(ip) = parse_addr(&addr, &mut change.failed) {
                self.remove_from_set(&class_config.ipset, ip, &mut change).await;
            }
        }

        self.finish(&change).await;
        Ok(change)
    }

    /// Every class's patterns with their historical address counts
    pub async fn list_patterns(&self) -> Result<Vec<ClassPatterns>> {
        let snapshot = self.snapshot()?;
        let mut listing = Vec::with_capacity(self.classes.len());

        for class in &self.classes {
            let patterns = read_patterns(&class.patterns)
                .await?
                .into_iter()
                .map(|pattern| PatternInfo {
                    addresses: addresses_matching(&snapshot, &pattern).len(),
                    pattern,
                })
                .collect();
            listing.push(ClassPatterns {
                class: class.name.clone(),
                patterns,
            });
        }
        Ok(listing)
    }

    /// Recorded domains containing `pattern`
    pub async fn lookup(&self, pattern: &str) -> Result<Vec<DomainInfo>> {
        let pattern = normalize_pattern(pattern)?;
        let snapshot = self.snapshot()?;

        let store = PatternStore::new(&self.classes);
        store.reload().await;

        let mut membership: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut domains = Vec::new();
        for (domain, addrs) in domains_matching(&snapshot, &pattern) {
            let mut addresses = Vec::with_capacity(addrs.len());
            for addr in addrs {
                if !membership.contains_key(addr) {
                    let sets = self.member_of(addr).await;
                    membership.insert(addr.clone(), sets);
                }
                addresses.push(AddressInfo {
                    addr: addr.clone(),
                    member_of: membership.get(addr).cloned().unwrap_or_default(),
                });
            }
            domains.push(DomainInfo {
                domain: domain.clone(),
                class: store.class_name(store.classify(domain)).to_string(),
                addresses,
            });
        }
        Ok(domains)
    }

    fn class_position(&self, name: &str) -> Result<usize> {
        self.classes
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::UnknownClass(name.to_string()))
    }

    fn snapshot(&self) -> Result<Snapshot> {
        match read_snapshot(&self.map_file) {
            Ok(snapshot) => Ok(snapshot),
            Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => Ok(Snapshot::new()),
            Err(e) => Err(e),
        }
    }

    async fn remove_from_set(&self, setname: &str, ip: IpAddr, change: &mut PatternChange) {
        match self.sets.remove(setname, ip).await {
            Ok(true) => change.removed += 1,
            Ok(false) => {}
            Err(e) => {
                log::warn!("Failed to remove {} from {}: {}", ip, setname, e);
                change.failed += 1;
            }
        }
    }

    /// Names of the classes whose set contains `addr`
    async fn member_of(&self, addr: &str) -> Vec<String> {
        let Ok(ip) = addr.parse::<IpAddr>() else {
            return Vec::new();
        };
        let mut classes = Vec::new();
        for class in &self.classes {
            match self.sets.test(&class.ipset, ip).await {
                Ok(true) => classes.push(class.name.clone()),
                Ok(false) => {}
                Err(e) => log::debug!("Cannot test {} in {}: {}", ip, class.ipset, e),
            }
        }
        classes
    }

    async fn finish(&self, change: &PatternChange) {
        log::info!(
            "Pattern {} for class {}: {} added, {} removed, {} failed",
            change.pattern,
            change.class,
            change.added,
            change.removed,
            change.failed
        );
        if change.added + change.removed > 0 {
            if let Err(e) = self.snapshots.flush(SaveKind::AddressSet).await {
                log::warn!("Failed to save address sets: {}", e);
            }
        }
    }
}

/// Lowercase and trim a pattern, rejecting what a pattern file cannot hold
pub fn normalize_pattern(pattern: &str) -> Result<String> {
    let pattern = pattern.trim().to_lowercase();
    if pattern.is_empty() {
        return Err(Error::Pattern("pattern is empty".into()));
    }
    if pattern.starts_with('#') {
        return Err(Error::Pattern(format!("'{}' would be read as a comment", pattern)));
    }
    if pattern.chars().any(char::is_whitespace) {
        return Err(Error::Pattern(format!("'{}' contains whitespace", pattern)));
    }
    Ok(pattern)
}

fn parse_addr(addr: &str, failed: &mut usize) -> Option<IpAddr> {
    match addr.parse() {
        Ok(ip) => Some(ip),
        Err(_) => {
            log::warn!("Skipping malformed recorded address {}", addr);
            *failed += 1;
            None
        }
    }
}

async fn read_file(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(e.into()),
    }
}

async fn read_patterns(path: &Path) -> Result<Vec<String>> {
    Ok(parse_patterns(&read_file(path).await?))
}

/// Append `pattern` unless present; returns whether the file changed
async fn append_line(path: &Path, pattern: &str) -> Result<bool> {
    let mut content = read_file(path).await?;
    if parse_patterns(&content).iter().any(|p| p == pattern) {
        return Ok(false);
    }
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(pattern);
    content.push('\n');
    write_atomic(path, content.as_bytes()).await?;
    Ok(true)
}

/// Drop every line equal to `pattern`; returns whether the file changed
async fn remove_line(path: &Path, pattern: &str) -> Result<bool> {
    let content = read_file(path).await?;
    let mut removed = false;
    let mut kept = String::with_capacity(content.len());
    for line in content.lines() {
        if line.trim().to_lowercase() == pattern {
            removed = true;
        } else {
            kept.push_str(line);
            kept.push('\n');
        }
    }
    if removed {
        write_atomic(path, kept.as_bytes()).await?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr_map::AddressMap;
    use dnsroute_ipset::mock::MemoryAddressSet;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        admin: Admin,
        sets: Arc<MemoryAddressSet>,
        nl_file: PathBuf,
        usa_file: PathBuf,
        save_file: PathBuf,
    }

    async fn fixture(nl: &str, usa: &str, records: &[(&str, &str)]) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let nl_file = dir.path().join("site_nl");
        let usa_file = dir.path().join("site_usa");
        let map_file = dir.path().join("map.json");
        let save_file = dir.path().join("ipset.conf");
        std::fs::write(&nl_file, nl).unwrap();
        std::fs::write(&usa_file, usa).unwrap();

        let map = AddressMap::new();
        for (domain, addr) in records {
            map.insert(domain, addr);
        }
        map.save(&map_file).await.unwrap();

        let mut config = Config::default();
        config.persistence.map_file = map_file;
        config.persistence.ipset_save_file = save_file.clone();
        config.classes = vec![
            ClassConfig {
                name: "nl".into(),
                patterns: nl_file.clone(),
                upstream: "10.10.1.2".into(),
                ipset: "proxied_nl".into(),
            },
            ClassConfig {
                name: "usa".into(),
                patterns: usa_file.clone(),
                upstream: "10.24.0.2".into(),
                ipset: "proxied_usa".into(),
            },
        ];

        let sets = Arc::new(MemoryAddressSet::new());
        let admin = Admin::new(&config, sets.clone());
        Fixture {
            _dir: dir,
            admin,
            sets,
            nl_file,
            usa_file,
            save_file,
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_add_pattern_moves_between_classes() {
        let f = fixture(
            "# nl sites\nnetflix\n",
            "youtube\nhulu\n",
            &[
                ("www.youtube.com", "1.1.1.1"),
                ("m.youtube.com", "2.2.2.2"),
                ("hulu.com", "3.3.3.3"),
            ],
        )
        .await;
        f.sets.add("proxied_usa", ip("1.1.1.1")).await.unwrap();

        let change = f.admin.add_pattern("nl", "  YouTube ").await.unwrap();

        assert_eq!(change.pattern, "youtube");
        assert!(change.file_changed);
        assert_eq!(change.moved_from, vec!["usa"]);
        assert_eq!(change.added, 2);
        assert_eq!(change.removed, 1);
        assert_eq!(change.failed, 0);

        assert_eq!(
            std::fs::read_to_string(&f.nl_file).unwrap(),
            "# nl sites\nnetflix\nyoutube\n"
        );
        assert_eq!(std::fs::read_to_string(&f.usa_file).unwrap(), "hulu\n");
        assert_eq!(f.sets.members("proxied_nl"), vec![ip("1.1.1.1"), ip("2.2.2.2")]);
        assert!(f.sets.members("proxied_usa").is_empty());

        let dump = std::fs::read_to_string(&f.save_file).unwrap();
        assert!(dump.contains("add proxied_nl 2.2.2.2"));
    }

    #[tokio::test]
    async fn test_add_existing_pattern_keeps_file() {
        let f = fixture("netflix", "", &[]).await;

        let change = f.admin.add_pattern("nl", "netflix").await.unwrap();

        assert!(!change.file_changed);
        assert_eq!(change.added, 0);
        assert_eq!(std::fs::read_to_string(&f.nl_file).unwrap(), "netflix");
        // Nothing changed in the sets, so no dump
        assert!(!f.save_file.exists());
    }

    #[tokio::test]
    async fn test_add_pattern_counts_failures() {
        let f = fixture(
            "",
            "",
            &[("cdn.example", "4.4.4.4"), ("img.cdn.example", "5.5.5.5")],
        )
        .await;
        f.sets.fail_on(ip("5.5.5.5"));

        let change = f.admin.add_pattern("usa", "cdn").await.unwrap();

        assert_eq!(change.added, 1);
        // Failed add to usa plus failed removal from nl
        assert_eq!(change.failed, 2);
        assert_eq!(f.sets.members("proxied_usa"), vec![ip("4.4.4.4")]);
    }

    #[tokio::test]
    async fn test_remove_pattern() {
        let f = fixture(
            "netflix\nNetflix\nnflxvideo\n",
            "",
            &[("www.netflix.com", "6.6.6.6"), ("other.org", "7.7.7.7")],
        )
        .await;
        f.sets.add("proxied_nl", ip("6.6.6.6")).await.unwrap();
        f.sets.add("proxied_nl", ip("7.7.7.7")).await.unwrap();

        let change = f.admin.remove_pattern("nl", "netflix").await.unwrap();

        assert!(change.file_changed);
        assert_eq!(change.removed, 1);
        assert_eq!(std::fs::read_to_string(&f.nl_file).unwrap(), "nflxvideo\n");
        assert_eq!(f.sets.members("proxied_nl"), vec![ip("7.7.7.7")]);
    }

    #[tokio::test]
    async fn test_unknown_class_and_bad_pattern() {
        let f = fixture("", "", &[]).await;

        assert!(matches!(
            f.admin.add_pattern("de", "x").await,
            Err(Error::UnknownClass(_))
        ));
        assert!(matches!(
            f.admin.add_pattern("nl", "   ").await,
            Err(Error::Pattern(_))
        ));
        assert!(matches!(
            f.admin.add_pattern("nl", "#youtube").await,
            Err(Error::Pattern(_))
        ));
        assert!(matches!(
            f.admin.remove_pattern("nl", "a b").await,
            Err(Error::Pattern(_))
        ));
    }

    #[tokio::test]
    async fn test_list_patterns() {
        let f = fixture(
            "youtube\nnetflix\n",
            "hulu\n",
            &[
                ("www.youtube.com", "1.1.1.1"),
                ("youtube.com", "1.1.1.1"),
                ("i.youtube.com", "2.2.2.2"),
            ],
        )
        .await;

        let listing = f.admin.list_patterns().await.unwrap();

        assert_eq!(listing.len(), 2);
        assert_eq!(listing[0].class, "nl");
        assert_eq!(
            listing[0].patterns,
            vec![
                PatternInfo {
                    pattern: "youtube".into(),
                    addresses: 2
                },
                PatternInfo {
                    pattern: "netflix".into(),
                    addresses: 0
                },
            ]
        );
        assert_eq!(listing[1].patterns[0].pattern, "hulu");
    }

    #[tokio::test]
    async fn test_lookup() {
        let f = fixture(
            "www.youtube\n",
            "",
            &[
                ("www.youtube.com", "1.1.1.1"),
                ("youtube-nocookie.net", "2.2.2.2"),
                ("example.org", "3.3.3.3"),
            ],
        )
        .await;
        f.sets.add("proxied_nl", ip("1.1.1.1")).await.unwrap();

        let found = f.admin.lookup("YOUTUBE").await.unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].domain, "www.youtube.com");
        assert_eq!(found[0].class, "nl");
        assert_eq!(found[0].addresses[0].member_of, vec!["nl"]);
        assert_eq!(found[1].domain, "youtube-nocookie.net");
        assert_eq!(found[1].class, "direct");
        assert!(found[1].addresses[0].member_of.is_empty());
    }

    #[tokio::test]
    async fn test_missing_map_file_is_empty() {
        let f = fixture("", "", &[]).await;
        std::fs::remove_file(&f.admin.map_file).unwrap();

        assert!(f.admin.lookup("anything").await.unwrap().is_empty());
        let change = f.admin.add_pattern("nl", "anything").await.unwrap();
        assert_eq!(change.added, 0);
    }
}
