//! Pattern store
//!
//! Holds one pattern list per proxied routing class and answers which class
//! a domain belongs to. Matching is plain substring containment over
//! lowercased names: pattern `you` matches `youtube.com` and also
//! `anyyoudomain.com`. Classes are tested in configured order and the first
//! match wins; a domain matching nothing is routed direct.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{ClassConfig, DIRECT_CLASS};
use dnsroute_dns::normalize_name;

/// Routing decision for a domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    /// No class matched; use the default upstream and no address set
    Direct,
    /// Index of the matching class in priority order
    Proxied(usize),
}

impl Route {
    pub fn is_proxied(&self) -> bool {
        matches!(self, Route::Proxied(_))
    }

    /// Class index, if proxied
    pub fn class_index(&self) -> Option<usize> {
        match self {
            Route::Direct => None,
            Route::Proxied(index) => Some(*index),
        }
    }
}

/// Parse a pattern file: one substring per line, lowercased
///
/// Blank lines and lines starting with `#` are skipped, as are repeats.
pub fn parse_patterns(content: &str) -> Vec<String> {
    let mut patterns: Vec<String> = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let pattern = line.to_lowercase();
        if !patterns.contains(&pattern) {
            patterns.push(pattern);
        }
    }
    patterns
}

/// Name and source file of one class
#[derive(Debug, Clone)]
struct ClassSource {
    name: String,
    path: PathBuf,
}

/// Reloadable per-class pattern lists
#[derive(Debug)]
pub struct PatternStore {
    sources: Vec<ClassSource>,
    lists: RwLock<Vec<Arc<Vec<String>>>>,
}

impl PatternStore {
    /// Create a store for the given classes, all lists empty until reloaded
    pub fn new(classes: &[ClassConfig]) -> Self {
        let sources: Vec<ClassSource> = classes
            .iter()
            .map(|c| ClassSource {
                name: c.name.clone(),
                path: c.patterns.clone(),
            })
            .collect();
        let lists = vec![Arc::new(Vec::new()); sources.len()];

        Self {
            sources,
            lists: RwLock::new(lists),
        }
    }

    /// Name of a route's class
    pub fn class_name(&self, route: Route) -> &str {
        match route {
            Route::Direct => DIRECT_CLASS,
            Route::Proxied(index) => self
                .sources
                .get(index)
                .map(|s| s.name.as_str())
                .unwrap_or(DIRECT_CLASS),
        }
    }

    /// Index of the class called `name`
    pub fn class_index(&self, name: &str) -> Option<usize> {
        self.sources.iter().position(|s| s.name == name)
    }

    /// Re-read every class's pattern file
    ///
    /// A file that cannot be read keeps its previous list. Returns the
    /// number of classes whose list was replaced.
    pub async fn reload(&self) -> usize {
        let mut reloaded = 0;
        for (index, source) in self.sources.iter().enumerate() {
            match tokio::fs::read_to_string(&source.path).await {
                Ok(content) => {
                    let patterns = parse_patterns(&content);
                    let changed = self.replace(index, patterns);
                    if changed {
                        log::info!(
                            "Loaded {} pattern(s) for class {} from {}",
                            self.patterns(index).len(),
                            source.name,
                            source.path.display()
                        );
                    }
                    reloaded += 1;
                }
                Err(e) => {
                    log::warn!(
                        "Failed to read patterns for class {} from {}: {}; keeping {} previous pattern(s)",
                        source.name,
                        source.path.display(),
                        e,
                        self.patterns(index).len()
                    );
                }
            }
        }
        reloaded
    }

    /// Swap in a new list for one class; returns whether it differed
    pub fn replace(&self, index: usize, patterns: Vec<String>) -> bool {
        let mut lists = match self.lists.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match lists.get_mut(index) {
            Some(slot) if **slot != patterns => {
                *slot = Arc::new(patterns);
                true
            }
            _ => false,
        }
    }

    /// Current patterns of a class
    pub fn patterns(&self, index: usize) -> Arc<Vec<String>> {
        self.read_lists()
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    /// Classify a domain
    pub fn classify(&self, domain: &str) -> Route {
        match self.matching_pattern(domain) {
            Some((index, _)) => Route::Proxied(index),
            None => Route::Direct,
        }
    }

    /// First class and pattern matching a domain, in priority order
    pub fn matching_pattern(&self, domain: &str) -> Option<(usize, String)> {
        let domain = normalize_name(domain);
        if domain.is_empty() {
            return None;
        }

        let lists = self.read_lists();
        lists.iter().enumerate().find_map(|(index, patterns)| {
            patterns
                .iter()
                .find(|p| domain.contains(p.as_str()))
                .map(|p| (index, p.clone()))
        })
    }

    fn read_lists(&self) -> std::sync::RwLockReadGuard<'_, Vec<Arc<Vec<String>>>> {
        match self.lists.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Reload `store` every `interval` until shutdown
///
/// The first reload happens one interval after spawning; callers load
/// once themselves before serving.
pub fn spawn_reload_task(
    store: Arc<PatternStore>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    log::debug!("Pattern reload task stopping");
                    break;
                }
                _ = ticker.tick() => {
                    store.reload().await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn class(name: &str, path: &Path) -> ClassConfig {
        ClassConfig {
            name: name.to_string(),
            patterns: path.to_path_buf(),
            upstream: "10.0.0.1:53".to_string(),
            ipset: format!("set_{}", name),
        }
    }

    fn store_with(lists: &[&[&str]]) -> PatternStore {
        let classes: Vec<_> = (0..lists.len())
            .map(|i| class(&format!("c{}", i), Path::new("/nonexistent")))
            .collect();
        let store = PatternStore::new(&classes);
        for (i, list) in lists.iter().enumerate() {
            store.replace(i, list.iter().map(|s| s.to_string()).collect());
        }
        store
    }

    #[test]
    fn test_parse_patterns() {
        let content = "# video\nYouTube\n\n  googlevideo  \n#disabled\nyoutube\n";
        assert_eq!(parse_patterns(content), vec!["youtube", "googlevideo"]);
        assert!(parse_patterns("").is_empty());
    }

    #[test]
    fn test_substring_match() {
        let store = store_with(&[&["you"]]);

        assert_eq!(store.classify("youtube.com"), Route::Proxied(0));
        assert_eq!(store.classify("anyyoudomain.com"), Route::Proxied(0));
        assert_eq!(store.classify("WWW.YOUTUBE.COM."), Route::Proxied(0));
        assert_eq!(store.classify("example.org"), Route::Direct);
        assert_eq!(store.classify(""), Route::Direct);
    }

    #[test]
    fn test_priority_order() {
        let store = store_with(&[&["example"], &["example.com", "other"]]);

        assert_eq!(store.classify("sub.example.com"), Route::Proxied(0));
        assert_eq!(
            store.matching_pattern("sub.example.com"),
            Some((0, "example".to_string()))
        );
        assert_eq!(store.classify("other.net"), Route::Proxied(1));
    }

    #[test]
    fn test_classification_is_stable_without_reload() {
        let store = store_with(&[&["foo"], &["bar"]]);
        let domains = ["foo.com", "bar.net", "foobar.org", "baz.io"];

        let first: Vec<_> = domains.iter().map(|d| store.classify(d)).collect();
        for _ in 0..10 {
            let again: Vec<_> = domains.iter().map(|d| store.classify(d)).collect();
            assert_eq!(first, again);
        }
    }

    #[test]
    fn test_class_names() {
        let store = store_with(&[&[], &[]]);
        assert_eq!(store.class_name(Route::Direct), "direct");
        assert_eq!(store.class_name(Route::Proxied(1)), "c1");
        assert_eq!(store.class_index("c1"), Some(1));
        assert_eq!(store.class_index("nope"), None);
    }

    #[tokio::test]
    async fn test_reload_shrinks_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site_a");
        std::fs::write(&path, "alpha\nbeta\ngamma\n").unwrap();

        let store = PatternStore::new(&[class("a", &path)]);
        assert_eq!(store.reload().await, 1);
        assert_eq!(store.classify("beta.example"), Route::Proxied(0));
        assert_eq!(store.classify("gamma.example"), Route::Proxied(0));

        std::fs::write(&path, "alpha\n").unwrap();
        store.reload().await;

        assert_eq!(store.classify("alpha.example"), Route::Proxied(0));
        assert_eq!(store.classify("beta.example"), Route::Direct);
        assert_eq!(store.classify("gamma.example"), Route::Direct);
    }

    #[tokio::test]
    async fn test_missing_file_keeps_previous_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site_a");
        std::fs::write(&path, "alpha\n").unwrap();

        let store = PatternStore::new(&[class("a", &path)]);
        store.reload().await;
        std::fs::remove_file(&path).unwrap();

        assert_eq!(store.reload().await, 0);
        assert_eq!(store.patterns(0).as_slice(), ["alpha".to_string()]);
        assert_eq!(store.classify("alpha.example"), Route::Proxied(0));
    }

    #[tokio::test]
    async fn test_reload_task_picks_up_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site_a");
        std::fs::write(&path, "alpha\n").unwrap();

        let store = Arc::new(PatternStore::new(&[class("a", &path)]));
        store.reload().await;

        let (tx, rx) = broadcast::channel(1);
        let handle = spawn_reload_task(store.clone(), Duration::from_millis(50), rx);

        std::fs::write(&path, "beta\n").unwrap();
        assert_eq!(store.classify("beta.example"), Route::Direct);

        for _ in 0..100 {
            if store.classify("beta.example").is_proxied() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(store.classify("beta.example"), Route::Proxied(0));

        tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
