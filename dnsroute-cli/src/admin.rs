//! Administrative commands

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use dnsroute_engine::config::DIRECT_CLASS;
use dnsroute_engine::{Admin, AuditStore, Config, PatternChange, PatternStore};

fn admin(config: &Config) -> Admin {
    Admin::new(config, Arc::new(config.ipset.command()))
}

pub async fn classify(config: &Config, domain: &str) -> Result<()> {
    let store = PatternStore::new(&config.classes);
    store.reload().await;

    match store.matching_pattern(domain) {
        Some((index, pattern)) => {
            let class = &config.classes[index];
            println!(
                "{} -> class {} (pattern '{}'), upstream {}, set {}",
                domain, class.name, pattern, class.upstream, class.ipset
            );
        }
        None => {
            let upstream = config
                .default_upstream()
                .map(|u| u.to_string())
                .unwrap_or_else(|e| format!("unavailable ({})", e));
            println!("{} -> {}, upstream {}", domain, DIRECT_CLASS, upstream);
        }
    }
    Ok(())
}

pub async fn add_pattern(config: &Config, class: &str, pattern: &str) -> Result<()> {
    let change = admin(config)
        .add_pattern(class, pattern)
        .await
        .with_context(|| format!("Failed to add pattern to class {}", class))?;

    if change.file_changed {
        println!("Pattern '{}' added to class {}", change.pattern, change.class);
    } else {
        println!("Pattern '{}' already in class {}", change.pattern, change.class);
    }
    for other in &change.moved_from {
        println!("  removed from class {}", other);
    }
    println!(
        "  {} historical address(es) added, {} removed from other sets",
        change.added, change.removed
    );
    report_failures(&change)
}

pub async fn remove_pattern(config: &Config, class: &str, pattern: &str) -> Result<()> {
    let change = admin(config)
        .remove_pattern(class, pattern)
        .await
        .with_context(|| format!("Failed to remove pattern from class {}", class))?;

    if change.file_changed {
        println!("Pattern '{}' removed from class {}", change.pattern, change.class);
    } else {
        println!("Pattern '{}' was not in class {}", change.pattern, change.class);
    }
    println!("  {} historical address(es) removed from the set", change.removed);
    report_failures(&change)
}

fn report_failures(change: &PatternChange) -> Result<()> {
    if change.failed > 0 {
        bail!("{} address-set operation(s) failed", change.failed);
    }
    Ok(())
}

pub async fn list_patterns(config: &Config) -> Result<()> {
    let listing = admin(config)
        .list_patterns()
        .await
        .context("Failed to list patterns")?;

    for class in listing {
        println!("{} ({} pattern(s))", class.class, class.patterns.len());
        for info in class.patterns {
            println!("  {:<40} {} address(es)", info.pattern, info.addresses);
        }
    }
    Ok(())
}

pub async fn lookup(config: &Config, pattern: &str) -> Result<()> {
    let domains = admin(config)
        .lookup(pattern)
        .await
        .context("Failed to look up recorded domains")?;

    if domains.is_empty() {
        println!("No recorded domains contain '{}'", pattern);
        return Ok(());
    }

    let total: usize = domains.iter().map(|d| d.addresses.len()).sum();
    println!("{} domain(s), {} address(es)", domains.len(), total);
    for domain in domains {
        println!("{} [{}]", domain.domain, domain.class);
        for addr in domain.addresses {
            let sets = if addr.member_of.is_empty() {
                DIRECT_CLASS.to_string()
            } else {
                addr.member_of.join(", ")
            };
            println!("  {:<40} {}", addr.addr, sets);
        }
    }
    Ok(())
}

pub fn show_log(config: &Config, limit: usize) -> Result<()> {
    let Some(path) = config.audit.database.as_ref() else {
        bail!("Audit log is disabled: set audit.database in the configuration");
    };
    let rows = AuditStore::open(path)
        .and_then(|store| store.recent(limit))
        .with_context(|| format!("Failed to read audit log {:?}", path))?;

    for row in rows.iter().rev() {
        let route = if row.proxied { "proxied" } else { DIRECT_CLASS };
        println!("{}  {:<8} {:<40} {}", row.timestamp, route, row.domain, row.ip);
    }
    Ok(())
}
