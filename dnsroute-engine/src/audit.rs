//! Query audit log
//!
//! After a successful answer, the handler emits one row per observed
//! (domain, address) pair noting whether the domain was proxied. Rows go to
//! the `dns_logs` SQLite table through a bounded queue drained by a single
//! blocking writer, so the query path never waits on the database.

use std::path::Path;
use std::time::Duration;

use rusqlite::{params, Connection};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Default number of queued batches before new ones are dropped
pub const DEFAULT_AUDIT_QUEUE: usize = 1024;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS dns_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    domain TEXT NOT NULL,
    ip TEXT NOT NULL,
    proxied BOOLEAN NOT NULL,
    timestamp DATETIME DEFAULT CURRENT_TIMESTAMP
)";

/// Receives audit rows; must not block
pub trait AuditSink: Send + Sync {
    fn record(&self, domain: &str, addrs: &[String], proxied: bool);
}

/// Audit sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAudit;

impl AuditSink for NoAudit {
    fn record(&self, _domain: &str, _addrs: &[String], _proxied: bool) {}
}

#[derive(Debug)]
struct AuditBatch {
    domain: String,
    addrs: Vec<String>,
    proxied: bool,
}

/// SQLite-backed audit sink
#[derive(Debug, Clone)]
pub struct SqliteAudit {
    tx: mpsc::Sender<AuditBatch>,
}

impl SqliteAudit {
    /// Open (or create) the database and start the writer
    ///
    /// The writer exits once every clone of the sink has been dropped.
    pub fn open<P: AsRef<Path>>(path: P, capacity: usize) -> Result<(Self, JoinHandle<()>)> {
        let conn = open_database(path.as_ref())?;
        let (tx, mut rx) = mpsc::channel::<AuditBatch>(capacity.max(1));

        let writer = tokio::task::spawn_blocking(move || {
            while let Some(batch) = rx.blocking_recv() {
                if let Err(e) = insert_batch(&conn, &batch) {
                    log::warn!("Failed to write audit rows for {}: {}", batch.domain, e);
                }
            }
            log::debug!("Audit writer stopped");
        });

        Ok((Self { tx }, writer))
    }
}

impl AuditSink for SqliteAudit {
    fn record(&self, domain: &str, addrs: &[String], proxied: bool) {
        if addrs.is_empty() {
            return;
        }
        let batch = AuditBatch {
            domain: domain.to_string(),
            addrs: addrs.to_vec(),
            proxied,
        };
        if let Err(e) = self.tx.try_send(batch) {
            log::warn!("Audit queue unavailable, dropping rows for {}: {}", domain, e);
        }
    }
}

fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    // The database may be shared with other tools
    if let Err(e) = conn.execute_batch("PRAGMA journal_mode=WAL;") {
        log::debug!("Cannot enable WAL on {}: {}", path.display(), e);
    }
    conn.execute(SCHEMA, [])?;
    Ok(conn)
}

fn insert_batch(conn: &Connection, batch: &AuditBatch) -> rusqlite::Result<()> {
    let mut stmt =
        conn.prepare_cached("INSERT INTO dns_logs (domain, ip, proxied) VALUES (?1, ?2, ?3)")?;
    for addr in &batch.addrs {
        stmt.execute(params![batch.domain, addr, batch.proxied])?;
    }
    Ok(())
}

/// One audit row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditRow {
    pub id: i64,
    pub domain: String,
    pub ip: String,
    pub proxied: bool,
    pub timestamp: String,
}

/// Read access to the audit table
pub struct AuditStore {
    conn: Connection,
}

impl AuditStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            conn: open_database(path.as_ref())?,
        })
    }

    /// Most recent rows, newest first
    pub fn recent(&self, limit: usize) -> Result<Vec<AuditRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, domain, ip, proxied, timestamp FROM dns_logs ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok(AuditRow {
                    id: row.get(0)?,
                    domain: row.get(1)?,
                    ip: row.get(2)?,
                    proxied: row.get(3)?,
                    timestamp: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rows_written_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");

        let (audit, writer) = SqliteAudit::open(&path, 16).unwrap();
        audit.record(
            "sub.example.com",
            &["93.184.216.34".to_string(), "93.184.216.35".to_string()],
            true,
        );
        audit.record("unrelated.org", &["10.0.0.1".to_string()], false);
        audit.record("empty.org", &[], false);
        drop(audit);
        writer.await.unwrap();

        let store = AuditStore::open(&path).unwrap();
        let rows = store.recent(10).unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].domain, "unrelated.org");
        assert!(!rows[0].proxied);
        assert_eq!(rows[2].ip, "93.184.216.34");
        assert!(rows[2].proxied);
        assert!(!rows[0].timestamp.is_empty());

        assert_eq!(store.recent(1).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let audit = SqliteAudit { tx };

        audit.record("a.example", &["1.1.1.1".to_string()], false);
        // Queue is full and nothing drains it; must return immediately
        audit.record("b.example", &["2.2.2.2".to_string()], false);
    }

    #[test]
    fn test_open_bad_path_fails() {
        assert!(AuditStore::open("/nonexistent/dir/audit.db").is_err());
    }
}
