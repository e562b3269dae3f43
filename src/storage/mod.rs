//! SQLite persistence layer.
//!
//! One `Db` handle is shared by the capability store, the threshold manager,
//! and the executor's checkpoint persistence. All access goes through a single
//! mutex-guarded connection; WAL mode keeps readers cheap and the busy timeout
//! absorbs short write contention.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Ephemeral in-memory database. Used by `--db :memory:` runs and tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )
        .context("Failed to set database PRAGMAs")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Run a closure with the connection. Poisoned-lock recovery is
    /// intentional: a panicked writer must not take the whole store down.
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let guard = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        f(&guard).context("database operation failed")
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS capabilities (
                    id TEXT PRIMARY KEY,
                    fqdn TEXT NOT NULL,
                    code_hash TEXT NOT NULL UNIQUE,
                    code_snippet TEXT NOT NULL,
                    intent_embedding BLOB NOT NULL,
                    parameters_schema TEXT,
                    tools_used TEXT NOT NULL,
                    success_rate REAL NOT NULL DEFAULT 1.0,
                    usage_count INTEGER NOT NULL DEFAULT 1,
                    success_count INTEGER NOT NULL DEFAULT 1,
                    avg_duration_ms REAL NOT NULL DEFAULT 0,
                    community_id INTEGER,
                    created_at TEXT NOT NULL,
                    last_used TEXT NOT NULL,
                    source TEXT NOT NULL DEFAULT 'emergent'
                );
                CREATE INDEX IF NOT EXISTS idx_capabilities_fqdn ON capabilities(fqdn);

                CREATE TABLE IF NOT EXISTS capability_dependencies (
                    from_capability_id TEXT NOT NULL,
                    to_capability_id TEXT NOT NULL,
                    edge_type TEXT NOT NULL,
                    edge_source TEXT NOT NULL DEFAULT 'observed',
                    observed_count INTEGER NOT NULL DEFAULT 1,
                    confidence_score REAL NOT NULL DEFAULT 0.5,
                    created_at TEXT NOT NULL,
                    last_observed TEXT NOT NULL,
                    PRIMARY KEY (from_capability_id, to_capability_id),
                    FOREIGN KEY (from_capability_id) REFERENCES capabilities(id),
                    FOREIGN KEY (to_capability_id) REFERENCES capabilities(id)
                );

                CREATE TABLE IF NOT EXISTS workflow_dags (
                    workflow_id TEXT PRIMARY KEY,
                    dag_json TEXT NOT NULL,
                    intent TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    expires_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS workflow_checkpoints (
                    id TEXT PRIMARY KEY,
                    workflow_id TEXT NOT NULL,
                    layer_index INTEGER NOT NULL,
                    task_snapshot_json TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_checkpoints_workflow
                    ON workflow_checkpoints(workflow_id, layer_index);

                CREATE TABLE IF NOT EXISTS adaptive_thresholds (
                    context_hash TEXT PRIMARY KEY,
                    context_keys_json TEXT NOT NULL,
                    suggestion_threshold REAL NOT NULL,
                    explicit_threshold REAL NOT NULL,
                    success_rate REAL,
                    sample_count INTEGER NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS metrics (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    metric_name TEXT NOT NULL,
                    value REAL NOT NULL,
                    timestamp TEXT NOT NULL,
                    metadata_json TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_metrics_name_ts
                    ON metrics(metric_name, timestamp DESC);
                "#,
            )?;
            Ok(())
        })?;
        debug!("database schema initialized");
        Ok(())
    }

    /// Append a metric sample.
    pub fn record_metric(&self, name: &str, value: f64, metadata: Option<&serde_json::Value>) -> Result<()> {
        let ts = chrono::Utc::now().to_rfc3339();
        let meta = metadata.map(std::string::ToString::to_string);
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO metrics (metric_name, value, timestamp, metadata_json) VALUES (?1, ?2, ?3, ?4)",
                rusqlite::params![name, value, ts, meta],
            )?;
            Ok(())
        })?;
        Ok(())
    }

    /// Most recent samples for a metric, newest first.
    pub fn recent_metrics(&self, name: &str, limit: usize) -> Result<Vec<(String, f64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp, value FROM metrics WHERE metric_name = ?1
                 ORDER BY timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![name, limit as i64], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Distinct metric names with sample counts, for `/api/metrics`.
    pub fn metric_summary(&self) -> Result<Vec<(String, i64, f64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT metric_name, COUNT(*), AVG(value) FROM metrics
                 GROUP BY metric_name ORDER BY metric_name",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, f64>(2)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_init_is_idempotent() {
        let db = Db::open_in_memory().unwrap();
        db.init_schema().unwrap();
        db.init_schema().unwrap();
    }

    #[test]
    fn open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deep").join("toolweave.db");
        let _db = Db::open(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn metrics_roundtrip_newest_first() {
        let db = Db::open_in_memory().unwrap();
        db.record_metric("discovery.latency_ms", 12.5, None).unwrap();
        db.record_metric("discovery.latency_ms", 8.0, None).unwrap();
        let rows = db.recent_metrics("discovery.latency_ms", 10).unwrap();
        assert_eq!(rows.len(), 2);

        let summary = db.metric_summary().unwrap();
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].0, "discovery.latency_ms");
        assert_eq!(summary[0].1, 2);
    }
}
