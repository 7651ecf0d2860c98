use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::BoxFuture;
use rusqlite::{params, params_from_iter, Connection};
use tracing::debug;

use tessera_core::audit::{AuditEntry, AuditQuery};
use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::AuditSink;
use tessera_core::types::{ModelId, UserId};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS audit_log (
        id TEXT PRIMARY KEY,
        action TEXT NOT NULL,
        entity_id TEXT NOT NULL,
        model_id TEXT,
        user_id TEXT NOT NULL,
        timestamp TEXT NOT NULL,
        details TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_audit_model ON audit_log(model_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_audit_user ON audit_log(user_id, timestamp);
    CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action, timestamp);";

fn db_err(e: impl std::fmt::Display) -> TesseraError {
    TesseraError::Database(e.to_string())
}

// Fixed-width UTC timestamps so text comparison orders correctly.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Append-only audit log in SQLite.
pub struct SqliteAuditLog {
    conn: Mutex<Connection>,
}

impl SqliteAuditLog {
    /// Open or create an audit database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| db_err(format!("Failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(db_err)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;

        debug!(path = %path.display(), "Audit log opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        conn.execute_batch(SCHEMA).map_err(db_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, entry: &AuditEntry) -> Result<()> {
        let conn = self.conn.lock().map_err(db_err)?;
        conn.execute(
            "INSERT INTO audit_log (id, action, entity_id, model_id, user_id, timestamp, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.id,
                entry.action,
                entry.entity_id,
                entry.model_id.as_ref().map(|m| m.as_str()),
                entry.user_id.as_str(),
                ts(&entry.timestamp),
                serde_json::to_string(&entry.details)?,
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    fn select(&self, query: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let mut sql = String::from(
            "SELECT id, action, entity_id, model_id, user_id, timestamp, details
             FROM audit_log WHERE 1 = 1",
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(model_id) = &query.model_id {
            args.push(model_id.to_string());
            sql.push_str(&format!(" AND model_id = ?{}", args.len()));
        }
        if let Some(user_id) = &query.user_id {
            args.push(user_id.to_string());
            sql.push_str(&format!(" AND user_id = ?{}", args.len()));
        }
        if let Some(action) = &query.action {
            args.push(action.clone());
            sql.push_str(&format!(" AND action = ?{}", args.len()));
        }
        if let Some(since) = &query.since {
            args.push(ts(since));
            sql.push_str(&format!(" AND timestamp >= ?{}", args.len()));
        }
        if let Some(until) = &query.until {
            args.push(ts(until));
            sql.push_str(&format!(" AND timestamp <= ?{}", args.len()));
        }
        sql.push_str(" ORDER BY timestamp ASC, rowid ASC");
        if let Some(limit) = query.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        let conn = self.conn.lock().map_err(db_err)?;
        let mut stmt = conn.prepare(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                ))
            })
            .map_err(db_err)?;

        let mut entries = Vec::new();
        for row in rows {
            let (id, action, entity_id, model_id, user_id, ts_str, details) =
                row.map_err(db_err)?;
            let timestamp = DateTime::parse_from_rfc3339(&ts_str)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(db_err)?;
            entries.push(AuditEntry {
                id,
                action,
                entity_id,
                model_id: model_id.map(ModelId::from),
                user_id: UserId::from(user_id),
                timestamp,
                details: serde_json::from_str(&details).unwrap_or_default(),
            });
        }
        Ok(entries)
    }
}

impl AuditSink for SqliteAuditLog {
    fn save(&self, entry: AuditEntry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.insert(&entry) })
    }

    fn query(&self, query: AuditQuery) -> BoxFuture<'_, Result<Vec<AuditEntry>>> {
        Box::pin(async move { self.select(&query) })
    }
}

/// Audit log kept in a vector; for tests and one-shot CLI runs.
#[derive(Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every entry, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditLog {
    fn save(&self, entry: AuditEntry) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.entries.lock().map_err(db_err)?.push(entry);
            Ok(())
        })
    }

    fn query(&self, query: AuditQuery) -> BoxFuture<'_, Result<Vec<AuditEntry>>> {
        Box::pin(async move {
            let entries = self.entries.lock().map_err(db_err)?;
            let matched = entries.iter().filter(|e| query.matches(e)).cloned();
            Ok(match query.limit {
                Some(limit) => matched.take(limit).collect(),
                None => matched.collect(),
            })
        })
    }
}
