//! SQLite ledger store.

use super::{LedgerEntry, LedgerError, LedgerResult, LedgerStore};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::{debug, info};

/// Ledger store over a single SQLite table.
///
/// Runs in WAL mode with `synchronous=FULL`, so a committed append survives
/// power loss. The table is only ever inserted into.
pub struct SqliteLedgerStore {
    conn: Mutex<Connection>,
}

impl SqliteLedgerStore {
    /// Open the ledger database, creating it and its directory if needed.
    pub fn open<P: AsRef<Path>>(db_path: P) -> LedgerResult<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        let store = Self::init(conn)?;
        info!("Ledger store opened at {:?}", path);
        Ok(store)
    }

    /// Open a throwaway in-memory database.
    pub fn in_memory() -> LedgerResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> LedgerResult<Self> {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_entries (
                sequence INTEGER PRIMARY KEY,
                attempt_id TEXT NOT NULL,
                item TEXT NOT NULL,
                state TEXT NOT NULL,
                recorded_at TEXT NOT NULL,
                snapshot TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_ledger_attempt ON ledger_entries(attempt_id);
            "#,
        )?;

        debug!(journal_mode = %mode, "Ledger schema initialized");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl LedgerStore for SqliteLedgerStore {
    fn append(&self, entry: &LedgerEntry) -> LedgerResult<u64> {
        let snapshot = serde_json::to_string(&entry.attempt)?;
        let conn = self.conn.lock();

        conn.execute(
            r#"
            INSERT INTO ledger_entries (sequence, attempt_id, item, state, recorded_at, snapshot)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                entry.sequence as i64,
                entry.attempt.id,
                entry.attempt.opportunity.item.to_string(),
                entry.attempt.state.to_string(),
                entry.recorded_at.to_rfc3339(),
                snapshot,
            ],
        )?;

        Ok(entry.sequence)
    }

    fn replay(&self) -> LedgerResult<Vec<LedgerEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT sequence, recorded_at, snapshot
            FROM ledger_entries
            ORDER BY sequence ASC
            "#,
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (sequence, recorded_at, snapshot) = row?;
            let sequence = sequence as u64;
            let recorded_at = DateTime::parse_from_rfc3339(&recorded_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| LedgerError::Corrupt {
                    sequence,
                    reason: e.to_string(),
                })?;
            let attempt = serde_json::from_str(&snapshot).map_err(|e| LedgerError::Corrupt {
                sequence,
                reason: e.to_string(),
            })?;
            entries.push(LedgerEntry {
                sequence,
                recorded_at,
                attempt,
            });
        }

        Ok(entries)
    }

    fn health_check(&self) -> LedgerResult<()> {
        let conn = self.conn.lock();
        let ok: String = conn.query_row("PRAGMA quick_check", [], |row| row.get(0))?;
        if ok != "ok" {
            return Err(LedgerError::Unavailable(ok));
        }
        // Confirms the database is writable, not just readable
        conn.execute_batch("BEGIN IMMEDIATE; ROLLBACK;")?;
        Ok(())
    }
}
