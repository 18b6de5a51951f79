//! Typed persistence over SQLite.
//!
//! The store owns one rusqlite connection behind a mutex: concurrent readers
//! and serialized writers, which is enough for the engine's modest write
//! rate. Every multi-statement write goes through `with_tx`, and every state
//! transition writes its audit row inside the same transaction. Invariant
//! breaches are rejected here, at the boundary, before any SQL runs.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction};
use thiserror::Error;

pub mod migrations;

mod approvals;
mod audit;
mod dismissals;
mod events;
mod items;
mod messages;

pub use approvals::TOKEN_TTL_HOURS;
pub use events::{event_fingerprint, EventPatch};
pub(crate) use items::{item_from_row, ITEM_SELECT};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Data integrity error: {0}")]
    Integrity(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),
}

impl StoreError {
    /// True when the underlying SQLite error is a uniqueness violation on a
    /// natural key. Call sites that expect idempotent repeats swallow these.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
                e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            }
            _ => false,
        }
    }
}

/// SQLite-backed store for messages, items, events, approvals, and audit.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema current.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
        }

        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// In-memory store with the full schema. Test fixture.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        migrations::run_migrations(&conn, None)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        // A panic while holding the lock leaves the data consistent (SQLite
        // rolls back the open transaction), so a poisoned guard is usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a read (or single-statement write) against the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.lock();
        f(&conn)
    }

    /// Run `f` inside an immediate transaction. Commits on Ok, rolls back
    /// on Err.
    pub fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Current schema version.
    pub fn schema_version(&self) -> Result<i32, StoreError> {
        self.with_conn(|conn| migrations::current_version(conn))
    }

    /// Walk the schema back to `target`.
    pub fn rollback_to(&self, target: i32) -> Result<usize, StoreError> {
        self.with_conn(|conn| migrations::rollback_to(conn, target))
    }

    /// Default database location: `~/.hearth/hearth.db`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".hearth").join("hearth.db"))
    }

    /// Record a terminal decision for one message: processed-message row,
    /// optional item row, and the audit entry, in a single transaction.
    ///
    /// Returns false (and writes nothing else) when the message was already
    /// processed — INSERT OR IGNORE on the natural key makes reruns safe.
    pub fn record_discovery(
        &self,
        pm: &crate::types::ProcessedMessage,
        item: Option<&crate::types::Item>,
        audit_entry: &crate::types::AuditEntry,
    ) -> Result<bool, StoreError> {
        self.with_tx(|tx| {
            let inserted = messages::insert_processed_message(tx, pm)?;
            if !inserted {
                return Ok(false);
            }
            if let Some(item) = item {
                items::insert_item(tx, item)?;
            }
            audit::insert_audit(tx, audit_entry)?;
            Ok(true)
        })
    }
}

// ============================================================================
// Multi-person filter
// ============================================================================

/// SQL predicate matching `column` against a person name, including
/// comma-joined multi-assignments. Appends four `?` placeholders; bind the
/// result of [`person_filter_params`] in the same order.
pub fn person_filter_sql(column: &str) -> String {
    format!("({column} = ? OR {column} LIKE ? OR {column} LIKE ? OR {column} LIKE ?)")
}

/// Bind values for [`person_filter_sql`].
pub fn person_filter_params(name: &str) -> [String; 4] {
    [
        name.to_string(),
        format!("{name}, %"),
        format!("%, {name}"),
        format!("%, {name}, %"),
    ]
}

// ============================================================================
// Timestamp helpers
// ============================================================================

pub(crate) fn to_ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

/// Parse a timestamp column inside a rusqlite row mapper.
pub(crate) fn ts_col(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Parse an optional timestamp column inside a rusqlite row mapper.
pub(crate) fn opt_ts_col(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|v| ts_col(idx, v)).transpose()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory_has_schema() {
        let store = test_utils::test_store();
        assert_eq!(
            store.schema_version().unwrap(),
            migrations::latest_version()
        );
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("hearth.db");
        let store = Store::open(&path).expect("open");
        assert!(path.exists());
        assert_eq!(
            store.schema_version().unwrap(),
            migrations::latest_version()
        );
    }

    #[test]
    fn test_tx_rolls_back_on_error() {
        let store = test_utils::test_store();
        let result: Result<(), StoreError> = store.with_tx(|tx| {
            tx.execute(
                "INSERT INTO processed_messages (message_id, processed_at, pack_id, extraction_status)
                 VALUES ('m1', '2026-01-01T00:00:00Z', 'school', 'success')",
                [],
            )?;
            Err(StoreError::Integrity("boom".into()))
        });
        assert!(result.is_err());

        let count: i32 = store
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM processed_messages", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0, "rolled-back insert must not persist");
    }

    #[test]
    fn test_person_filter_matches_multi_assignments() {
        let store = test_utils::test_store();
        store
            .with_conn(|conn| {
                conn.execute_batch(
                    "INSERT INTO processed_messages (message_id, processed_at, pack_id, extraction_status)
                     VALUES ('m1', '2026-01-01T00:00:00Z', 'school', 'success');
                     INSERT INTO items (id, message_id, pack_id, primary_category, person, created_at)
                     VALUES ('i1', 'm1', 'school', 'school', 'Colin', '2026-01-01T00:00:00Z'),
                            ('i2', 'm1', 'school', 'school', 'Colin, Henry', '2026-01-01T00:00:00Z'),
                            ('i3', 'm1', 'school', 'school', 'Henry, Colin, June', '2026-01-01T00:00:00Z'),
                            ('i4', 'm1', 'school', 'school', 'Colinette', '2026-01-01T00:00:00Z');",
                )?;
                Ok(())
            })
            .unwrap();

        let sql = format!(
            "SELECT COUNT(*) FROM items WHERE {}",
            person_filter_sql("person")
        );
        let count: i32 = store
            .with_conn(|conn| {
                Ok(conn.query_row(
                    &sql,
                    rusqlite::params_from_iter(person_filter_params("Colin")),
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 3, "exact, leading, and middle positions match; 'Colinette' does not");
    }

    #[test]
    fn test_unique_violation_detection() {
        let store = test_utils::test_store();
        let insert = |tx: &rusqlite::Transaction| -> Result<(), StoreError> {
            tx.execute(
                "INSERT INTO events (id, fingerprint, source_message_id, pack_id, created_at, updated_at)
                 VALUES ('e1', 'fp', 'm', 'p', '2026-01-01', '2026-01-01')",
                [],
            )?;
            Ok(())
        };
        store.with_tx(|tx| insert(tx)).unwrap();
        let err = store
            .with_tx(|tx| {
                tx.execute(
                    "INSERT INTO events (id, fingerprint, source_message_id, pack_id, created_at, updated_at)
                     VALUES ('e2', 'fp', 'm', 'p', '2026-01-01', '2026-01-01')",
                    [],
                )?;
                Ok(())
            })
            .unwrap_err();
        assert!(err.is_unique_violation());
    }
}
