//! Schema migration framework.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`
//! and applied in order, tracked by the `schema_migrations` table. Each
//! migration carries a paired down script so `rollback` can walk the schema
//! back to any version; re-applying reaches the same schema.

use rusqlite::Connection;

use super::StoreError;

struct Migration {
    version: i32,
    name: &'static str,
    up: &'static str,
    down: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "baseline",
        up: include_str!("migrations/001_baseline.sql"),
        down: include_str!("migrations/001_baseline.down.sql"),
    },
    Migration {
        version: 2,
        name: "forwarded_messages",
        up: include_str!("migrations/002_forwarded_messages.sql"),
        down: include_str!("migrations/002_forwarded_messages.down.sql"),
    },
    Migration {
        version: 3,
        name: "audit_indexes",
        up: include_str!("migrations/003_audit_indexes.sql"),
        down: include_str!("migrations/003_audit_indexes.down.sql"),
    },
];

/// Highest migration version this binary knows about.
pub fn latest_version() -> i32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

fn ensure_migrations_table(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;
    Ok(())
}

/// Return the highest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> Result<i32, StoreError> {
    ensure_migrations_table(conn)?;
    let version = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;
    Ok(version)
}

/// Back up the database before applying migrations.
///
/// Uses SQLite's online backup API to create a hot copy at
/// `<db_path>.pre-migration.bak`. Skipped for in-memory databases.
fn backup_before_migration(conn: &Connection) -> Result<(), StoreError> {
    let db_path: String = conn.query_row("PRAGMA database_list", [], |row| row.get(2))?;

    if db_path.is_empty() || db_path == ":memory:" {
        return Ok(());
    }

    let backup_path = format!("{db_path}.pre-migration.bak");
    let mut backup_conn = Connection::open(&backup_path)?;
    let backup = rusqlite::backup::Backup::new(conn, &mut backup_conn)?;
    backup.step(-1)?;

    log::info!("Pre-migration backup created at {backup_path}");
    Ok(())
}

/// Run all pending migrations up to `target` (or the latest when `None`).
///
/// Returns the number of migrations applied (0 if already up-to-date).
/// Idempotent: a second call applies nothing.
pub fn run_migrations(conn: &Connection, target: Option<i32>) -> Result<usize, StoreError> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let max_known = latest_version();
    let target = target.unwrap_or(max_known);

    if current > max_known {
        return Err(StoreError::Migration(format!(
            "database schema version ({current}) is newer than this binary supports ({max_known}); \
             update hearth"
        )));
    }
    if target > max_known {
        return Err(StoreError::Migration(format!(
            "unknown target version {target} (highest known is {max_known})"
        )));
    }

    let pending: Vec<&Migration> = MIGRATIONS
        .iter()
        .filter(|m| m.version > current && m.version <= target)
        .collect();

    if pending.is_empty() {
        return Ok(0);
    }

    backup_before_migration(conn)?;

    for migration in &pending {
        conn.execute_batch(migration.up).map_err(|e| {
            StoreError::Migration(format!("migration v{} failed: {e}", migration.version))
        })?;
        conn.execute(
            "INSERT INTO schema_migrations (version, name) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.name],
        )?;
        log::info!("Applied migration v{} ({})", migration.version, migration.name);
    }

    Ok(pending.len())
}

/// Roll the schema back to `target` by running down scripts in reverse.
///
/// `target = 0` drops everything. Returns the number of migrations undone.
pub fn rollback_to(conn: &Connection, target: i32) -> Result<usize, StoreError> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    if target >= current {
        return Ok(0);
    }
    if target < 0 {
        return Err(StoreError::Migration(format!(
            "invalid rollback target {target}"
        )));
    }

    backup_before_migration(conn)?;

    let to_undo: Vec<&Migration> = MIGRATIONS
        .iter()
        .rev()
        .filter(|m| m.version > target && m.version <= current)
        .collect();

    for migration in &to_undo {
        conn.execute_batch(migration.down).map_err(|e| {
            StoreError::Migration(format!("rollback of v{} failed: {e}", migration.version))
        })?;
        conn.execute(
            "DELETE FROM schema_migrations WHERE version = ?1",
            [migration.version],
        )?;
        log::info!(
            "Rolled back migration v{} ({})",
            migration.version,
            migration.name
        );
    }

    Ok(to_undo.len())
}
