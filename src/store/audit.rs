//! Append-only audit trail.
//!
//! Every state transition writes one row, inside the same transaction as
//! the state change, so audit order reflects commit order.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use super::{to_ts, ts_col, Store, StoreError};
use crate::types::{AuditEntry, AuditLevel};

pub(crate) fn insert_audit(conn: &Connection, entry: &AuditEntry) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO audit_log
            (timestamp, level, module, action, details, message_id, event_fingerprint, user_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            to_ts(&entry.timestamp),
            entry.level.as_str(),
            entry.module,
            entry.action,
            serde_json::to_string(&entry.details)?,
            entry.message_id,
            entry.event_fingerprint,
            entry.user_id,
        ],
    )?;
    Ok(())
}

impl Store {
    pub fn insert_audit_log(&self, entry: &AuditEntry) -> Result<(), StoreError> {
        self.with_conn(|conn| insert_audit(conn, entry))
    }

    /// Audit rows at or above `min_level` within `[start, end]`,
    /// oldest first. Feeds the digest's error section.
    pub fn list_audit_entries(
        &self,
        min_level: AuditLevel,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<AuditEntry>, StoreError> {
        let levels: Vec<&str> = [
            AuditLevel::Debug,
            AuditLevel::Info,
            AuditLevel::Warning,
            AuditLevel::Error,
        ]
        .iter()
        .filter(|l| **l >= min_level)
        .map(|l| l.as_str())
        .collect();

        self.with_conn(|conn| {
            let placeholders: Vec<&str> = levels.iter().map(|_| "?").collect();
            let sql = format!(
                "SELECT timestamp, level, module, action, details, message_id, event_fingerprint, user_id
                 FROM audit_log
                 WHERE level IN ({}) AND timestamp >= ? AND timestamp <= ?
                 ORDER BY timestamp ASC",
                placeholders.join(", ")
            );
            let mut binds: Vec<String> = levels.iter().map(|l| l.to_string()).collect();
            binds.push(to_ts(&start));
            binds.push(to_ts(&end));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(binds), |row| {
                let details: String = row.get(4)?;
                Ok(AuditEntry {
                    timestamp: ts_col(0, row.get(0)?)?,
                    level: AuditLevel::parse(&row.get::<_, String>(1)?),
                    module: row.get(2)?,
                    action: row.get(3)?,
                    details: serde_json::from_str(&details)
                        .unwrap_or(serde_json::Value::Null),
                    message_id: row.get(5)?,
                    event_fingerprint: row.get(6)?,
                    user_id: row.get(7)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }
}
