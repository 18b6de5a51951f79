//! Dismissal and forwarding records.
//!
//! Dismissal is terminal and immutable: rows are never updated or deleted,
//! and dismissing the same item again writes a fresh row. The audit entry
//! lands in the same transaction as the dismissal.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use super::{audit::insert_audit, person_filter_params, person_filter_sql, to_ts, ts_col, Store, StoreError};
use crate::types::{AuditEntry, AuditLevel, DismissedItem, ForwardedMessage, ItemType};

impl Store {
    /// Write a dismissal row for an item. The reason is required; an empty
    /// reason is rejected before any SQL runs.
    pub fn dismiss_item(
        &self,
        item_id: &str,
        reason: &str,
        dismissed_by: &str,
    ) -> Result<DismissedItem, StoreError> {
        if reason.trim().is_empty() {
            return Err(StoreError::Integrity(
                "dismissal requires a non-empty reason".into(),
            ));
        }

        let item = self.get_item_by_id(item_id)?.ok_or_else(|| {
            StoreError::Integrity(format!("dismissal of unknown item {item_id}"))
        })?;

        let dismissed = DismissedItem {
            id: Uuid::new_v4().to_string(),
            item_id: item.id.clone(),
            item_type: item.item_type,
            reason: reason.to_string(),
            dismissed_at: Utc::now(),
            dismissed_by: dismissed_by.to_string(),
            original_subject: item.subject.clone(),
            original_from: item.from_email.clone(),
            original_date: item.created_at,
            person: item.person.clone(),
            pack_id: item.pack_id.clone(),
        };

        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO dismissed_items
                    (id, item_id, item_type, reason, dismissed_at, dismissed_by,
                     original_subject, original_from, original_date, person, pack_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    dismissed.id,
                    dismissed.item_id,
                    dismissed.item_type.as_str(),
                    dismissed.reason,
                    to_ts(&dismissed.dismissed_at),
                    dismissed.dismissed_by,
                    dismissed.original_subject,
                    dismissed.original_from,
                    to_ts(&dismissed.original_date),
                    dismissed.person,
                    dismissed.pack_id,
                ],
            )?;
            insert_audit(
                tx,
                &AuditEntry {
                    timestamp: dismissed.dismissed_at,
                    level: AuditLevel::Info,
                    module: "store".into(),
                    action: "dismiss_item".into(),
                    details: serde_json::json!({
                        "itemId": dismissed.item_id,
                        "reason": dismissed.reason,
                    }),
                    message_id: Some(item.message_id.clone()),
                    event_fingerprint: None,
                    user_id: Some(dismissed.dismissed_by.clone()),
                },
            )?;
            Ok(())
        })?;

        Ok(dismissed)
    }

    pub fn is_item_dismissed(&self, item_id: &str) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .prepare("SELECT 1 FROM dismissed_items WHERE item_id = ?1")?
                .exists([item_id])?)
        })
    }

    /// Dismissals within `[start, end]`, optionally filtered to one person
    /// (multi-person assignments included).
    pub fn list_dismissed_items(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        person: Option<&str>,
    ) -> Result<Vec<DismissedItem>, StoreError> {
        self.with_conn(|conn| {
            let mut sql = String::from(
                "SELECT id, item_id, item_type, reason, dismissed_at, dismissed_by,
                        original_subject, original_from, original_date, person, pack_id
                 FROM dismissed_items WHERE dismissed_at >= ? AND dismissed_at <= ?",
            );
            let mut binds: Vec<String> = vec![to_ts(&start), to_ts(&end)];
            if let Some(name) = person {
                sql.push_str(&format!(" AND {}", person_filter_sql("person")));
                binds.extend(person_filter_params(name));
            }
            sql.push_str(" ORDER BY dismissed_at DESC");

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(binds), |row| {
                Ok(DismissedItem {
                    id: row.get(0)?,
                    item_id: row.get(1)?,
                    item_type: ItemType::parse(&row.get::<_, String>(2)?),
                    reason: row.get(3)?,
                    dismissed_at: ts_col(4, row.get(4)?)?,
                    dismissed_by: row.get(5)?,
                    original_subject: row.get(6)?,
                    original_from: row.get(7)?,
                    original_date: ts_col(8, row.get(8)?)?,
                    person: row.get(9)?,
                    pack_id: row.get(10)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
    }

    pub fn insert_forwarded_message(&self, fwd: &ForwardedMessage) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO forwarded_messages
                    (id, source_message_id, forwarded_at, forwarded_to, pack_id,
                     reason, conditions, success, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    fwd.id,
                    fwd.source_message_id,
                    to_ts(&fwd.forwarded_at),
                    serde_json::to_string(&fwd.forwarded_to)?,
                    fwd.pack_id,
                    fwd.reason,
                    fwd.conditions,
                    fwd.success as i64,
                    fwd.error,
                ],
            )?;
            Ok(())
        })
    }

    pub fn list_forwarded_messages(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ForwardedMessage>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, source_message_id, forwarded_at, forwarded_to, pack_id,
                        reason, conditions, success, error
                 FROM forwarded_messages
                 WHERE forwarded_at >= ?1 AND forwarded_at <= ?2
                 ORDER BY forwarded_at DESC",
            )?;
            let rows = stmt.query_map(params![to_ts(&start), to_ts(&end)], |row| {
                let to: String = row.get(3)?;
                Ok(ForwardedMessage {
                    id: row.get(0)?,
                    source_message_id: row.get(1)?,
                    forwarded_at: ts_col(2, row.get(2)?)?,
                    forwarded_to: serde_json::from_str(&to).unwrap_or_default(),
                    pack_id: row.get(4)?,
                    reason: row.get(5)?,
                    conditions: row.get(6)?,
                    success: row.get::<_, i64>(7)? != 0,
                    error: row.get(8)?,
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
