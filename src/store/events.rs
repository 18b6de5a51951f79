//! Event rows and the calendar-operation queue.
//!
//! Events are deduplicated across runs by fingerprint: a deterministic
//! digest of source message id + normalized title + date + time.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use super::{opt_ts_col, to_ts, ts_col, Store, StoreError};
use crate::types::{
    CalendarOperation, EventIntent, EventRecord, EventStatus, OperationStatus, OperationType,
    Provenance, ProvenanceMethod,
};

/// Deterministic fingerprint for event dedup.
///
/// The title is normalized (lowercased, alphanumerics only, single spaces)
/// so cosmetic subject edits don't defeat deduplication.
pub fn event_fingerprint(message_id: &str, title: &str, date: &str, time: &str) -> String {
    let normalized: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");

    let mut hasher = Sha256::new();
    hasher.update(message_id.as_bytes());
    hasher.update(b"|");
    hasher.update(normalized.as_bytes());
    hasher.update(b"|");
    hasher.update(date.as_bytes());
    hasher.update(b"|");
    hasher.update(time.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventRecord> {
    let intent: String = row.get(5)?;
    let provenance: String = row.get(12)?;
    Ok(EventRecord {
        id: row.get(0)?,
        fingerprint: row.get(1)?,
        source_message_id: row.get(2)?,
        pack_id: row.get(3)?,
        calendar_event_id: row.get(4)?,
        event_intent: serde_json::from_str(&intent).unwrap_or_default(),
        confidence: row.get(6)?,
        status: EventStatus::parse(&row.get::<_, String>(7)?),
        created_at: ts_col(8, row.get(8)?)?,
        updated_at: ts_col(9, row.get(9)?)?,
        last_synced_at: opt_ts_col(10, row.get(10)?)?,
        manually_edited: row.get::<_, i64>(11)? != 0,
        provenance: serde_json::from_str(&provenance).unwrap_or(Provenance {
            method: ProvenanceMethod::Text,
            confidence_reasons: vec![],
            assumptions: vec![],
            source_email_permalink: String::new(),
            extracted_at: Utc::now(),
        }),
    })
}

const EVENT_SELECT: &str = "id, fingerprint, source_message_id, pack_id, calendar_event_id, \
     event_intent, confidence, status, created_at, updated_at, last_synced_at, \
     manually_edited, provenance";

/// Field-level patch for `update_event`. `None` leaves the column alone.
#[derive(Debug, Default)]
pub struct EventPatch {
    pub status: Option<EventStatus>,
    pub calendar_event_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub manually_edited: Option<bool>,
}

impl Store {
    /// Insert an event. A duplicate fingerprint propagates as a unique
    /// violation; a missing fingerprint is an integrity defect.
    pub fn insert_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        if event.fingerprint.trim().is_empty() {
            return Err(StoreError::Integrity(format!(
                "event {} has no fingerprint",
                event.id
            )));
        }
        self.with_tx(|tx| insert_event(tx, event))
    }

    pub fn get_event_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<EventRecord>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {EVENT_SELECT} FROM events WHERE fingerprint = ?1"),
                    [fingerprint],
                    row_to_event,
                )
                .optional()?)
        })
    }

    pub fn update_event(&self, fingerprint: &str, patch: &EventPatch) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let rows = tx.execute(
                "UPDATE events SET
                    status = COALESCE(?2, status),
                    calendar_event_id = COALESCE(?3, calendar_event_id),
                    last_synced_at = COALESCE(?4, last_synced_at),
                    manually_edited = COALESCE(?5, manually_edited),
                    updated_at = ?6
                 WHERE fingerprint = ?1",
                params![
                    fingerprint,
                    patch.status.map(|s| s.as_str()),
                    patch.calendar_event_id,
                    patch.last_synced_at.as_ref().map(to_ts),
                    patch.manually_edited.map(|b| b as i64),
                    to_ts(&Utc::now()),
                ],
            )?;
            if rows == 0 {
                return Err(StoreError::Integrity(format!(
                    "update for unknown event fingerprint {fingerprint}"
                )));
            }
            Ok(())
        })
    }

    /// Events whose intent date falls within ±`window_days` of `date_key`,
    /// excluding the reference fingerprint itself.
    pub fn find_duplicate_events(
        &self,
        fingerprint: &str,
        date_key: NaiveDate,
        window_days: i64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let start = date_key - chrono::Duration::days(window_days);
        let end = date_key + chrono::Duration::days(window_days);
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EVENT_SELECT} FROM events
                 WHERE fingerprint != ?1
                   AND json_extract(event_intent, '$.date') BETWEEN ?2 AND ?3"
            ))?;
            let rows = stmt.query_map(
                params![
                    fingerprint,
                    start.format("%Y-%m-%d").to_string(),
                    end.format("%Y-%m-%d").to_string(),
                ],
                row_to_event,
            )?;
            let mut events = Vec::new();
            for row in rows {
                events.push(row?);
            }
            Ok(events)
        })
    }

    pub fn insert_calendar_operation(&self, op: &CalendarOperation) -> Result<(), StoreError> {
        if op.event_fingerprint.trim().is_empty() {
            return Err(StoreError::Integrity(format!(
                "operation {} has no event fingerprint",
                op.id
            )));
        }
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO calendar_operations
                    (id, op_type, event_fingerprint, event_intent, reason, requires_approval,
                     status, executed_at, calendar_event_id, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    op.id,
                    op.op_type.as_str(),
                    op.event_fingerprint,
                    serde_json::to_string(&op.event_intent)?,
                    op.reason,
                    op.requires_approval as i64,
                    op.status.as_str(),
                    op.executed_at.as_ref().map(to_ts),
                    op.calendar_event_id,
                    op.error,
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_calendar_operation(
        &self,
        id: &str,
        status: OperationStatus,
        executed_at: Option<DateTime<Utc>>,
        calendar_event_id: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let rows = tx.execute(
                "UPDATE calendar_operations SET
                    status = ?2,
                    executed_at = COALESCE(?3, executed_at),
                    calendar_event_id = COALESCE(?4, calendar_event_id),
                    error = ?5
                 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    executed_at.as_ref().map(to_ts),
                    calendar_event_id,
                    error,
                ],
            )?;
            if rows == 0 {
                return Err(StoreError::Integrity(format!(
                    "update for unknown operation {id}"
                )));
            }
            Ok(())
        })
    }

    pub fn get_pending_operations(&self) -> Result<Vec<CalendarOperation>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, op_type, event_fingerprint, event_intent, reason, requires_approval,
                        status, executed_at, calendar_event_id, error
                 FROM calendar_operations WHERE status = 'pending'",
            )?;
            let rows = stmt.query_map([], |row| {
                let intent: String = row.get(3)?;
                Ok(CalendarOperation {
                    id: row.get(0)?,
                    op_type: OperationType::parse(&row.get::<_, String>(1)?),
                    event_fingerprint: row.get(2)?,
                    event_intent: serde_json::from_str(&intent).unwrap_or_default(),
                    reason: row.get(4)?,
                    requires_approval: row.get::<_, i64>(5)? != 0,
                    status: OperationStatus::parse(&row.get::<_, String>(6)?),
                    executed_at: opt_ts_col(7, row.get(7)?)?,
                    calendar_event_id: row.get(8)?,
                    error: row.get(9)?,
                })
            })?;
            let mut ops = Vec::new();
            for row in rows {
                ops.push(row?);
            }
            Ok(ops)
        })
    }
}

fn insert_event(conn: &Connection, event: &EventRecord) -> Result<(), StoreError> {
    conn.execute(
        &format!("INSERT INTO events ({EVENT_SELECT}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"),
        params![
            event.id,
            event.fingerprint,
            event.source_message_id,
            event.pack_id,
            event.calendar_event_id,
            serde_json::to_string(&event.event_intent)?,
            event.confidence,
            event.status.as_str(),
            to_ts(&event.created_at),
            to_ts(&event.updated_at),
            event.last_synced_at.as_ref().map(to_ts),
            event.manually_edited as i64,
            serde_json::to_string(&event.provenance)?,
        ],
    )?;
    Ok(())
}
