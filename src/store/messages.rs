//! Processed-message rows: the deduplication source of truth.

use rusqlite::{params, Connection, OptionalExtension};

use super::{to_ts, ts_col, Store, StoreError};
use crate::types::{ExtractionStatus, ProcessedMessage};

/// INSERT OR IGNORE on the natural key. Returns true if a row was written,
/// false if the message was already processed (idempotent repeat).
pub(crate) fn insert_processed_message(
    conn: &Connection,
    pm: &ProcessedMessage,
) -> Result<bool, StoreError> {
    let rows = conn.execute(
        "INSERT OR IGNORE INTO processed_messages
            (message_id, processed_at, pack_id, extraction_status, events_extracted, fingerprints, error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            pm.message_id,
            to_ts(&pm.processed_at),
            pm.pack_id,
            pm.extraction_status.as_str(),
            pm.events_extracted,
            serde_json::to_string(&pm.fingerprints)?,
            pm.error,
        ],
    )?;
    Ok(rows > 0)
}

fn row_to_processed(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProcessedMessage> {
    let fingerprints: String = row.get(5)?;
    Ok(ProcessedMessage {
        message_id: row.get(0)?,
        processed_at: ts_col(1, row.get(1)?)?,
        pack_id: row.get(2)?,
        extraction_status: ExtractionStatus::parse(&row.get::<_, String>(3)?),
        events_extracted: row.get(4)?,
        fingerprints: serde_json::from_str(&fingerprints).unwrap_or_default(),
        error: row.get(6)?,
    })
}

impl Store {
    pub fn insert_processed_message(&self, pm: &ProcessedMessage) -> Result<bool, StoreError> {
        self.with_conn(|conn| insert_processed_message(conn, pm))
    }

    pub fn get_processed_message(
        &self,
        message_id: &str,
    ) -> Result<Option<ProcessedMessage>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT message_id, processed_at, pack_id, extraction_status,
                            events_extracted, fingerprints, error
                     FROM processed_messages WHERE message_id = ?1",
                    [message_id],
                    row_to_processed,
                )
                .optional()?)
        })
    }

    pub fn count_processed_messages(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM processed_messages", [], |r| r.get(0))?)
        })
    }
}
