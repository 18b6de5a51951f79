//! Single-use approval tokens for calendar operations.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{opt_ts_col, to_ts, ts_col, Store, StoreError};
use crate::types::ApprovalToken;

/// Default token lifetime.
pub const TOKEN_TTL_HOURS: i64 = 2;

impl Store {
    /// Mint a token for an operation. INSERT OR IGNORE: re-minting the same
    /// token id is a no-op.
    pub fn insert_approval_token(&self, token: &ApprovalToken) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let rows = conn.execute(
                "INSERT OR IGNORE INTO approval_tokens
                    (id, operation_id, created_at, expires_at, approved, approved_at, used)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    token.id,
                    token.operation_id,
                    to_ts(&token.created_at),
                    to_ts(&token.expires_at),
                    token.approved as i64,
                    token.approved_at.as_ref().map(to_ts),
                    token.used as i64,
                ],
            )?;
            Ok(rows > 0)
        })
    }

    pub fn get_approval_token(&self, id: &str) -> Result<Option<ApprovalToken>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT id, operation_id, created_at, expires_at, approved, approved_at, used
                     FROM approval_tokens WHERE id = ?1",
                    [id],
                    |row| {
                        Ok(ApprovalToken {
                            id: row.get(0)?,
                            operation_id: row.get(1)?,
                            created_at: ts_col(2, row.get(2)?)?,
                            expires_at: ts_col(3, row.get(3)?)?,
                            approved: row.get::<_, i64>(4)? != 0,
                            approved_at: opt_ts_col(5, row.get(5)?)?,
                            used: row.get::<_, i64>(6)? != 0,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Consume a token: mark it approved and used. Fails if the token is
    /// missing, expired, or already used — single-use is enforced here.
    pub fn redeem_approval_token(&self, id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        let token = self
            .get_approval_token(id)?
            .ok_or_else(|| StoreError::Integrity(format!("unknown approval token {id}")))?;
        if token.used {
            return Err(StoreError::Integrity(format!(
                "approval token {id} already used"
            )));
        }
        if token.expires_at < now {
            return Err(StoreError::Integrity(format!(
                "approval token {id} expired"
            )));
        }
        self.with_tx(|tx| {
            tx.execute(
                "UPDATE approval_tokens SET approved = 1, approved_at = ?2, used = 1 WHERE id = ?1",
                params![id, to_ts(&now)],
            )?;
            Ok(())
        })
    }

    /// Delete tokens created before `cutoff`. Returns the count removed.
    pub fn cleanup_expired_tokens(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM approval_tokens WHERE created_at < ?1",
                [to_ts(&cutoff)],
            )?)
        })
    }
}
