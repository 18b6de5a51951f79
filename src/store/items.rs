//! Item rows: the unified obligation/announcement entity.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{opt_ts_col, to_ts, ts_col, Store, StoreError};
use crate::types::{AssignmentReason, Category, Classification, Item, ItemType};

/// Column list shared by every item query; `item_from_row` indexes into it.
pub(crate) const ITEM_SELECT: &str = "id, message_id, pack_id, subject, from_name, from_email, \
     snippet, email_body_text, email_body_html, relevance_score, primary_category, \
     secondary_categories, category_scores, save_reasons, person, assignment_reason, \
     item_type, obligation_date, classification_confidence, classification_reasoning, \
     classified_at, approved, approved_at, created_at";

pub(crate) fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Item> {
    let secondary: String = row.get(11)?;
    let scores: String = row.get(12)?;
    let reasons: String = row.get(13)?;
    let obligation_date: Option<String> = row.get(17)?;

    let secondary_categories: Vec<String> = serde_json::from_str(&secondary).unwrap_or_default();

    Ok(Item {
        id: row.get(0)?,
        message_id: row.get(1)?,
        pack_id: row.get(2)?,
        subject: row.get(3)?,
        from_name: row.get(4)?,
        from_email: row.get(5)?,
        snippet: row.get(6)?,
        email_body_text: row.get(7)?,
        email_body_html: row.get(8)?,
        relevance_score: row.get(9)?,
        primary_category: Category::parse(&row.get::<_, String>(10)?)
            .unwrap_or(Category::CommunityOptional),
        secondary_categories: secondary_categories
            .iter()
            .filter_map(|s| Category::parse(s))
            .collect(),
        category_scores: serde_json::from_str(&scores).unwrap_or_default(),
        save_reasons: serde_json::from_str(&reasons).unwrap_or_default(),
        person: row.get(14)?,
        assignment_reason: AssignmentReason::parse(&row.get::<_, String>(15)?),
        item_type: ItemType::parse(&row.get::<_, String>(16)?),
        obligation_date: obligation_date.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()),
        classification_confidence: row.get(18)?,
        classification_reasoning: row.get(19)?,
        classified_at: opt_ts_col(20, row.get(20)?)?,
        approved: row.get::<_, i64>(21)? != 0,
        approved_at: opt_ts_col(22, row.get(22)?)?,
        created_at: ts_col(23, row.get(23)?)?,
    })
}

/// Insert an item. Rejects an item whose message has no terminal decision —
/// every item must hang off a processed message.
pub(crate) fn insert_item(conn: &Connection, item: &Item) -> Result<(), StoreError> {
    let has_message: bool = conn
        .prepare("SELECT 1 FROM processed_messages WHERE message_id = ?1")?
        .exists([&item.message_id])?;
    if !has_message {
        return Err(StoreError::Integrity(format!(
            "item {} references unprocessed message {}",
            item.id, item.message_id
        )));
    }

    let secondary: Vec<&str> = item
        .secondary_categories
        .iter()
        .map(|c| c.as_str())
        .collect();

    conn.execute(
        &format!("INSERT INTO items ({ITEM_SELECT}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)"),
        params![
            item.id,
            item.message_id,
            item.pack_id,
            item.subject,
            item.from_name,
            item.from_email,
            item.snippet,
            item.email_body_text,
            item.email_body_html,
            item.relevance_score,
            item.primary_category.as_str(),
            serde_json::to_string(&secondary)?,
            serde_json::to_string(&item.category_scores)?,
            serde_json::to_string(&item.save_reasons)?,
            item.person,
            item.assignment_reason.as_str(),
            item.item_type.as_str(),
            item.obligation_date.map(|d| d.format("%Y-%m-%d").to_string()),
            item.classification_confidence,
            item.classification_reasoning,
            item.classified_at.as_ref().map(to_ts),
            item.approved as i64,
            item.approved_at.as_ref().map(to_ts),
            to_ts(&item.created_at),
        ],
    )?;
    Ok(())
}

impl Store {
    pub fn insert_item(&self, item: &Item) -> Result<(), StoreError> {
        self.with_tx(|tx| insert_item(tx, item))
    }

    pub fn get_item_by_id(&self, id: &str) -> Result<Option<Item>, StoreError> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {ITEM_SELECT} FROM items WHERE id = ?1"),
                    [id],
                    item_from_row,
                )
                .optional()?)
        })
    }

    /// Items awaiting approval, optionally scoped to one pack.
    pub fn list_pending_items(&self, pack_id: Option<&str>) -> Result<Vec<Item>, StoreError> {
        self.with_conn(|conn| {
            let sql = match pack_id {
                Some(_) => format!(
                    "SELECT {ITEM_SELECT} FROM items WHERE approved = 0 AND pack_id = ?1 \
                     ORDER BY created_at DESC"
                ),
                None => format!(
                    "SELECT {ITEM_SELECT} FROM items WHERE approved = 0 ORDER BY created_at DESC"
                ),
            };
            let mut stmt = conn.prepare(&sql)?;
            let rows = match pack_id {
                Some(id) => stmt.query_map([id], item_from_row)?,
                None => stmt.query_map([], item_from_row)?,
            };
            let mut items = Vec::new();
            for row in rows {
                items.push(row?);
            }
            Ok(items)
        })
    }

    /// Fill classification fields that are still null. Existing values are
    /// never rewritten; a changed obligation date requires a fresh
    /// classification event on a fresh item.
    pub fn apply_classification(
        &self,
        item_id: &str,
        classification: &Classification,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let rows = tx.execute(
                "UPDATE items SET
                    item_type = CASE WHEN item_type = 'unknown' THEN ?2 ELSE item_type END,
                    obligation_date = COALESCE(obligation_date, ?3),
                    classification_confidence = COALESCE(classification_confidence, ?4),
                    classification_reasoning = COALESCE(classification_reasoning, ?5),
                    classified_at = ?6
                 WHERE id = ?1",
                params![
                    item_id,
                    classification.item_type.as_str(),
                    classification
                        .obligation_date
                        .map(|d| d.format("%Y-%m-%d").to_string()),
                    classification.confidence,
                    classification.reasoning,
                    to_ts(&now),
                ],
            )?;
            if rows == 0 {
                return Err(StoreError::Integrity(format!(
                    "classification for unknown item {item_id}"
                )));
            }
            Ok(())
        })
    }

    pub fn approve_item(&self, item_id: &str, now: DateTime<Utc>) -> Result<(), StoreError> {
        self.with_tx(|tx| {
            let rows = tx.execute(
                "UPDATE items SET approved = 1, approved_at = ?2 WHERE id = ?1",
                params![item_id, to_ts(&now)],
            )?;
            if rows == 0 {
                return Err(StoreError::Integrity(format!(
                    "approval for unknown item {item_id}"
                )));
            }
            Ok(())
        })
    }
}


#[cfg(test)]
mod tests {
    use super::super::test_utils::test_store;
    use super::test_fixtures::{sample_item, seed_message};
    use super::*;

    #[test]
    fn test_insert_and_fetch_roundtrip() {
        let store = test_store();
        seed_message(&store, "m1");
        store.insert_item(&sample_item("i1", "m1")).unwrap();

        let item = store.get_item_by_id("i1").unwrap().unwrap();
        assert_eq!(item.subject, "Permission slip due Friday");
        assert_eq!(item.primary_category, Category::FormsAdmin);
        assert_eq!(item.secondary_categories, vec![Category::School]);
        assert_eq!(item.item_type, ItemType::Unknown);
        assert!(!item.approved);
    }

    #[test]
    fn test_item_without_processed_message_rejected() {
        let store = test_store();
        let err = store.insert_item(&sample_item("i1", "ghost")).unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
        assert!(store.get_item_by_id("i1").unwrap().is_none());
    }

    #[test]
    fn test_apply_classification_fills_nulls_only() {
        let store = test_store();
        seed_message(&store, "m1");
        store.insert_item(&sample_item("i1", "m1")).unwrap();

        let first = Classification {
            item_type: ItemType::Obligation,
            obligation_date: NaiveDate::from_ymd_opt(2026, 1, 15),
            confidence: Some(0.9),
            reasoning: Some("due date in subject".into()),
        };
        store.apply_classification("i1", &first, Utc::now()).unwrap();

        let item = store.get_item_by_id("i1").unwrap().unwrap();
        assert_eq!(item.item_type, ItemType::Obligation);
        assert_eq!(item.obligation_date, NaiveDate::from_ymd_opt(2026, 1, 15));

        // A later pass must not rewrite what is already set
        let second = Classification {
            item_type: ItemType::Announcement,
            obligation_date: NaiveDate::from_ymd_opt(2027, 6, 1),
            confidence: Some(0.1),
            reasoning: Some("revised".into()),
        };
        store.apply_classification("i1", &second, Utc::now()).unwrap();

        let item = store.get_item_by_id("i1").unwrap().unwrap();
        assert_eq!(item.item_type, ItemType::Obligation);
        assert_eq!(item.obligation_date, NaiveDate::from_ymd_opt(2026, 1, 15));
        assert_eq!(item.classification_confidence, Some(0.9));
    }

    #[test]
    fn test_classification_for_unknown_item_rejected() {
        let store = test_store();
        let err = store
            .apply_classification("missing", &Classification::unknown(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[test]
    fn test_approval_for_unknown_item_rejected() {
        let store = test_store();
        let err = store.approve_item("missing", Utc::now()).unwrap_err();
        assert!(matches!(err, StoreError::Integrity(_)));
    }

    #[test]
    fn test_list_pending_filters_pack_and_approval() {
        let store = test_store();
        seed_message(&store, "m1");
        store.insert_item(&sample_item("i1", "m1")).unwrap();
        let mut other = sample_item("i2", "m1");
        other.pack_id = "activities".into();
        store.insert_item(&other).unwrap();

        store.approve_item("i1", Utc::now()).unwrap();

        assert!(store.list_pending_items(Some("school")).unwrap().is_empty());
        assert_eq!(store.list_pending_items(None).unwrap().len(), 1);
        assert_eq!(
            store.list_pending_items(Some("activities")).unwrap()[0].id,
            "i2"
        );
    }
}
