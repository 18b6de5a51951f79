//! Read-only projection of stored items into dashboard sections.
//!
//! Five queries: obligations, tasks, announcements, updates, catch-up. All
//! exclude dismissed items via a left join, accept an optional pack and
//! person (multi-person assignments match under any member's view), and
//! never consult the run mode.

use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde::Serialize;

use crate::store::{
    item_from_row, person_filter_params, person_filter_sql, Store, StoreError, ITEM_SELECT,
};
use crate::types::{Item, ItemType};

/// Time bucket for upcoming obligations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    ThisWeek,
    NextWeek,
    ThisMonth,
    Later,
}

impl TimeBucket {
    fn for_date(date: NaiveDate, today: NaiveDate) -> Self {
        let days = (date - today).num_days();
        if days <= 7 {
            Self::ThisWeek
        } else if days <= 14 {
            Self::NextWeek
        } else if days <= 30 {
            Self::ThisMonth
        } else {
            Self::Later
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObligationEntry {
    #[serde(flatten)]
    pub item: Item,
    pub effective_date: NaiveDate,
    pub bucket: TimeBucket,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObligationSections {
    pub this_week: Vec<ObligationEntry>,
    pub next_week: Vec<ObligationEntry>,
    pub this_month: Vec<ObligationEntry>,
    pub later: Vec<ObligationEntry>,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncementSections {
    pub this_week: Vec<Item>,
    pub last_week: Vec<Item>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Announcement,
    PastEvent,
    Update,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEntry {
    #[serde(flatten)]
    pub item: Item,
    pub update_type: UpdateType,
    pub effective_date: NaiveDate,
}

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchUpSections {
    pub past_obligations: Vec<Item>,
    pub aged_announcements: Vec<Item>,
}

/// Optional filters shared by every dashboard query.
#[derive(Debug, Default, Clone, Copy)]
pub struct Filter<'a> {
    pub pack_id: Option<&'a str>,
    pub person: Option<&'a str>,
}

// ============================================================================
// Shared query plumbing
// ============================================================================

fn qualified_columns() -> String {
    ITEM_SELECT
        .split(", ")
        .map(|c| format!("items.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Fetch items matching `where_clause` (over the `items` table), excluding
/// anything with a dismissal row.
fn query_items(
    store: &Store,
    filter: Filter<'_>,
    where_clause: &str,
    order_by: &str,
    mut binds: Vec<String>,
) -> Result<Vec<Item>, StoreError> {
    let mut sql = format!(
        "SELECT {} FROM items
         LEFT JOIN dismissed_items d ON d.item_id = items.id
         WHERE d.id IS NULL AND ({where_clause})",
        qualified_columns()
    );
    if let Some(pack_id) = filter.pack_id {
        sql.push_str(" AND items.pack_id = ?");
        binds.push(pack_id.to_string());
    }
    if let Some(person) = filter.person {
        sql.push_str(&format!(" AND {}", person_filter_sql("items.person")));
        binds.extend(person_filter_params(person));
    }
    sql.push_str(&format!(" ORDER BY {order_by}"));

    store.with_conn(|conn| {
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(binds), item_from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    })
}

/// The date of a future event extracted from this item's message, if any.
fn event_date_for_message(
    store: &Store,
    message_id: &str,
    on_or_after: NaiveDate,
) -> Result<Option<NaiveDate>, StoreError> {
    store.with_conn(|conn| {
        let found: Option<String> = conn
            .query_row(
                "SELECT json_extract(event_intent, '$.date') FROM events
                 WHERE source_message_id = ?1
                   AND json_extract(event_intent, '$.date') >= ?2
                 ORDER BY json_extract(event_intent, '$.date') ASC
                 LIMIT 1",
                rusqlite::params![message_id, on_or_after.format("%Y-%m-%d").to_string()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.and_then(|d| NaiveDate::parse_from_str(&d, "%Y-%m-%d").ok()))
    })
}

fn iso(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

// ============================================================================
// Sections
// ============================================================================

/// Upcoming obligations: dated obligations from today forward, plus items
/// whose extracted event starts in the future. Grouped by time bucket,
/// sorted by date within each.
pub fn obligations(
    store: &Store,
    filter: Filter<'_>,
    today: NaiveDate,
) -> Result<ObligationSections, StoreError> {
    let rows = query_items(
        store,
        filter,
        "(items.item_type = 'obligation' AND items.obligation_date >= ?)
         OR EXISTS (
             SELECT 1 FROM events e
             WHERE e.source_message_id = items.message_id
               AND json_extract(e.event_intent, '$.date') >= ?
         )",
        "items.obligation_date ASC, items.created_at ASC",
        vec![iso(today), iso(today)],
    )?;

    let mut sections = ObligationSections::default();
    let mut entries = Vec::new();
    for item in rows {
        let effective_date = match item.obligation_date.filter(|d| *d >= today) {
            Some(date) => date,
            None => match event_date_for_message(store, &item.message_id, today)? {
                Some(date) => date,
                None => continue,
            },
        };
        entries.push(ObligationEntry {
            bucket: TimeBucket::for_date(effective_date, today),
            effective_date,
            item,
        });
    }
    entries.sort_by_key(|e| e.effective_date);

    for entry in entries {
        match entry.bucket {
            TimeBucket::ThisWeek => sections.this_week.push(entry),
            TimeBucket::NextWeek => sections.next_week.push(entry),
            TimeBucket::ThisMonth => sections.this_month.push(entry),
            TimeBucket::Later => sections.later.push(entry),
        }
    }
    Ok(sections)
}

/// Date-less obligations from the last 30 days, newest first.
pub fn tasks(
    store: &Store,
    filter: Filter<'_>,
    today: NaiveDate,
) -> Result<Vec<Item>, StoreError> {
    let cutoff = today - chrono::Duration::days(30);
    query_items(
        store,
        filter,
        "items.item_type = 'obligation'
         AND items.obligation_date IS NULL
         AND date(items.created_at) >= ?",
        "items.created_at DESC",
        vec![iso(cutoff)],
    )
}

/// Non-obligations from the last 7 days, split at the 2-day mark.
pub fn announcements(
    store: &Store,
    filter: Filter<'_>,
    today: NaiveDate,
) -> Result<AnnouncementSections, StoreError> {
    let cutoff = today - chrono::Duration::days(7);
    let rows = query_items(
        store,
        filter,
        "items.item_type != 'obligation' AND date(items.created_at) >= ?",
        "items.created_at DESC",
        vec![iso(cutoff)],
    )?;

    let recent_cutoff = today - chrono::Duration::days(2);
    let mut sections = AnnouncementSections::default();
    for item in rows {
        if item.created_at.date_naive() >= recent_cutoff {
            sections.this_week.push(item);
        } else {
            sections.last_week.push(item);
        }
    }
    Ok(sections)
}

/// Merged primary-dashboard view: announcements and past obligations from
/// the last 14 days, labeled and sorted by effective date, newest first.
pub fn updates(
    store: &Store,
    filter: Filter<'_>,
    today: NaiveDate,
) -> Result<Vec<UpdateEntry>, StoreError> {
    let cutoff = today - chrono::Duration::days(14);
    let rows = query_items(
        store,
        filter,
        "(items.item_type != 'obligation' AND date(items.created_at) >= ?)
         OR (items.item_type = 'obligation'
             AND items.obligation_date < ?
             AND items.obligation_date >= ?)",
        "items.created_at DESC",
        vec![iso(cutoff), iso(today), iso(cutoff)],
    )?;

    let mut entries: Vec<UpdateEntry> = rows
        .into_iter()
        .map(|item| {
            let (update_type, effective_date) = match item.item_type {
                ItemType::Obligation => (
                    UpdateType::PastEvent,
                    item.obligation_date.unwrap_or_else(|| item.created_at.date_naive()),
                ),
                ItemType::Announcement => (UpdateType::Announcement, item.created_at.date_naive()),
                ItemType::Unknown => (UpdateType::Update, item.created_at.date_naive()),
            };
            UpdateEntry {
                item,
                update_type,
                effective_date,
            }
        })
        .collect();
    entries.sort_by(|a, b| b.effective_date.cmp(&a.effective_date));
    Ok(entries)
}

/// Items that aged out of the live views: obligations whose date passed in
/// the last `days_back` days, and announcements aged 7–14 days.
pub fn catch_up(
    store: &Store,
    filter: Filter<'_>,
    today: NaiveDate,
    days_back: i64,
) -> Result<CatchUpSections, StoreError> {
    let window_start = today - chrono::Duration::days(days_back);
    let past_obligations = query_items(
        store,
        filter,
        "items.item_type = 'obligation'
         AND ((items.obligation_date < ? AND items.obligation_date >= ?)
              OR EXISTS (
                  SELECT 1 FROM events e
                  WHERE e.source_message_id = items.message_id
                    AND json_extract(e.event_intent, '$.date') < ?
                    AND json_extract(e.event_intent, '$.date') >= ?
              ))",
        "items.obligation_date DESC",
        vec![iso(today), iso(window_start), iso(today), iso(window_start)],
    )?;

    let aged_start = today - chrono::Duration::days(14);
    let aged_end = today - chrono::Duration::days(7);
    let aged_announcements = query_items(
        store,
        filter,
        "items.item_type != 'obligation'
         AND date(items.created_at) >= ? AND date(items.created_at) <= ?",
        "items.created_at DESC",
        vec![iso(aged_start), iso(aged_end)],
    )?;

    Ok(CatchUpSections {
        past_obligations,
        aged_announcements,
    })
}
