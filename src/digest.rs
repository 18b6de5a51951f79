//! Periodic digest: summarizes a time window into grouped, factual output.
//!
//! Every line states plain facts. The rendered text never hedges, never
//! quotes scores, and never mentions how a classification was produced —
//! the language tests at the bottom hold that line.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::classify::dates;
use crate::mail::message_permalink;
use crate::store::{item_from_row, Store, StoreError, ITEM_SELECT};
use crate::types::{AuditEntry, AuditLevel, Category, DismissedItem, ForwardedMessage, Item};
use crate::util::{html_escape, truncate_chars};

/// Cap on "This Week at a Glance" facts.
const MAX_FACTS: usize = 7;

/// Cap on a row's excerpt.
const EXCERPT_CHARS: usize = 300;

/// Confidence below this gets a review marker on the row.
const REVIEW_THRESHOLD: f64 = 0.95;

/// Digest group for a category, in relevance-priority order.
pub fn group_for(category: Category) -> &'static str {
    match category {
        Category::School => "\u{1F3EB} School Updates",
        Category::SportsActivities => "\u{26BD} Sports & Activities",
        Category::MedicalHealth => "\u{1F3E5} Medical",
        Category::FriendsSocial => "\u{1F3AD} Events & Performances",
        Category::Logistics => "\u{1F4E6} Logistics",
        Category::FormsAdmin => "\u{1F4CB} Administrative / Forms",
        Category::CommunityOptional => "\u{1F91D} Community",
        Category::FinancialBilling => "Other",
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestRow {
    pub title: String,
    pub fact: Option<String>,
    pub sender_name: String,
    pub sender_email: String,
    pub group: &'static str,
    pub needs_review: bool,
    pub excerpt: String,
    pub link: Option<String>,
    #[serde(skip)]
    category: Category,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Digest {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub dry_run: bool,
    pub created: Vec<String>,
    pub pending: Vec<DigestRow>,
    pub approved_pending: Vec<DigestRow>,
    pub forwarded: Vec<ForwardedMessage>,
    pub deferred: Vec<DigestRow>,
    pub dismissed: Vec<DismissedItem>,
    pub errors: Vec<AuditEntry>,
}

impl Digest {
    /// A quiet window: mail was handled, nothing needs the parent.
    pub fn is_quiet(&self) -> bool {
        self.created.is_empty()
            && self.pending.is_empty()
            && self.approved_pending.is_empty()
            && self.deferred.is_empty()
            && self.errors.is_empty()
    }
}

// ============================================================================
// Fact recognizers
// ============================================================================

fn parenthetical(subject: &str) -> Option<&str> {
    let open = subject.find('(')?;
    let close = subject[open..].find(')')? + open;
    Some(subject[open + 1..close].trim())
}

/// One-line fact for an item, from a fixed recognizer set. Returns None when
/// no recognizer applies; the caller falls back to the subject line.
pub fn extract_fact(subject: &str, snippet: &str, received: NaiveDate) -> Option<String> {
    let lower = format!("{} {}", subject, snippet).to_lowercase();

    if lower.contains("newsletter") {
        // "Kindergarten Weekly Newsletter (Jan 5-9)" -> "Kindergarten newsletter for Jan 5-9"
        let prefix: Vec<&str> = subject
            .split_whitespace()
            .take_while(|w| !w.to_lowercase().starts_with("newsletter"))
            .filter(|w| {
                let w = w.to_lowercase();
                w != "weekly" && w != "the" && w != "your"
            })
            .collect();
        let prefix = if prefix.is_empty() {
            "Class".to_string()
        } else {
            prefix.join(" ")
        };
        return Some(match parenthetical(subject) {
            Some(range) => format!("{prefix} newsletter for {range}"),
            None => format!("{prefix} newsletter"),
        });
    }

    if lower.contains("photo") {
        return Some("Photos available".to_string());
    }

    if lower.contains("permission slip") || lower.contains("permission form") {
        return Some(match dates::extract_date(&lower, received) {
            Some(date) => format!("Permission slip due {}", date.format("%b %-d")),
            None => "Permission slip needs signing".to_string(),
        });
    }

    if lower.contains("form") && (lower.contains("due") || lower.contains("deadline")) {
        return Some(match dates::extract_date(&lower, received) {
            Some(date) => format!("Form due {}", date.format("%b %-d")),
            None => "Form due".to_string(),
        });
    }

    if lower.contains("picture day") {
        return Some(match dates::extract_date(&lower, received) {
            Some(date) => format!("Picture day {}", date.format("%b %-d")),
            None => "Picture day scheduled".to_string(),
        });
    }

    if lower.contains("field trip") {
        return Some("Field trip coming up".to_string());
    }

    if lower.contains("early dismissal") || lower.contains("school closed") || lower.contains("no school") {
        return Some("Schedule change".to_string());
    }

    None
}

fn row_from_item(item: &Item) -> DigestRow {
    let received = item.created_at.date_naive();
    let source_text = if item.snippet.is_empty() {
        &item.email_body_text
    } else {
        &item.snippet
    };

    let link = (!item.message_id.is_empty()).then(|| message_permalink(&item.message_id));
    let excerpt = if link.is_some() {
        html_escape(&truncate_chars(source_text, EXCERPT_CHARS))
    } else {
        // No way back to the source message: keep the full excerpt
        html_escape(source_text)
    };

    DigestRow {
        title: item.subject.clone(),
        fact: extract_fact(&item.subject, &item.snippet, received),
        sender_name: item.from_name.clone(),
        sender_email: item.from_email.clone(),
        group: group_for(item.primary_category),
        needs_review: item
            .classification_confidence
            .map(|c| c < REVIEW_THRESHOLD)
            .unwrap_or(false),
        excerpt,
        link,
        category: item.primary_category,
    }
}

// ============================================================================
// Building
// ============================================================================

fn items_where(
    store: &Store,
    where_clause: &str,
    binds: Vec<String>,
) -> Result<Vec<Item>, StoreError> {
    store.with_conn(|conn| {
        let sql = format!(
            "SELECT {ITEM_SELECT} FROM items WHERE {where_clause} ORDER BY created_at DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(binds), item_from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }
        Ok(items)
    })
}

/// Build a digest over `[start, end]`.
pub fn build(
    store: &Store,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    dry_run: bool,
) -> Result<Digest, StoreError> {
    let window = vec![start.to_rfc3339(), end.to_rfc3339()];

    let created = store.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT json_extract(event_intent, '$.title'),
                    json_extract(event_intent, '$.date')
             FROM events
             WHERE status = 'created' AND updated_at >= ?1 AND updated_at <= ?2
             ORDER BY updated_at ASC",
        )?;
        let rows = stmt.query_map(rusqlite::params_from_iter(window.clone()), |row| {
            let title: Option<String> = row.get(0)?;
            let date: Option<String> = row.get(1)?;
            Ok(match date {
                Some(date) => format!("{} on {date}", title.unwrap_or_default()),
                None => title.unwrap_or_default(),
            })
        })?;
        let mut lines = Vec::new();
        for row in rows {
            lines.push(row?);
        }
        Ok(lines)
    })?;

    let pending = items_where(
        store,
        "approved = 0 AND created_at >= ? AND created_at <= ?",
        window.clone(),
    )?;
    let approved_pending = items_where(
        store,
        "approved = 1 AND approved_at >= ? AND approved_at <= ?",
        window.clone(),
    )?;
    let deferred = items_where(
        store,
        "item_type = 'obligation' AND obligation_date IS NULL
         AND created_at >= ? AND created_at <= ?",
        window.clone(),
    )?;

    let forwarded = store.list_forwarded_messages(start, end)?;
    let dismissed = store.list_dismissed_items(start, end, None)?;
    let errors = store.list_audit_entries(AuditLevel::Warning, start, end)?;

    let sort_rows = |items: &[Item]| {
        let mut rows: Vec<DigestRow> = items.iter().map(row_from_item).collect();
        rows.sort_by_key(|r| r.category);
        rows
    };

    Ok(Digest {
        start,
        end,
        dry_run,
        created,
        pending: sort_rows(&pending),
        approved_pending: sort_rows(&approved_pending),
        forwarded,
        deferred: sort_rows(&deferred),
        dismissed,
        errors,
    })
}

// ============================================================================
// Rendering
// ============================================================================

fn glance_facts(digest: &Digest) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut facts = Vec::new();
    for row in digest.pending.iter().chain(&digest.approved_pending) {
        let Some(fact) = &row.fact else { continue };
        if seen.insert(fact.to_lowercase()) {
            facts.push(fact.clone());
            if facts.len() == MAX_FACTS {
                break;
            }
        }
    }
    facts
}

fn render_rows(out: &mut String, rows: &[DigestRow]) {
    let mut current_group: Option<&str> = None;
    for row in rows {
        if current_group != Some(row.group) {
            out.push_str(&format!("\n{}\n", row.group));
            current_group = Some(row.group);
        }
        out.push_str(&format!("  - {}", row.title));
        if let Some(fact) = &row.fact {
            out.push_str(&format!(" — {fact}"));
        }
        if row.needs_review {
            out.push_str(" [check details]");
        }
        out.push('\n');
        let sender = if row.sender_name.is_empty() {
            row.sender_email.clone()
        } else {
            format!("{} <{}>", row.sender_name, row.sender_email)
        };
        out.push_str(&format!("    From {sender}\n"));
        if !row.excerpt.is_empty() {
            out.push_str(&format!("    {}\n", row.excerpt));
        }
        if let Some(link) = &row.link {
            out.push_str(&format!("    {link}\n"));
        }
    }
}

/// Render the digest as plain text. The HTML template layer is a separate
/// consumer of the same `Digest` value.
pub fn render_text(digest: &Digest) -> String {
    let mut out = String::new();

    let label = if digest.dry_run { "[DRY RUN] " } else { "" };
    out.push_str(&format!(
        "{label}Family digest, {} to {}\n",
        digest.start.format("%b %-d"),
        digest.end.format("%b %-d"),
    ));

    if digest.is_quiet() {
        out.push_str("\nQuiet week — nothing deferred. Everything that arrived was handled.\n");
        if !digest.dismissed.is_empty() {
            out.push_str(&format!("({} dismissed)\n", digest.dismissed.len()));
        }
        return out;
    }

    let facts = glance_facts(digest);
    if !facts.is_empty() {
        out.push_str("\nThis Week at a Glance\n");
        for fact in facts {
            out.push_str(&format!("  * {fact}\n"));
        }
    }

    if !digest.created.is_empty() {
        out.push_str("\nOn the calendar\n");
        for line in &digest.created {
            out.push_str(&format!("  * {line}\n"));
        }
    }

    if !digest.pending.is_empty() {
        out.push_str("\nWaiting for your OK\n");
        render_rows(&mut out, &digest.pending);
    }

    if !digest.approved_pending.is_empty() {
        out.push_str("\nApproved, going out next\n");
        render_rows(&mut out, &digest.approved_pending);
    }

    if !digest.deferred.is_empty() {
        out.push_str("\nNeeds a date\n");
        render_rows(&mut out, &digest.deferred);
    }

    if !digest.forwarded.is_empty() {
        out.push_str("\nForwarded\n");
        for fwd in &digest.forwarded {
            out.push_str(&format!(
                "  * {} to {}\n",
                fwd.reason,
                fwd.forwarded_to.join(", ")
            ));
        }
    }

    if !digest.dismissed.is_empty() {
        out.push_str("\nDismissed\n");
        for d in &digest.dismissed {
            out.push_str(&format!("  * {} ({})\n", d.original_subject, d.reason));
        }
    }

    if !digest.errors.is_empty() {
        out.push_str("\nNeeds attention\n");
        for e in &digest.errors {
            let what = e
                .message_id
                .as_deref()
                .map(|id| format!(" message {id}"))
                .unwrap_or_default();
            out.push_str(&format!("  * {}{}\n", e.action, what));
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AssignmentReason, ExtractionStatus, ItemType, ProcessedMessage, SHARED_ASSIGNEE,
    };
    use chrono::Duration;

    fn store() -> Store {
        Store::open_in_memory().expect("store")
    }

    fn insert_item(store: &Store, id: &str, subject: &str, snippet: &str, confidence: Option<f64>) {
        let message_id = format!("msg-{id}");
        store
            .insert_processed_message(&ProcessedMessage {
                message_id: message_id.clone(),
                processed_at: Utc::now(),
                pack_id: "school".into(),
                extraction_status: ExtractionStatus::Success,
                events_extracted: 0,
                fingerprints: vec![],
                error: None,
            })
            .unwrap();
        store
            .insert_item(&Item {
                id: id.to_string(),
                message_id,
                pack_id: "school".into(),
                subject: subject.to_string(),
                from_name: "Front Office".into(),
                from_email: "office@school.edu".into(),
                snippet: snippet.to_string(),
                email_body_text: snippet.to_string(),
                email_body_html: String::new(),
                relevance_score: 0.7,
                primary_category: Category::School,
                secondary_categories: vec![],
                category_scores: Default::default(),
                save_reasons: vec![],
                person: SHARED_ASSIGNEE.into(),
                assignment_reason: AssignmentReason::SharedDefault,
                item_type: ItemType::Announcement,
                obligation_date: None,
                classification_confidence: confidence,
                classification_reasoning: None,
                classified_at: None,
                approved: false,
                approved_at: None,
                created_at: Utc::now(),
            })
            .unwrap();
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (Utc::now() - Duration::days(7), Utc::now() + Duration::hours(1))
    }

    #[test]
    fn test_newsletter_fact() {
        let fact = extract_fact(
            "Kindergarten Weekly Newsletter (Jan 5-9)",
            "This week we learned",
            NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
        );
        assert_eq!(fact.as_deref(), Some("Kindergarten newsletter for Jan 5-9"));
    }

    #[test]
    fn test_form_due_fact() {
        let fact = extract_fact(
            "Annual Medical Update Form Due Jan 15",
            "Please return the form",
            NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
        );
        assert_eq!(fact.as_deref(), Some("Form due Jan 15"));
    }

    #[test]
    fn test_photo_fact() {
        let fact = extract_fact(
            "Class photos are ready",
            "",
            NaiveDate::from_ymd_opt(2026, 1, 5).unwrap(),
        );
        assert_eq!(fact.as_deref(), Some("Photos available"));
    }

    #[test]
    fn test_unrecognized_subject_has_no_fact() {
        assert_eq!(
            extract_fact("Hello parents", "general note", NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()),
            None
        );
    }

    #[test]
    fn test_facts_dedup_and_cap() {
        let s = store();
        for i in 0..12 {
            insert_item(
                &s,
                &format!("i{i}"),
                "Class photos are ready",
                "photo link inside",
                None,
            );
        }
        let (start, end) = window();
        let digest = build(&s, start, end, false).unwrap();
        let facts = glance_facts(&digest);
        assert_eq!(facts, vec!["Photos available".to_string()], "duplicates collapse");

        let s2 = store();
        for i in 0..12 {
            insert_item(
                &s2,
                &format!("i{i}"),
                &format!("Grade {i} Weekly Newsletter (Week {i})"),
                "",
                None,
            );
        }
        let digest = build(&s2, start, end, false).unwrap();
        assert_eq!(glance_facts(&digest).len(), MAX_FACTS);
    }

    #[test]
    fn test_quiet_week_renders_explicitly() {
        let s = store();
        let (start, end) = window();
        let digest = build(&s, start, end, false).unwrap();
        assert!(digest.is_quiet());
        let text = render_text(&digest);
        assert!(text.contains("Quiet week — nothing deferred"));
    }

    #[test]
    fn test_dry_run_label() {
        let s = store();
        let (start, end) = window();
        let digest = build(&s, start, end, true).unwrap();
        assert!(render_text(&digest).starts_with("[DRY RUN] "));
    }

    #[test]
    fn test_row_links_and_excerpt() {
        let s = store();
        insert_item(&s, "i1", "Book fair volunteers", &"x".repeat(400), None);
        let (start, end) = window();
        let digest = build(&s, start, end, false).unwrap();

        let row = &digest.pending[0];
        assert_eq!(
            row.link.as_deref(),
            Some("mail://search/rfc822msgid:%3Cmsg-i1%3E")
        );
        assert!(row.excerpt.chars().count() <= EXCERPT_CHARS);
    }

    #[test]
    fn test_excerpt_is_escaped() {
        let s = store();
        insert_item(&s, "i1", "Note", "<script>alert(1)</script>", None);
        let (start, end) = window();
        let digest = build(&s, start, end, false).unwrap();
        assert!(digest.pending[0].excerpt.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_low_confidence_marks_review() {
        let s = store();
        insert_item(&s, "low", "Vague note", "", Some(0.6));
        insert_item(&s, "high", "Clear note", "", Some(0.99));
        let (start, end) = window();
        let digest = build(&s, start, end, false).unwrap();

        let by_id = |title: &str| digest.pending.iter().find(|r| r.title == title).unwrap();
        assert!(by_id("Vague note").needs_review);
        assert!(!by_id("Clear note").needs_review);
    }

    #[test]
    fn test_language_rules() {
        let s = store();
        insert_item(&s, "i1", "Annual Medical Update Form Due Jan 15", "return the form", Some(0.5));
        insert_item(&s, "i2", "Kindergarten Weekly Newsletter (Jan 5-9)", "this week", None);
        let (start, end) = window();
        let digest = build(&s, start, end, false).unwrap();
        let text = render_text(&digest).to_lowercase();

        for banned in [
            "likely", "probably", "might", " ai ", "model", "classifier",
            "confidence", "inference", "gmail", "anthropic",
        ] {
            assert!(
                !text.contains(banned),
                "digest prose must not contain {banned:?}:\n{text}"
            );
        }
        // No numeric confidence scores in prose
        assert!(!text.contains("0.5"));
        assert!(!text.contains("50%"));
    }

    #[test]
    fn test_groups_render_in_priority_order() {
        let s = store();
        insert_item(&s, "i1", "PTA news", "", None);
        let (start, end) = window();
        let digest = build(&s, start, end, false).unwrap();
        let text = render_text(&digest);
        assert!(text.contains("School Updates"));
    }
}
