//! Reconciliation view and forward-only config edits.
//!
//! The view prints one person's live items, their dismissal history, and
//! any patterns worth acting on. Patterns are surfaced as suggestions only:
//! the system never mutates its own configuration, and the two edit
//! commands here append forward-only rules when a parent explicitly asks.

use std::collections::HashMap;
use std::path::Path;

use chrono::{NaiveDate, Utc};

use crate::config::{AgentConfig, ConfigError, EnvSettings};
use crate::dashboard::{self, Filter};
use crate::store::{Store, StoreError};
use crate::util::{atomic_write_str, domain_matches, email_domain};

/// Dismissals from one sender at or past this count earn a suggestion line.
const SUGGESTION_THRESHOLD: usize = 3;

/// Days of dismissal history the view covers.
const HISTORY_DAYS: i64 = 30;

/// Build the reconciliation view for one person.
pub fn view(
    store: &Store,
    person: &str,
    today: NaiveDate,
) -> Result<String, StoreError> {
    let filter = Filter {
        pack_id: None,
        person: Some(person),
    };

    let obligations = dashboard::obligations(store, filter, today)?;
    let tasks = dashboard::tasks(store, filter, today)?;
    let announcements = dashboard::announcements(store, filter, today)?;

    let end = Utc::now();
    let start = end - chrono::Duration::days(HISTORY_DAYS);
    let dismissed = store.list_dismissed_items(start, end, Some(person))?;

    let mut out = String::new();
    out.push_str(&format!("Reconciliation for {person}\n"));

    out.push_str("\nUpcoming\n");
    let upcoming = obligations
        .this_week
        .iter()
        .chain(&obligations.next_week)
        .chain(&obligations.this_month)
        .chain(&obligations.later);
    let mut any = false;
    for entry in upcoming {
        any = true;
        out.push_str(&format!(
            "  {}  {}\n",
            entry.effective_date.format("%b %-d"),
            entry.item.subject
        ));
    }
    if !any {
        out.push_str("  nothing scheduled\n");
    }

    out.push_str("\nNeeds a date\n");
    if tasks.is_empty() {
        out.push_str("  none\n");
    }
    for item in &tasks {
        out.push_str(&format!("  {}\n", item.subject));
    }

    out.push_str("\nRecent announcements\n");
    let recent = announcements.this_week.iter().chain(&announcements.last_week);
    let mut any = false;
    for item in recent {
        any = true;
        out.push_str(&format!("  {}\n", item.subject));
    }
    if !any {
        out.push_str("  none\n");
    }

    out.push_str(&format!("\nDismissed (last {HISTORY_DAYS} days)\n"));
    if dismissed.is_empty() {
        out.push_str("  none\n");
    }
    let mut by_sender: HashMap<String, usize> = HashMap::new();
    for d in &dismissed {
        out.push_str(&format!(
            "  {}  {} — {}\n",
            d.dismissed_at.format("%b %-d"),
            d.original_subject,
            d.reason
        ));
        let domain = email_domain(&d.original_from);
        if !domain.is_empty() {
            *by_sender.entry(domain).or_default() += 1;
        }
    }

    let mut suggestions: Vec<(String, usize)> = by_sender
        .into_iter()
        .filter(|(_, count)| *count >= SUGGESTION_THRESHOLD)
        .collect();
    suggestions.sort_by(|a, b| b.1.cmp(&a.1));
    if !suggestions.is_empty() {
        out.push_str("\nSuggestions (no changes made)\n");
        for (domain, count) in suggestions {
            out.push_str(&format!(
                "  {count} dismissals from {domain}; consider `audit {person} --exclude-keyword ...` \
                 or removing the domain from its pack\n"
            ));
        }
    }

    Ok(out)
}

// ============================================================================
// Forward-only config edits
// ============================================================================

fn load_for_edit(config_path: &Path) -> Result<AgentConfig, ConfigError> {
    AgentConfig::load(config_path, &EnvSettings::default())
}

fn write_config(config_path: &Path, config: &AgentConfig) -> Result<(), ConfigError> {
    let yaml = serde_yaml::to_string(config)
        .map_err(|e| ConfigError::Invalid(format!("failed to serialize config: {e}")))?;
    atomic_write_str(config_path, &yaml).map_err(|source| ConfigError::Io {
        path: config_path.to_path_buf(),
        source,
    })
}

/// Append `domain` to the named pack's first source and report how many
/// recent messages would now match. Forward-only: nothing already stored is
/// touched.
pub fn add_domain(
    store: &Store,
    config_path: &Path,
    pack_id: &str,
    domain: &str,
) -> Result<usize, ConfigError> {
    let mut config = load_for_edit(config_path)?;
    let pack = config
        .packs
        .iter_mut()
        .find(|p| p.pack_id == pack_id)
        .ok_or_else(|| ConfigError::Invalid(format!("unknown pack '{pack_id}'")))?;

    if pack.sources.is_empty() {
        pack.sources.push(Default::default());
    }
    let source = &mut pack.sources[0];
    if !source.from_domains.iter().any(|d| d == domain) {
        source.from_domains.push(domain.to_string());
    }
    write_config(config_path, &config)?;

    // Count in-window items that would now match, without writing anything.
    let cutoff = Utc::now() - chrono::Duration::days(HISTORY_DAYS);
    let count = store
        .with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT from_email FROM items WHERE created_at >= ?1",
            )?;
            let rows = stmt.query_map([cutoff.to_rfc3339()], |row| row.get::<_, String>(0))?;
            let mut count = 0;
            for row in rows {
                if domain_matches(&email_domain(&row?), domain) {
                    count += 1;
                }
            }
            Ok(count)
        })
        .map_err(|e| ConfigError::Invalid(format!("store error: {e}")))?;

    Ok(count)
}

/// Append an exclusion keyword to the named pack. Forward-only.
pub fn add_exclude_keyword(
    config_path: &Path,
    pack_id: &str,
    keyword: &str,
) -> Result<(), ConfigError> {
    let mut config = load_for_edit(config_path)?;
    let pack = config
        .packs
        .iter_mut()
        .find(|p| p.pack_id == pack_id)
        .ok_or_else(|| ConfigError::Invalid(format!("unknown pack '{pack_id}'")))?;

    if pack.sources.is_empty() {
        pack.sources.push(Default::default());
    }
    let source = &mut pack.sources[0];
    if !source.exclude_keywords.iter().any(|k| k == keyword) {
        source.exclude_keywords.push(keyword.to_string());
    }
    write_config(config_path, &config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AssignmentReason, Category, ExtractionStatus, Item, ItemType, ProcessedMessage,
    };

    fn store_with_item(person: &str, from_email: &str) -> Store {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_processed_message(&ProcessedMessage {
                message_id: "m1".into(),
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
                id: "i1".into(),
                message_id: "m1".into(),
                pack_id: "school".into(),
                subject: "Soccer signup due Friday".into(),
                from_name: "League".into(),
                from_email: from_email.into(),
                snippet: String::new(),
                email_body_text: String::new(),
                email_body_html: String::new(),
                relevance_score: 0.7,
                primary_category: Category::SportsActivities,
                secondary_categories: vec![],
                category_scores: Default::default(),
                save_reasons: vec![],
                person: person.into(),
                assignment_reason: AssignmentReason::Exact,
                item_type: ItemType::Obligation,
                obligation_date: None,
                classification_confidence: None,
                classification_reasoning: None,
                classified_at: None,
                approved: false,
                approved_at: None,
                created_at: Utc::now(),
            })
            .unwrap();
        store
    }

    const CONFIG: &str = r#"
version: 1
packs:
  - packId: activities
    priority: 1
    sources:
      - fromDomains: ["leagueapps.com"]
        keywords: ["practice"]
"#;

    fn config_file(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_view_lists_tasks_and_dismissals() {
        let store = store_with_item("Henry", "signup@leagueapps.com");
        let text = view(&store, "Henry", Utc::now().date_naive()).unwrap();
        assert!(text.contains("Reconciliation for Henry"));
        assert!(text.contains("Soccer signup due Friday"));

        store.dismiss_item("i1", "Not doing soccer this year", "parent").unwrap();
        let text = view(&store, "Henry", Utc::now().date_naive()).unwrap();
        assert!(text.contains("Not doing soccer this year"));
    }

    #[test]
    fn test_view_suggests_after_repeated_dismissals() {
        let store = Store::open_in_memory().unwrap();
        for i in 0..3 {
            let mid = format!("m{i}");
            store
                .insert_processed_message(&ProcessedMessage {
                    message_id: mid.clone(),
                    processed_at: Utc::now(),
                    pack_id: "school".into(),
                    extraction_status: ExtractionStatus::Success,
                    events_extracted: 0,
                    fingerprints: vec![],
                    error: None,
                })
                .unwrap();
            let mut item = store_with_item("Henry", "spam@noisy.org")
                .get_item_by_id("i1")
                .unwrap()
                .unwrap();
            item.id = format!("i{i}");
            item.message_id = mid;
            store.insert_item(&item).unwrap();
            store.dismiss_item(&item.id, "noise", "parent").unwrap();
        }
        let text = view(&store, "Henry", Utc::now().date_naive()).unwrap();
        assert!(text.contains("Suggestions (no changes made)"));
        assert!(text.contains("noisy.org"));
    }

    #[test]
    fn test_add_domain_appends_and_counts() {
        let (_dir, path) = config_file(CONFIG);
        let store = store_with_item("Henry", "coach@coachesbox.com");

        let count = add_domain(&store, &path, "activities", "coachesbox.com").unwrap();
        assert_eq!(count, 1);

        let reloaded = AgentConfig::load(&path, &EnvSettings::default()).unwrap();
        assert!(reloaded.packs[0]
            .sources[0]
            .from_domains
            .contains(&"coachesbox.com".to_string()));
        // Existing entries survive the rewrite
        assert!(reloaded.packs[0]
            .sources[0]
            .from_domains
            .contains(&"leagueapps.com".to_string()));
    }

    #[test]
    fn test_add_domain_unknown_pack_fails() {
        let (_dir, path) = config_file(CONFIG);
        let store = Store::open_in_memory().unwrap();
        assert!(add_domain(&store, &path, "nope", "x.com").is_err());
    }

    #[test]
    fn test_add_exclude_keyword_is_idempotent() {
        let (_dir, path) = config_file(CONFIG);
        add_exclude_keyword(&path, "activities", "fundraiser").unwrap();
        add_exclude_keyword(&path, "activities", "fundraiser").unwrap();

        let reloaded = AgentConfig::load(&path, &EnvSettings::default()).unwrap();
        let excludes = &reloaded.packs[0].sources[0].exclude_keywords;
        assert_eq!(excludes.iter().filter(|k| *k == "fundraiser").count(), 1);
    }
}
