//! Pack-scoped relevance scoring.
//!
//! A cheap heuristic gate that runs before any other classification:
//! domain match, keyword hits over the subject and the first 2 KB of body,
//! and exclusion filters that zero the score outright.

use crate::config::Pack;
use crate::util::{domain_matches, email_domain};

/// Candidate threshold; below this a message is out of scope.
pub const CANDIDATE_THRESHOLD: f64 = 0.3;

/// How much body text participates in keyword matching.
const BODY_SCAN_BYTES: usize = 2048;

#[derive(Debug, Clone)]
pub struct RelevanceResult {
    pub score: f64,
    pub matched_domain: bool,
    pub matched_keywords: Vec<String>,
    pub excluded_by: Option<String>,
}

impl RelevanceResult {
    pub fn is_candidate(&self) -> bool {
        self.score >= CANDIDATE_THRESHOLD
    }
}

/// Score one message against a pack's sources.
pub fn score(pack: &Pack, from_email: &str, subject: &str, body: &str) -> RelevanceResult {
    let sender_domain = email_domain(from_email);

    let body_prefix = body
        .char_indices()
        .take_while(|(i, _)| *i < BODY_SCAN_BYTES)
        .map(|(_, c)| c)
        .collect::<String>();
    let text = format!("{} {}", subject, body_prefix).to_lowercase();

    let mut matched_domain = false;
    let mut matched_keywords = Vec::new();

    for source in &pack.sources {
        for keyword in &source.exclude_keywords {
            if text.contains(&keyword.to_lowercase()) {
                return RelevanceResult {
                    score: 0.0,
                    matched_domain: false,
                    matched_keywords: vec![],
                    excluded_by: Some(keyword.clone()),
                };
            }
        }

        if source
            .from_domains
            .iter()
            .any(|pattern| domain_matches(&sender_domain, pattern))
        {
            matched_domain = true;
        }

        for keyword in &source.keywords {
            let lower = keyword.to_lowercase();
            if text.contains(&lower) && !matched_keywords.contains(keyword) {
                matched_keywords.push(keyword.clone());
            }
        }
    }

    let domain_term = if matched_domain { 0.6 } else { 0.0 };
    let keyword_term = (0.05 * matched_keywords.len() as f64).min(0.3);

    RelevanceResult {
        score: (domain_term + keyword_term).clamp(0.0, 1.0),
        matched_domain,
        matched_keywords,
        excluded_by: None,
    }
}
