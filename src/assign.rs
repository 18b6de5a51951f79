//! Deterministic person assignment.
//!
//! Maps a message (subject + bounded snippet + sender domain) to one or
//! more configured family members with a reason. Pure token-set matching:
//! no patterns are compiled, no backtracking, and the cost is linear in
//! tokens + aliases.

use std::collections::HashSet;

use crate::config::{FamilyConfig, SourceAssignment};
use crate::types::{Assignment, AssignmentReason};
use crate::util::{domain_matches, truncate_chars};

/// Snippet cap enforced before any scanning.
pub const SNIPPET_CAP: usize = 500;

struct MemberMatcher {
    name: String,
    /// Single-word aliases, matched against the token set.
    word_aliases: Vec<String>,
    /// Multi-word aliases, matched as substrings of the normalized text.
    phrase_aliases: Vec<String>,
    /// Group and grade aliases, matched as substrings.
    group_phrases: Vec<String>,
}

pub struct PersonAssigner {
    members: Vec<MemberMatcher>,
    source_assignments: Vec<SourceAssignment>,
}

impl PersonAssigner {
    pub fn new(family: &FamilyConfig) -> Self {
        let members = family
            .members
            .iter()
            .map(|m| {
                let mut word_aliases = Vec::new();
                let mut phrase_aliases = Vec::new();
                for alias in &m.aliases {
                    let lower = alias.to_lowercase();
                    if lower.split_whitespace().count() > 1 {
                        phrase_aliases.push(normalize(&lower));
                    } else {
                        word_aliases.push(lower);
                    }
                }
                let group_phrases = m
                    .group_aliases
                    .iter()
                    .chain(m.grade_aliases.iter())
                    .map(|a| normalize(&a.to_lowercase()))
                    .filter(|a| !a.is_empty())
                    .collect();
                MemberMatcher {
                    name: m.name.clone(),
                    word_aliases,
                    phrase_aliases,
                    group_phrases,
                }
            })
            .collect();

        Self {
            members,
            source_assignments: family.source_assignments.clone(),
        }
    }

    /// Assign a message to family members.
    ///
    /// Candidates keep configured member order; the reported reason is the
    /// strongest one present (exact > alias > group > source). An empty
    /// candidate set falls back to `Family/Shared`.
    pub fn assign(&self, subject: &str, snippet: &str, sender_domain: &str) -> Assignment {
        let snippet = truncate_chars(snippet, SNIPPET_CAP);
        let text = normalize(&format!("{} {}", subject, snippet).to_lowercase());
        let tokens: HashSet<&str> = text.split_whitespace().collect();

        // member index → strongest reason found
        let mut hits: Vec<Option<AssignmentReason>> = vec![None; self.members.len()];

        for (idx, member) in self.members.iter().enumerate() {
            if member.word_aliases.iter().any(|a| tokens.contains(a.as_str())) {
                hits[idx] = Some(AssignmentReason::Exact);
                continue;
            }
            if member
                .phrase_aliases
                .iter()
                .any(|p| !p.is_empty() && text.contains(p.as_str()))
            {
                hits[idx] = Some(AssignmentReason::Alias);
                continue;
            }
            if member
                .group_phrases
                .iter()
                .any(|p| text.contains(p.as_str()))
            {
                hits[idx] = Some(AssignmentReason::Group);
            }
        }

        for rule in &self.source_assignments {
            if domain_matches(sender_domain, &rule.from_domain) {
                for name in &rule.assign_to {
                    if let Some(idx) = self.members.iter().position(|m| &m.name == name) {
                        if hits[idx].is_none() {
                            hits[idx] = Some(AssignmentReason::Source);
                        }
                    }
                }
            }
        }

        let mut names = Vec::new();
        let mut strongest: Option<AssignmentReason> = None;
        for (idx, hit) in hits.iter().enumerate() {
            if let Some(reason) = hit {
                names.push(self.members[idx].name.as_str());
                strongest = Some(match strongest {
                    Some(prev) if prev <= *reason => prev,
                    _ => *reason,
                });
            }
        }

        match strongest {
            Some(reason) => Assignment {
                person: names.join(", "),
                reason,
            },
            None => Assignment::shared(),
        }
    }
}

/// Collapse the input to lowercase words separated by single spaces.
fn normalize(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
