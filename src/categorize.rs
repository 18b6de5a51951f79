//! Rule-based category scoring with per-pack sensitivity gating.
//!
//! Eight fixed categories, each with a built-in signal bundle. Scores are
//! deterministic functions of the message text and sender; the pack's
//! sensitivity preferences decide whether a scored message is saved at all.

use std::collections::BTreeMap;

use crate::config::Pack;
use crate::types::{Category, CategoryResult};
use crate::util::{domain_matches, email_domain};

/// Signal bundle for one category.
pub struct SignalBundle {
    pub keywords: &'static [&'static str],
    pub domains: &'static [&'static str],
    pub sender_patterns: &'static [&'static str],
    pub negative_keywords: &'static [&'static str],
}

pub fn bundle_for(category: Category) -> &'static SignalBundle {
    match category {
        Category::School => &SignalBundle {
            keywords: &[
                "school", "classroom", "teacher", "homework", "principal", "pta",
                "field trip", "curriculum", "report card", "kindergarten", "grade",
            ],
            domains: &["edu", "k12"],
            sender_patterns: &["school", "pta", "principal", "classroom"],
            negative_keywords: &[],
        },
        Category::SportsActivities => &SignalBundle {
            keywords: &[
                "practice", "game", "team", "coach", "tournament", "league", "season",
                "uniform", "scrimmage", "recital", "rehearsal",
            ],
            domains: &["teamsnap.com", "leagueapps.com"],
            sender_patterns: &["coach", "athletics", "league", "teamsnap"],
            negative_keywords: &[],
        },
        Category::MedicalHealth => &SignalBundle {
            keywords: &[
                "appointment", "doctor", "dentist", "vaccine", "immunization", "medical",
                "health", "pediatric", "prescription", "allergy", "physical",
            ],
            domains: &[],
            sender_patterns: &["clinic", "health", "medical", "dental", "pediatric"],
            negative_keywords: &["health class"],
        },
        Category::FriendsSocial => &SignalBundle {
            keywords: &[
                "birthday", "party", "playdate", "invite", "invitation", "sleepover",
                "celebration", "gift",
            ],
            domains: &["evite.com", "punchbowl.com"],
            sender_patterns: &["evite", "punchbowl"],
            negative_keywords: &[],
        },
        Category::Logistics => &SignalBundle {
            keywords: &[
                "pickup", "drop-off", "dropoff", "carpool", "early dismissal", "bus",
                "closure", "delay", "reschedule", "schedule change",
            ],
            domains: &[],
            sender_patterns: &["transportation"],
            negative_keywords: &[],
        },
        Category::FormsAdmin => &SignalBundle {
            keywords: &[
                "form", "permission", "signature", "waiver", "consent", "registration",
                "enroll", "deadline", "due", "paperwork",
            ],
            domains: &[],
            sender_patterns: &["office", "admin", "registrar"],
            negative_keywords: &[],
        },
        Category::FinancialBilling => &SignalBundle {
            keywords: &[
                "invoice", "payment", "tuition", "bill", "balance", "receipt", "fee",
                "statement", "charge",
            ],
            domains: &[],
            sender_patterns: &["billing", "payments", "accounts"],
            negative_keywords: &[],
        },
        Category::CommunityOptional => &SignalBundle {
            keywords: &[
                "volunteer", "donation", "fundraiser", "community", "optional",
                "book fair", "spirit week", "charity", "bake sale",
            ],
            domains: &[],
            sender_patterns: &[],
            negative_keywords: &["required"],
        },
    }
}

/// Score one category over the combined lowercased text and sender.
///
///   score =  min(keywordMatches / |keywords|, 0.4)
///         + (anyDomainMatch ? 0.3 : 0)
///         + min(patternMatches / |senderPatterns|, 0.2)
///         - min(0.1 * negativeMatches, 0.3), clamped to [0, 1]
pub fn score_category(category: Category, text: &str, sender: &str, sender_domain: &str) -> f64 {
    let bundle = bundle_for(category);

    let keyword_matches = bundle
        .keywords
        .iter()
        .filter(|k| text.contains(*k))
        .count() as f64;
    let keyword_term = if bundle.keywords.is_empty() {
        0.0
    } else {
        (keyword_matches / bundle.keywords.len() as f64).min(0.4)
    };

    let domain_term = if bundle
        .domains
        .iter()
        .any(|d| domain_matches(sender_domain, d))
    {
        0.3
    } else {
        0.0
    };

    let pattern_matches = bundle
        .sender_patterns
        .iter()
        .filter(|p| sender.contains(*p))
        .count() as f64;
    let pattern_term = if bundle.sender_patterns.is_empty() {
        0.0
    } else {
        (pattern_matches / bundle.sender_patterns.len() as f64).min(0.2)
    };

    let negative_matches = bundle
        .negative_keywords
        .iter()
        .filter(|k| text.contains(*k))
        .count() as f64;
    let penalty = (0.1 * negative_matches).min(0.3);

    (keyword_term + domain_term + pattern_term - penalty).clamp(0.0, 1.0)
}

/// Classify a message into primary + secondary categories and apply the
/// pack's sensitivity gate.
pub fn classify(subject: &str, body: &str, from_email: &str, pack: &Pack) -> CategoryResult {
    let text = format!("{} {}", subject, body).to_lowercase();
    let sender = from_email.to_lowercase();
    let sender_domain = email_domain(&sender);

    let mut scores = BTreeMap::new();
    let mut ranked: Vec<(Category, f64)> = Category::ALL
        .iter()
        .map(|c| {
            let score = score_category(*c, &text, &sender, &sender_domain);
            scores.insert(c.as_str().to_string(), score);
            (*c, score)
        })
        .collect();

    // Highest score wins; the fixed category order breaks ties.
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let (primary, primary_score) = ranked[0];

    let secondary: Vec<Category> = ranked[1..]
        .iter()
        .filter(|(_, score)| *score > 0.5)
        .take(2)
        .map(|(c, _)| *c)
        .collect();

    let mut save_reasons = Vec::new();
    let mut should_save = false;

    let mut consider = |category: Category, score: f64| {
        if let Some(threshold) = pack.sensitivity(category).threshold() {
            if score >= threshold {
                save_reasons.push(format!("{}:{:.2}", category, score));
                should_save = true;
            }
        }
    };
    consider(primary, primary_score);
    for c in &secondary {
        consider(*c, scores[c.as_str()]);
    }

    CategoryResult {
        primary,
        secondary,
        scores,
        save_reasons,
        should_save,
    }
}
