//! Item-type classification: obligation vs announcement.
//!
//! Two stages, each skippable. Stage A is a deterministic keyword pass over
//! the subject plus a date-extraction attempt. Stage B consults a language
//! model, only for items Stage A left unknown or dated obligations without a
//! date, and never rewrites a decision Stage A already made.

pub mod dates;
pub mod llm;

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use serde::Deserialize;

use crate::types::{Category, Classification, ItemType};

/// Subject keywords that signal a dated action item.
const OBLIGATION_KEYWORDS: &[&str] = &[
    "due", "deadline", "rsvp", "sign up", "signup", "required", "attend", "concert",
    "performance", "parade", "permission", "conference", "appointment", "meeting",
    "recital", "game", "match", "tournament",
];

/// Categories whose items are obligations by nature.
const OBLIGATION_CATEGORIES: &[Category] = &[
    Category::MedicalHealth,
    Category::FormsAdmin,
    Category::Logistics,
];

/// Subject keywords that signal informational mail.
const ANNOUNCEMENT_KEYWORDS: &[&str] = &[
    "newsletter", "update", "this week", "learning about", "celebrating",
    "class update", "weekly", "announcement", "recap", "what we did",
];

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Model call timed out")]
    Timeout,

    #[error("Model returned an error: {0}")]
    Api(String),
}

/// Input handed to the Stage B model.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub subject: String,
    pub from: String,
    pub snippet: String,
    pub pack_name: String,
    pub members: Vec<String>,
}

/// Stage B backend. Returns the model's raw text; parsing and the strict
/// JSON contract live in the caller so a misbehaving backend degrades to
/// `unknown` instead of failing the item.
#[async_trait]
pub trait ItemTypeModel: Send + Sync {
    async fn classify(&self, request: &ModelRequest) -> Result<String, ClassifierError>;
}

/// Deterministic pattern pass over the lowercased subject.
pub fn stage_a(
    subject: &str,
    snippet: &str,
    primary_category: Category,
    received: NaiveDate,
) -> Classification {
    let subject_lower = subject.to_lowercase();

    let obligation_hit = OBLIGATION_KEYWORDS
        .iter()
        .any(|k| subject_lower.contains(k))
        || OBLIGATION_CATEGORIES.contains(&primary_category);
    let announcement_hit = ANNOUNCEMENT_KEYWORDS
        .iter()
        .any(|k| subject_lower.contains(k));

    let item_type = match (obligation_hit, announcement_hit) {
        (true, false) => ItemType::Obligation,
        (false, true) => ItemType::Announcement,
        _ => ItemType::Unknown,
    };

    let obligation_date = if item_type == ItemType::Obligation {
        dates::extract_date(&format!("{subject} {snippet}"), received)
    } else {
        None
    };

    Classification {
        item_type,
        obligation_date,
        confidence: None,
        reasoning: None,
    }
}

// ============================================================================
// Stage B output contract
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
struct ModelOutput {
    item_type: String,
    obligation_date: Option<String>,
    confidence: f64,
    reasoning: String,
}

/// Parse the model's output under the strict contract. Any deviation —
/// wrong shape, extra fields, bad item type, malformed or pre-epoch date —
/// degrades to unknown with confidence 0 and reasoning "unparseable".
pub fn parse_model_output(raw: &str) -> Classification {
    let unparseable = || Classification {
        item_type: ItemType::Unknown,
        obligation_date: None,
        confidence: Some(0.0),
        reasoning: Some("unparseable".to_string()),
    };

    let parsed: ModelOutput = match serde_json::from_str(raw.trim()) {
        Ok(v) => v,
        Err(_) => return unparseable(),
    };

    let item_type = match parsed.item_type.as_str() {
        "obligation" => ItemType::Obligation,
        "announcement" => ItemType::Announcement,
        _ => return unparseable(),
    };

    let obligation_date = match parsed.obligation_date.as_deref() {
        None => None,
        Some(raw_date) => match NaiveDate::parse_from_str(raw_date, "%Y-%m-%d") {
            Ok(date) if date >= NaiveDate::from_ymd_opt(1970, 1, 1).unwrap() => Some(date),
            _ => return unparseable(),
        },
    };

    Classification {
        item_type,
        obligation_date,
        confidence: Some(parsed.confidence.clamp(0.0, 1.0)),
        reasoning: Some(parsed.reasoning),
    }
}

/// Hard ceiling on one Stage B call.
pub const MODEL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct ItemTypeClassifier {
    model: Option<Box<dyn ItemTypeModel>>,
}

impl ItemTypeClassifier {
    pub fn new(model: Option<Box<dyn ItemTypeModel>>) -> Self {
        Self { model }
    }

    pub fn deterministic() -> Self {
        Self { model: None }
    }

    /// Classify one item. Stage A always runs; Stage B runs only when a
    /// model is configured AND Stage A left the type unknown or found an
    /// obligation without a date. Stage B fills gaps, never overwrites.
    pub async fn classify(
        &self,
        request: &ModelRequest,
        primary_category: Category,
        received: NaiveDate,
    ) -> Classification {
        let mut result = stage_a(&request.subject, &request.snippet, primary_category, received);

        let needs_model = result.item_type == ItemType::Unknown
            || (result.item_type == ItemType::Obligation && result.obligation_date.is_none());
        let Some(model) = self.model.as_ref().filter(|_| needs_model) else {
            return result;
        };

        // Single call, hard timeout, no retries. A timeout or API error is
        // a recoverable degradation to the Stage A result.
        let outcome = tokio::time::timeout(MODEL_TIMEOUT, model.classify(request)).await;
        let model_result = match outcome {
            Ok(Ok(raw)) => parse_model_output(&raw),
            Ok(Err(e)) => {
                log::warn!("item-type model call failed: {e}");
                return result;
            }
            Err(_) => {
                log::warn!("item-type model call timed out");
                return result;
            }
        };

        if result.item_type == ItemType::Unknown {
            result.item_type = model_result.item_type;
        }
        if result.obligation_date.is_none() {
            result.obligation_date = model_result.obligation_date;
        }
        result.confidence = result.confidence.or(model_result.confidence);
        result.reasoning = result.reasoning.or(model_result.reasoning);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 5).unwrap()
    }

    struct ScriptedModel(String);

    #[async_trait]
    impl ItemTypeModel for ScriptedModel {
        async fn classify(&self, _request: &ModelRequest) -> Result<String, ClassifierError> {
            Ok(self.0.clone())
        }
    }

    struct FailingModel;

    #[async_trait]
    impl ItemTypeModel for FailingModel {
        async fn classify(&self, _request: &ModelRequest) -> Result<String, ClassifierError> {
            Err(ClassifierError::Api("boom".into()))
        }
    }

    fn request(subject: &str) -> ModelRequest {
        ModelRequest {
            subject: subject.to_string(),
            from: "office@school.edu".into(),
            snippet: String::new(),
            pack_name: "school".into(),
            members: vec!["Colin".into()],
        }
    }

    #[test]
    fn test_stage_a_obligation_with_date() {
        let result = stage_a(
            "Annual Medical Form Due Jan 15",
            "Please return the form by Jan 15.",
            Category::MedicalHealth,
            received(),
        );
        assert_eq!(result.item_type, ItemType::Obligation);
        assert_eq!(
            result.obligation_date,
            NaiveDate::from_ymd_opt(2026, 1, 15)
        );
    }

    #[test]
    fn test_stage_a_update_wording_conflicts_to_unknown() {
        // "update" is an announcement signal; paired with "due" the subject
        // carries both and stays unknown for the model to settle
        let result = stage_a(
            "Annual Medical Update Form Due Jan 15",
            "",
            Category::School,
            received(),
        );
        assert_eq!(result.item_type, ItemType::Unknown);
    }

    #[test]
    fn test_stage_a_announcement() {
        let result = stage_a(
            "Kindergarten Weekly Newsletter (Jan 5-9)",
            "This week we learned...",
            Category::School,
            received(),
        );
        assert_eq!(result.item_type, ItemType::Announcement);
        assert_eq!(result.obligation_date, None);
    }

    #[test]
    fn test_stage_a_conflicting_signals_is_unknown() {
        // "due" and "newsletter" both fire
        let result = stage_a(
            "Newsletter: book fair money due",
            "",
            Category::School,
            received(),
        );
        assert_eq!(result.item_type, ItemType::Unknown);
    }

    #[test]
    fn test_stage_a_obligation_category_without_keywords() {
        let result = stage_a("Carpool change", "", Category::Logistics, received());
        assert_eq!(result.item_type, ItemType::Obligation);
    }

    #[test]
    fn test_parse_valid_output() {
        let result = parse_model_output(
            r#"{"itemType": "obligation", "obligationDate": "2026-01-15", "confidence": 0.9, "reasoning": "due date stated"}"#,
        );
        assert_eq!(result.item_type, ItemType::Obligation);
        assert_eq!(result.obligation_date, NaiveDate::from_ymd_opt(2026, 1, 15));
        assert_eq!(result.confidence, Some(0.9));
    }

    #[test]
    fn test_parse_null_date() {
        let result = parse_model_output(
            r#"{"itemType": "announcement", "obligationDate": null, "confidence": 0.8, "reasoning": "weekly recap"}"#,
        );
        assert_eq!(result.item_type, ItemType::Announcement);
        assert_eq!(result.obligation_date, None);
    }

    #[test]
    fn test_parse_garbage_is_unparseable() {
        for raw in [
            "not json",
            r#"{"itemType": "maybe", "obligationDate": null, "confidence": 1, "reasoning": ""}"#,
            r#"{"itemType": "obligation", "obligationDate": "tomorrow", "confidence": 1, "reasoning": ""}"#,
            r#"{"itemType": "obligation", "obligationDate": "1969-12-31", "confidence": 1, "reasoning": ""}"#,
            r#"{"itemType": "obligation", "obligationDate": null, "confidence": 1, "reasoning": "", "extra": true}"#,
        ] {
            let result = parse_model_output(raw);
            assert_eq!(result.item_type, ItemType::Unknown, "input: {raw}");
            assert_eq!(result.confidence, Some(0.0));
            assert_eq!(result.reasoning.as_deref(), Some("unparseable"));
        }
    }

    #[test]
    fn test_parse_clamps_confidence() {
        let result = parse_model_output(
            r#"{"itemType": "obligation", "obligationDate": null, "confidence": 3.5, "reasoning": "sure"}"#,
        );
        assert_eq!(result.confidence, Some(1.0));
    }

    #[tokio::test]
    async fn test_model_fills_unknown() {
        let classifier = ItemTypeClassifier::new(Some(Box::new(ScriptedModel(
            r#"{"itemType": "obligation", "obligationDate": "2026-01-20", "confidence": 0.85, "reasoning": "asks parents to attend"}"#.into(),
        ))));
        let result = classifier
            .classify(&request("Join us soon"), Category::School, received())
            .await;
        assert_eq!(result.item_type, ItemType::Obligation);
        assert_eq!(result.obligation_date, NaiveDate::from_ymd_opt(2026, 1, 20));
    }

    #[tokio::test]
    async fn test_model_never_rewrites_stage_a_type() {
        // Stage A says announcement; the model is not even consulted
        let classifier = ItemTypeClassifier::new(Some(Box::new(ScriptedModel(
            r#"{"itemType": "obligation", "obligationDate": "2026-01-20", "confidence": 0.99, "reasoning": "contradicts"}"#.into(),
        ))));
        let result = classifier
            .classify(&request("Weekly Newsletter"), Category::School, received())
            .await;
        assert_eq!(result.item_type, ItemType::Announcement);
        assert_eq!(result.obligation_date, None);
    }

    #[tokio::test]
    async fn test_model_fills_missing_date_only() {
        // Stage A found an obligation but no date; model supplies the date
        // but its contradicting type is ignored
        let classifier = ItemTypeClassifier::new(Some(Box::new(ScriptedModel(
            r#"{"itemType": "announcement", "obligationDate": "2026-02-10", "confidence": 0.7, "reasoning": "date in body"}"#.into(),
        ))));
        let result = classifier
            .classify(&request("RSVP for the potluck"), Category::FriendsSocial, received())
            .await;
        assert_eq!(result.item_type, ItemType::Obligation);
        assert_eq!(result.obligation_date, NaiveDate::from_ymd_opt(2026, 2, 10));
    }

    #[tokio::test]
    async fn test_model_failure_degrades_to_stage_a() {
        let classifier = ItemTypeClassifier::new(Some(Box::new(FailingModel)));
        let result = classifier
            .classify(&request("Something vague"), Category::School, received())
            .await;
        assert_eq!(result.item_type, ItemType::Unknown);
    }

    #[tokio::test]
    async fn test_no_model_returns_stage_a() {
        let classifier = ItemTypeClassifier::deterministic();
        let result = classifier
            .classify(&request("Something vague"), Category::School, received())
            .await;
        assert_eq!(result.item_type, ItemType::Unknown);
        assert_eq!(result.confidence, None);
    }
}
