//! Core domain types shared across the pipeline.
//!
//! Every "kind" the store persists is a closed enum with a stable string
//! form (`as_str`/`parse`) so the TEXT columns carry exactly the values the
//! schema CHECK constraints allow. Row structs serialize as camelCase JSON
//! for the dashboard read path.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Closed enumerations
// ============================================================================

/// Obligation vs announcement, as decided by the item-type classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Obligation,
    Announcement,
    Unknown,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Obligation => "obligation",
            Self::Announcement => "announcement",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "obligation" => Self::Obligation,
            "announcement" => Self::Announcement,
            _ => Self::Unknown,
        }
    }
}

/// Terminal decision recorded for a processed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Success,
    Failed,
    Skipped,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "success" => Self::Success,
            "failed" => Self::Failed,
            _ => Self::Skipped,
        }
    }
}

/// How the person assigner arrived at its answer. Ordered strongest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentReason {
    Exact,
    Alias,
    Group,
    Source,
    SharedDefault,
}

impl AssignmentReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Alias => "alias",
            Self::Group => "group",
            Self::Source => "source",
            Self::SharedDefault => "shared_default",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "exact" => Self::Exact,
            "alias" => Self::Alias,
            "group" => Self::Group,
            "source" => Self::Source,
            _ => Self::SharedDefault,
        }
    }
}

/// The eight fixed content categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    School,
    SportsActivities,
    MedicalHealth,
    FriendsSocial,
    Logistics,
    FormsAdmin,
    FinancialBilling,
    CommunityOptional,
}

impl Category {
    /// All categories in relevance-priority order. This order drives both
    /// classification tie-breaks and digest group ordering.
    pub const ALL: [Category; 8] = [
        Category::School,
        Category::SportsActivities,
        Category::MedicalHealth,
        Category::FriendsSocial,
        Category::Logistics,
        Category::FormsAdmin,
        Category::FinancialBilling,
        Category::CommunityOptional,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::School => "school",
            Self::SportsActivities => "sports_activities",
            Self::MedicalHealth => "medical_health",
            Self::FriendsSocial => "friends_social",
            Self::Logistics => "logistics",
            Self::FormsAdmin => "forms_admin",
            Self::FinancialBilling => "financial_billing",
            Self::CommunityOptional => "community_optional",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category save sensitivity. Thresholds gate whether a scored message
/// becomes an item at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    Conservative,
    #[default]
    Balanced,
    Broad,
    Off,
}

impl Sensitivity {
    /// Minimum category score required to save. `None` means the category
    /// is disabled (nothing clears an infinite threshold).
    pub fn threshold(&self) -> Option<f64> {
        match self {
            Self::Conservative => Some(0.85),
            Self::Balanced => Some(0.75),
            Self::Broad => Some(0.65),
            Self::Off => None,
        }
    }
}

/// Run mode. Only the orchestrator consults this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentMode {
    #[default]
    Copilot,
    Autopilot,
    DryRun,
}

impl AgentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Copilot => "copilot",
            Self::Autopilot => "autopilot",
            Self::DryRun => "dry-run",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "copilot" => Some(Self::Copilot),
            "autopilot" => Some(Self::Autopilot),
            "dry-run" => Some(Self::DryRun),
            _ => None,
        }
    }
}

/// Terminal state of a single message through the discovery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TerminalState {
    Created,
    Updated,
    Deferred,
    Dismissed,
    Skipped,
    Forwarded,
    OutOfScope,
}

impl TerminalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Updated => "UPDATED",
            Self::Deferred => "DEFERRED",
            Self::Dismissed => "DISMISSED",
            Self::Skipped => "SKIPPED",
            Self::Forwarded => "FORWARDED",
            Self::OutOfScope => "OUT_OF_SCOPE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Approved,
    Created,
    Updated,
    Failed,
    ManuallyEdited,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Failed => "failed",
            Self::ManuallyEdited => "manually_edited",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "approved" => Self::Approved,
            "created" => Self::Created,
            "updated" => Self::Updated,
            "failed" => Self::Failed,
            "manually_edited" => Self::ManuallyEdited,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Update,
    Flag,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Flag => "flag",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "update" => Self::Update,
            "flag" => Self::Flag,
            _ => Self::Create,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Approved,
    Executed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "approved" => Self::Approved,
            "executed" => Self::Executed,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// Audit severity. `Warning` and above surface in the digest error section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl AuditLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "debug" => Self::Debug,
            "warning" => Self::Warning,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// How an event intent was derived from its source message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvenanceMethod {
    Ics,
    Text,
    Manual,
}

impl ProvenanceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ics => "ics",
            Self::Text => "text",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "ics" => Self::Ics,
            "manual" => Self::Manual,
            _ => Self::Text,
        }
    }
}

// ============================================================================
// Persisted rows
// ============================================================================

/// The fallback assignee when no family member matches.
pub const SHARED_ASSIGNEE: &str = "Family/Shared";

/// A row from `processed_messages`. Exists iff the engine has made a
/// terminal decision about the message; never deleted.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedMessage {
    pub message_id: String,
    pub processed_at: DateTime<Utc>,
    pub pack_id: String,
    pub extraction_status: ExtractionStatus,
    pub events_extracted: i64,
    pub fingerprints: Vec<String>,
    pub error: Option<String>,
}

/// A row from `items` — the unified obligation/announcement entity.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub message_id: String,
    pub pack_id: String,
    pub subject: String,
    pub from_name: String,
    pub from_email: String,
    pub snippet: String,
    pub email_body_text: String,
    pub email_body_html: String,
    pub relevance_score: f64,
    pub primary_category: Category,
    pub secondary_categories: Vec<Category>,
    pub category_scores: BTreeMap<String, f64>,
    pub save_reasons: Vec<String>,
    /// Single name, `Family/Shared`, or a comma-joined multi-assignment.
    pub person: String,
    pub assignment_reason: AssignmentReason,
    pub item_type: ItemType,
    pub obligation_date: Option<NaiveDate>,
    pub classification_confidence: Option<f64>,
    pub classification_reasoning: Option<String>,
    pub classified_at: Option<DateTime<Utc>>,
    pub approved: bool,
    pub approved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Structured event payload carried by operations and events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventIntent {
    pub title: String,
    pub date: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A row from `calendar_operations` — the queue the calendar writer consumes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarOperation {
    pub id: String,
    pub op_type: OperationType,
    pub event_fingerprint: String,
    pub event_intent: EventIntent,
    pub reason: String,
    pub requires_approval: bool,
    pub status: OperationStatus,
    pub executed_at: Option<DateTime<Utc>>,
    pub calendar_event_id: Option<String>,
    pub error: Option<String>,
}

/// One factor contributing to an extraction confidence score.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceReason {
    pub factor: String,
    pub weight: f64,
    pub value: String,
}

/// Where an event came from and what was assumed along the way.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    pub method: ProvenanceMethod,
    #[serde(default)]
    pub confidence_reasons: Vec<ConfidenceReason>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    pub source_email_permalink: String,
    pub extracted_at: DateTime<Utc>,
}

/// A row from `events`. `fingerprint` is unique across the table.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub id: String,
    pub fingerprint: String,
    pub source_message_id: String,
    pub pack_id: String,
    pub calendar_event_id: Option<String>,
    pub event_intent: EventIntent,
    pub confidence: f64,
    pub status: EventStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub manually_edited: bool,
    pub provenance: Provenance,
}

/// A row from `dismissed_items`. Immutable; re-dismissal creates a new row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DismissedItem {
    pub id: String,
    pub item_id: String,
    pub item_type: ItemType,
    pub reason: String,
    pub dismissed_at: DateTime<Utc>,
    pub dismissed_by: String,
    pub original_subject: String,
    pub original_from: String,
    pub original_date: DateTime<Utc>,
    pub person: String,
    pub pack_id: String,
}

/// A row from `forwarded_messages`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedMessage {
    pub id: String,
    pub source_message_id: String,
    pub forwarded_at: DateTime<Utc>,
    pub forwarded_to: Vec<String>,
    pub pack_id: String,
    pub reason: String,
    pub conditions: String,
    pub success: bool,
    pub error: Option<String>,
}

/// A row from `approval_tokens`. Single-use, default 2 h expiry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalToken {
    pub id: String,
    pub operation_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub approved: bool,
    pub approved_at: Option<DateTime<Utc>>,
    pub used: bool,
}

/// A row from `audit_log`. Append-only.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub level: AuditLevel,
    pub module: String,
    pub action: String,
    pub details: serde_json::Value,
    pub message_id: Option<String>,
    pub event_fingerprint: Option<String>,
    pub user_id: Option<String>,
}

// ============================================================================
// Classifier outputs (not persisted directly)
// ============================================================================

/// Person assignment result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub person: String,
    pub reason: AssignmentReason,
}

impl Assignment {
    pub fn shared() -> Self {
        Self {
            person: SHARED_ASSIGNEE.to_string(),
            reason: AssignmentReason::SharedDefault,
        }
    }
}

/// Category classification result.
#[derive(Debug, Clone)]
pub struct CategoryResult {
    pub primary: Category,
    pub secondary: Vec<Category>,
    pub scores: BTreeMap<String, f64>,
    /// `(category, score)` pairs that cleared their sensitivity threshold.
    pub save_reasons: Vec<String>,
    pub should_save: bool,
}

/// Item-type classification result.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub item_type: ItemType,
    pub obligation_date: Option<NaiveDate>,
    pub confidence: Option<f64>,
    pub reasoning: Option<String>,
}

impl Classification {
    pub fn unknown() -> Self {
        Self {
            item_type: ItemType::Unknown,
            obligation_date: None,
            confidence: None,
            reasoning: None,
        }
    }
}
