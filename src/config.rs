//! YAML configuration loading and validation.
//!
//! The config file is loaded once per run into `AgentConfig` and passed
//! explicitly to every component that needs it. Secrets never live in the
//! file; they are read from the environment at startup via `EnvSettings`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{AgentMode, Category, Sensitivity};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Config schema
// ============================================================================

/// One mail source inside a pack: the domains it listens to and the keyword
/// filters that scope relevance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackSource {
    #[serde(default)]
    pub from_domains: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub exclude_keywords: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_hints: Option<String>,
    #[serde(default)]
    pub event_defaults: EventDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDefaults {
    #[serde(default = "default_duration_minutes")]
    pub duration_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_start_time: Option<String>,
}

fn default_duration_minutes() -> u32 {
    60
}

impl Default for EventDefaults {
    fn default() -> Self {
        Self {
            duration_minutes: default_duration_minutes(),
            default_start_time: None,
        }
    }
}

/// A named bundle of sources and preferences scoping one domain of the
/// household's life (school, activities, medical, …).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pack {
    pub pack_id: String,
    /// Tie-break for overlapping classification; lower runs first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub sources: Vec<PackSource>,
    /// Per-category save sensitivity. Unlisted categories use `balanced`.
    #[serde(default)]
    pub category_preferences: BTreeMap<Category, Sensitivity>,
    /// Hard product rule: the calendar writer must not notify guests
    /// unless this is set.
    #[serde(default)]
    pub notify_guests: bool,
}

fn default_true() -> bool {
    true
}

impl Pack {
    /// Sensitivity for a category, defaulting to `balanced`.
    pub fn sensitivity(&self, category: Category) -> Sensitivity {
        self.category_preferences
            .get(&category)
            .copied()
            .unwrap_or_default()
    }

    /// All domains across this pack's sources.
    pub fn all_domains(&self) -> Vec<&str> {
        self.sources
            .iter()
            .flat_map(|s| s.from_domains.iter().map(|d| d.as_str()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyMember {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub group_aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grade: Option<String>,
    #[serde(default)]
    pub grade_aliases: Vec<String>,
}

/// Sender-domain rule that prefills likely people before text scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceAssignment {
    pub from_domain: String,
    pub assign_to: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FamilyConfig {
    #[serde(default)]
    pub members: Vec<FamilyMember>,
    #[serde(default)]
    pub source_assignments: Vec<SourceAssignment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarConfig {
    #[serde(default = "default_calendar_id")]
    pub calendar_id: String,
}

fn default_calendar_id() -> String {
    "primary".to_string()
}

impl Default for CalendarConfig {
    fn default() -> Self {
        Self {
            calendar_id: default_calendar_id(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalCalendar {
    pub name: String,
    pub ics_url: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InviteConfig {
    /// Calendar invites found in mail are surfaced, never auto-accepted.
    #[serde(default)]
    pub surface_in_digest: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfidenceConfig {
    /// Autopilot promotion threshold.
    #[serde(default = "default_auto_create")]
    pub auto_create: f64,
}

fn default_auto_create() -> f64 {
    0.85
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            auto_create: default_auto_create(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Defaults {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_dismissed_by")]
    pub dismissed_by: String,
}

fn default_timezone() -> String {
    "America/New_York".to_string()
}

fn default_dismissed_by() -> String {
    "parent".to_string()
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            dismissed_by: default_dismissed_by(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingConfig {
    #[serde(default = "default_max_emails")]
    pub max_emails_per_run: u32,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: u32,
    /// Worker pool width inside a pack; clamped to 2..=5 at use.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// Cron schedule for the periodic agent run.
    #[serde(default = "default_agent_cron")]
    pub agent_cron: String,
}

fn default_max_emails() -> u32 {
    50
}

fn default_lookback_days() -> u32 {
    7
}

fn default_concurrency() -> u32 {
    3
}

fn default_agent_cron() -> String {
    "*/20 * * * *".to_string()
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_emails_per_run: default_max_emails(),
            lookback_days: default_lookback_days(),
            concurrency: default_concurrency(),
            agent_cron: default_agent_cron(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsConfig {
    /// Digest recipients.
    #[serde(default)]
    pub digest_to: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Weekly digest, Sunday 20:00 local.
    #[serde(default = "default_weekly_cron")]
    pub weekly_cron: String,
    /// Daily digest, 06:00 local.
    #[serde(default = "default_daily_cron")]
    pub daily_cron: String,
}

fn default_weekly_cron() -> String {
    "0 20 * * 0".to_string()
}

fn default_daily_cron() -> String {
    "0 6 * * *".to_string()
}

impl Default for DigestsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            weekly_cron: default_weekly_cron(),
            daily_cron: default_daily_cron(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AgentConfig {
    pub version: u32,
    #[serde(default)]
    pub packs: Vec<Pack>,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub family: FamilyConfig,
    #[serde(default)]
    pub external_calendars: Vec<ExternalCalendar>,
    #[serde(default)]
    pub invites: InviteConfig,
    #[serde(default)]
    pub confidence: ConfidenceConfig,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub digests: DigestsConfig,

    /// Runtime mode, from `AGENT_MODE`. Never read from the file.
    #[serde(skip)]
    pub mode: AgentMode,
    /// Feature flag, from `PERSON_ASSIGNMENT_ENABLED`.
    #[serde(skip, default = "default_true")]
    pub person_assignment_enabled: bool,
}

const SUPPORTED_VERSION: u32 = 1;

impl AgentConfig {
    /// Load and validate a config file, then apply environment overrides.
    pub fn load(path: &Path, env: &EnvSettings) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: AgentConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        config.mode = env.mode;
        config.person_assignment_enabled = env.person_assignment_enabled;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.version != SUPPORTED_VERSION {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {} (expected {})",
                self.version, SUPPORTED_VERSION
            )));
        }

        let mut seen = std::collections::HashSet::new();
        for pack in &self.packs {
            if pack.pack_id.trim().is_empty() {
                return Err(ConfigError::Invalid("pack with empty packId".into()));
            }
            if !seen.insert(pack.pack_id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate packId '{}'",
                    pack.pack_id
                )));
            }
        }

        let mut names = std::collections::HashSet::new();
        for member in &self.family.members {
            if member.name.trim().is_empty() {
                return Err(ConfigError::Invalid("family member with empty name".into()));
            }
            if !names.insert(member.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate family member '{}'",
                    member.name
                )));
            }
        }

        for rule in &self.family.source_assignments {
            for assignee in &rule.assign_to {
                if !names.contains(assignee.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "sourceAssignment for '{}' names unknown member '{}'",
                        rule.from_domain, assignee
                    )));
                }
            }
        }

        Ok(())
    }

    /// Enabled packs in priority order (stable for equal priorities).
    pub fn enabled_packs(&self) -> Vec<&Pack> {
        let mut packs: Vec<&Pack> = self.packs.iter().filter(|p| p.enabled).collect();
        packs.sort_by_key(|p| p.priority);
        packs
    }

    pub fn pack(&self, pack_id: &str) -> Option<&Pack> {
        self.packs.iter().find(|p| p.pack_id == pack_id)
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Everything the process reads from the environment, captured once at
/// startup. No module-level env lookups anywhere else.
#[derive(Debug, Clone, Default)]
pub struct EnvSettings {
    pub store_url: Option<String>,
    pub store_auth_token: Option<String>,
    pub google_client_id: Option<String>,
    pub google_client_secret: Option<String>,
    pub google_redirect_uri: Option<String>,
    pub google_refresh_token: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub mode: AgentMode,
    pub person_assignment_enabled: bool,
}

impl EnvSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mode = match std::env::var("AGENT_MODE") {
            Ok(raw) => AgentMode::parse(&raw).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "AGENT_MODE must be copilot, autopilot, or dry-run (got '{raw}')"
                ))
            })?,
            Err(_) => AgentMode::default(),
        };

        let person_assignment_enabled = std::env::var("PERSON_ASSIGNMENT_ENABLED")
            .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no"))
            .unwrap_or(true);

        Ok(Self {
            store_url: std::env::var("TURSO_DATABASE_URL").ok(),
            store_auth_token: std::env::var("TURSO_AUTH_TOKEN").ok(),
            google_client_id: std::env::var("GOOGLE_CLIENT_ID").ok(),
            google_client_secret: std::env::var("GOOGLE_CLIENT_SECRET").ok(),
            google_redirect_uri: std::env::var("GOOGLE_REDIRECT_URI").ok(),
            google_refresh_token: std::env::var("GOOGLE_REFRESH_TOKEN").ok(),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            mode,
            person_assignment_enabled,
        })
    }

    /// Resolve the store URL to a local SQLite path.
    ///
    /// Accepts a plain path or a `file:` URL. Remote stores are not
    /// supported by this binary and abort with a configuration error.
    pub fn resolve_db_path(&self) -> Result<PathBuf, ConfigError> {
        match self.store_url.as_deref() {
            Some(url) if url.starts_with("libsql://") || url.starts_with("https://") => {
                Err(ConfigError::Invalid(format!(
                    "TURSO_DATABASE_URL '{url}': remote stores are not supported; \
                     use a local path or file: URL"
                )))
            }
            Some(url) => {
                let path = url.strip_prefix("file:").unwrap_or(url);
                Ok(PathBuf::from(path))
            }
            None => {
                let home = dirs::home_dir().ok_or_else(|| {
                    ConfigError::Invalid("home directory not found".into())
                })?;
                Ok(home.join(".hearth").join("hearth.db"))
            }
        }
    }
}
