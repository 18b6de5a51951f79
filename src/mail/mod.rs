//! Read-mostly adapter over the upstream mail API.
//!
//! The engine depends only on the `MailSource` trait and the small query
//! DSL subset below; the Gmail adapter in `gmail` is the one concrete
//! implementation. Retry policy lives in the caller — this layer surfaces
//! typed errors and nothing else.

pub mod auth;
pub mod gmail;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::config::Pack;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token expired or revoked")]
    AuthExpired,

    #[error("Rate limited by upstream")]
    RateLimited,

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Malformed message payload: {0}")]
    Malformed(String),

    #[error("Mail credentials missing: {0}")]
    CredentialsMissing(String),
}

impl MailError {
    /// Transient errors are recovered per-message; the next scheduled run
    /// re-examines the same window. Permanent errors abort the pack.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::RateLimited => true,
            Self::Api { status, .. } => *status >= 500,
            Self::AuthExpired
            | Self::NotFound(_)
            | Self::Malformed(_)
            | Self::CredentialsMissing(_) => false,
        }
    }

    /// Short tag for audit rows (`SKIPPED{reason:...}`).
    pub fn skip_reason(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limit",
            Self::Api { status, .. } if *status >= 500 => "upstream_5xx",
            _ => "transient",
        }
    }
}

/// A fetched message: headers, both body forms, snippet.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MailMessage {
    pub id: String,
    pub thread_id: String,
    pub from: String,
    pub subject: String,
    pub snippet: String,
    pub date: Option<DateTime<Utc>>,
    pub body_text: String,
    pub body_html: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

#[async_trait]
pub trait MailSource: Send + Sync {
    async fn list_message_ids(&self, query: &str, limit: u32) -> Result<Vec<String>, MailError>;

    async fn get_message(&self, id: &str) -> Result<MailMessage, MailError>;

    async fn get_attachments(&self, message: &MailMessage) -> Result<Vec<Attachment>, MailError>;

    async fn forward(
        &self,
        message_id: &str,
        recipients: &[String],
        note: Option<&str>,
    ) -> Result<(), MailError>;

    /// Send a prebuilt multipart MIME message.
    async fn send_email(&self, mime: &str) -> Result<(), MailError>;

    async fn apply_label(&self, message_id: &str, label: &str) -> Result<(), MailError>;
}

/// Build the Gmail-style discovery query for a pack:
/// `after:YYYY/M/D (from:a OR from:b)`.
///
/// Returns `None` when the pack has no queryable domains (a bare `*`
/// wildcard cannot be expressed in the query DSL and is dropped here; the
/// relevance scorer still honors it).
pub fn build_pack_query(pack: &Pack, lookback_days: u32, today: NaiveDate) -> Option<String> {
    let domains: Vec<String> = pack
        .all_domains()
        .iter()
        .filter(|d| **d != "*")
        .map(|d| d.trim_start_matches("*.").to_string())
        .filter(|d| !d.is_empty())
        .collect();

    if domains.is_empty() {
        return None;
    }

    let after = today - chrono::Duration::days(lookback_days as i64);
    let after = after.format("%Y/%-m/%-d");

    let froms: Vec<String> = domains.iter().map(|d| format!("from:{d}")).collect();
    if froms.len() == 1 {
        Some(format!("after:{after} {}", froms[0]))
    } else {
        Some(format!("after:{after} ({})", froms.join(" OR ")))
    }
}

/// Backfill query: an explicit `[from, to]` window instead of the lookback.
pub fn build_window_query(pack: &Pack, from: NaiveDate, to: NaiveDate) -> Option<String> {
    let base = build_pack_query(pack, 0, from)?;
    // build_pack_query with lookback 0 yields `after:<from> ...`; bound the
    // other side (before: is exclusive in the query DSL)
    let before = to + chrono::Duration::days(1);
    Some(format!("{} before:{}", base, before.format("%Y/%-m/%-d")))
}

/// Deep link back to the source message in a local mail client.
pub fn message_permalink(message_id: &str) -> String {
    format!("mail://search/rfc822msgid:%3C{message_id}%3E")
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory mail source for engine tests.

    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    pub struct FakeMailSource {
        pub messages: Vec<MailMessage>,
        pub attachments: HashMap<String, Vec<Attachment>>,
        /// Message ids whose fetch should fail with a transient error.
        pub failing: Vec<String>,
        /// Message ids whose fetch should hang past any timeout.
        pub hanging: Vec<String>,
        pub sent: Mutex<Vec<String>>,
        pub forwarded: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl FakeMailSource {
        pub fn with_messages(messages: Vec<MailMessage>) -> Self {
            Self {
                messages,
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl MailSource for FakeMailSource {
        async fn list_message_ids(
            &self,
            _query: &str,
            limit: u32,
        ) -> Result<Vec<String>, MailError> {
            Ok(self
                .messages
                .iter()
                .take(limit as usize)
                .map(|m| m.id.clone())
                .collect())
        }

        async fn get_message(&self, id: &str) -> Result<MailMessage, MailError> {
            if self.hanging.iter().any(|h| h == id) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            if self.failing.iter().any(|f| f == id) {
                return Err(MailError::Api {
                    status: 503,
                    message: "backend unavailable".into(),
                });
            }
            self.messages
                .iter()
                .find(|m| m.id == id)
                .cloned()
                .ok_or_else(|| MailError::NotFound(id.to_string()))
        }

        async fn get_attachments(
            &self,
            message: &MailMessage,
        ) -> Result<Vec<Attachment>, MailError> {
            Ok(self.attachments.get(&message.id).cloned().unwrap_or_default())
        }

        async fn forward(
            &self,
            message_id: &str,
            recipients: &[String],
            _note: Option<&str>,
        ) -> Result<(), MailError> {
            self.forwarded
                .lock()
                .unwrap()
                .push((message_id.to_string(), recipients.to_vec()));
            Ok(())
        }

        async fn send_email(&self, mime: &str) -> Result<(), MailError> {
            self.sent.lock().unwrap().push(mime.to_string());
            Ok(())
        }

        async fn apply_label(&self, _message_id: &str, _label: &str) -> Result<(), MailError> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PackSource;

    fn pack_with_domains(domains: &[&str]) -> Pack {
        Pack {
            pack_id: "school".into(),
            priority: 1,
            enabled: true,
            sources: vec![PackSource {
                from_domains: domains.iter().map(|d| d.to_string()).collect(),
                ..Default::default()
            }],
            category_preferences: Default::default(),
            notify_guests: false,
        }
    }

    #[test]
    fn test_build_query_multiple_domains() {
        let pack = pack_with_domains(&["school.edu", "pta.org"]);
        let today = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let query = build_pack_query(&pack, 7, today).unwrap();
        assert_eq!(query, "after:2026/1/3 (from:school.edu OR from:pta.org)");
    }

    #[test]
    fn test_build_query_single_domain_no_parens() {
        let pack = pack_with_domains(&["school.edu"]);
        let today = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let query = build_pack_query(&pack, 0, today).unwrap();
        assert_eq!(query, "after:2026/1/10 from:school.edu");
    }

    #[test]
    fn test_build_query_strips_wildcards() {
        let pack = pack_with_domains(&["*.edu", "*"]);
        let today = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        let query = build_pack_query(&pack, 1, today).unwrap();
        assert_eq!(query, "after:2026/1/9 from:edu");
    }

    #[test]
    fn test_build_query_no_domains() {
        let pack = pack_with_domains(&[]);
        let today = NaiveDate::from_ymd_opt(2026, 1, 10).unwrap();
        assert!(build_pack_query(&pack, 7, today).is_none());
    }

    #[test]
    fn test_transient_classification() {
        assert!(MailError::RateLimited.is_transient());
        assert!(MailError::Api {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!MailError::Api {
            status: 404,
            message: String::new()
        }
        .is_transient());
        assert!(!MailError::AuthExpired.is_transient());
    }

    #[test]
    fn test_permalink_format() {
        assert_eq!(
            message_permalink("abc123"),
            "mail://search/rfc822msgid:%3Cabc123%3E"
        );
    }
}
