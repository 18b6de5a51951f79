//! Top-level run: pack sequencing, mode gating, housekeeping.
//!
//! This is the only component that consults the run mode. Copilot leaves
//! everything pending; autopilot promotes confident items; dry-run records
//! all internal state but callers must not let any external write through.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::discovery::{DiscoveryEngine, DiscoverySummary};
use crate::store::{Store, StoreError};
use crate::types::{AgentMode, AuditEntry, AuditLevel};

/// Approval tokens older than this are swept at the end of each run.
const TOKEN_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PackFailure {
    pub pack_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub mode: AgentMode,
    pub summaries: Vec<DiscoverySummary>,
    pub failed_packs: Vec<PackFailure>,
    pub promoted: usize,
    pub tokens_removed: usize,
    pub cancelled: bool,
}

impl RunReport {
    pub fn is_quiet(&self) -> bool {
        self.summaries.iter().all(|s| s.is_quiet()) && self.failed_packs.is_empty()
    }
}

pub struct Orchestrator {
    store: Arc<Store>,
    engine: DiscoveryEngine,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, engine: DiscoveryEngine) -> Self {
        Self { store, engine }
    }

    /// One full run: every enabled pack in priority order, then promotion
    /// (autopilot only), then token cleanup. A failed pack is recorded and
    /// the run moves on; it never takes the other packs down.
    pub async fn run(
        &self,
        config: &AgentConfig,
        cancel: &CancellationToken,
    ) -> Result<RunReport, StoreError> {
        let mut report = RunReport {
            mode: config.mode,
            summaries: vec![],
            failed_packs: vec![],
            promoted: 0,
            tokens_removed: 0,
            cancelled: false,
        };

        for pack in config.enabled_packs() {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            match self.engine.run_pack(config, pack, cancel).await {
                Ok(summary) => {
                    report.cancelled |= summary.cancelled;
                    report.summaries.push(summary);
                }
                Err(e) => {
                    log::error!("pack {} failed: {e}", pack.pack_id);
                    self.store.insert_audit_log(&AuditEntry {
                        timestamp: Utc::now(),
                        level: AuditLevel::Error,
                        module: "orchestrator".into(),
                        action: "pack_failed".into(),
                        details: serde_json::json!({
                            "packId": pack.pack_id,
                            "error": e.to_string(),
                        }),
                        message_id: None,
                        event_fingerprint: None,
                        user_id: None,
                    })?;
                    report.failed_packs.push(PackFailure {
                        pack_id: pack.pack_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if config.mode == AgentMode::Autopilot && !report.cancelled {
            report.promoted = self.promote_confident_items(config)?;
        }

        report.tokens_removed = self
            .store
            .cleanup_expired_tokens(Utc::now() - chrono::Duration::days(TOKEN_RETENTION_DAYS))?;

        self.store.insert_audit_log(&AuditEntry {
            timestamp: Utc::now(),
            level: AuditLevel::Info,
            module: "orchestrator".into(),
            action: if report.cancelled { "run_partial".to_string() } else { "run_complete".to_string() },
            details: serde_json::to_value(&report).unwrap_or_default(),
            message_id: None,
            event_fingerprint: None,
            user_id: None,
        })?;

        Ok(report)
    }

    /// Autopilot: items whose classification cleared the auto-create bar
    /// are approved, making their calendar operations eligible downstream.
    fn promote_confident_items(&self, config: &AgentConfig) -> Result<usize, StoreError> {
        let threshold = config.confidence.auto_create;
        let now = Utc::now();
        let mut promoted = 0;

        for item in self.store.list_pending_items(None)? {
            let Some(confidence) = item.classification_confidence else {
                continue;
            };
            if confidence >= threshold {
                self.store.approve_item(&item.id, now)?;
                self.store.insert_audit_log(&AuditEntry {
                    timestamp: now,
                    level: AuditLevel::Info,
                    module: "orchestrator".into(),
                    action: "auto_approved".into(),
                    details: serde_json::json!({"itemId": item.id}),
                    message_id: Some(item.message_id.clone()),
                    event_fingerprint: None,
                    user_id: None,
                })?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assign::PersonAssigner;
    use crate::classify::ItemTypeClassifier;
    use crate::config::EnvSettings;
    use crate::mail::testing::FakeMailSource;
    use crate::mail::{MailMessage, MailSource};
    use crate::types::ApprovalToken;

    fn config_yaml(mode_line: &str) -> AgentConfig {
        let yaml = r#"
version: 1
packs:
  - packId: school
    priority: 1
    sources:
      - fromDomains: ["school.edu"]
    categoryPreferences:
      school: broad
      forms_admin: broad
      medical_health: broad
  - packId: activities
    priority: 2
    sources:
      - fromDomains: ["coachesbox.com"]
    categoryPreferences:
      sports_activities: broad
family:
  members:
    - name: Colin
      aliases: ["colin"]
confidence:
  autoCreate: 0.85
"#;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).expect("write");
        let mut config = AgentConfig::load(&path, &EnvSettings::default()).expect("load");
        config.mode = AgentMode::parse(mode_line).unwrap();
        config
    }

    fn message(id: &str, from: &str, subject: &str, body: &str) -> MailMessage {
        MailMessage {
            id: id.to_string(),
            thread_id: id.to_string(),
            from: from.to_string(),
            subject: subject.to_string(),
            snippet: body.to_string(),
            date: Some(Utc::now()),
            body_text: body.to_string(),
            body_html: String::new(),
        }
    }

    fn orchestrator(
        store: Arc<Store>,
        mail: Arc<dyn MailSource>,
        config: &AgentConfig,
    ) -> Orchestrator {
        let engine = DiscoveryEngine::new(
            store.clone(),
            mail,
            PersonAssigner::new(&config.family),
            ItemTypeClassifier::deterministic(),
            config,
        );
        Orchestrator::new(store, engine)
    }

    #[tokio::test]
    async fn test_copilot_leaves_items_pending() {
        let config = config_yaml("copilot");
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mail = Arc::new(FakeMailSource::with_messages(vec![message(
            "m1",
            "office@school.edu",
            "Weekly Newsletter",
            "school teacher classroom pta principal",
        )]));
        let report = orchestrator(store.clone(), mail, &config)
            .run(&config, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.promoted, 0);
        let items = store.list_pending_items(None).unwrap();
        assert_eq!(items.len(), 1);
        assert!(!items[0].approved);
    }

    #[tokio::test]
    async fn test_autopilot_promotes_confident_items() {
        let config = config_yaml("autopilot");
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mail = Arc::new(FakeMailSource::with_messages(vec![message(
            "m1",
            "office@school.edu",
            "Weekly Newsletter",
            "school teacher classroom pta principal",
        )]));
        let orch = orchestrator(store.clone(), mail, &config);
        orch.run(&config, &CancellationToken::new()).await.unwrap();

        // Give the saved item a confident classification, then run again
        let item = &store.list_pending_items(None).unwrap()[0];
        store
            .apply_classification(
                &item.id,
                &crate::types::Classification {
                    item_type: crate::types::ItemType::Announcement,
                    obligation_date: None,
                    confidence: Some(0.95),
                    reasoning: Some("weekly recap".into()),
                },
                Utc::now(),
            )
            .unwrap();

        let report = orch.run(&config, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.promoted, 1);
        assert!(store.list_pending_items(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_pack_does_not_stop_the_run() {
        let config = config_yaml("copilot");
        let store = Arc::new(Store::open_in_memory().unwrap());
        // school pack's message fetch fails permanently; activities succeeds
        let mut fake = FakeMailSource::with_messages(vec![
            message("m1", "office@school.edu", "Newsletter", "school teacher classroom"),
            message(
                "m2",
                "coach@coachesbox.com",
                "Game Saturday",
                "practice game team coach uniform",
            ),
        ]);
        fake.failing.push("m1".into());
        // A 503 is transient, so force a permanent error instead
        let report = {
            struct AuthFailing(FakeMailSource);
            #[async_trait::async_trait]
            impl MailSource for AuthFailing {
                async fn list_message_ids(
                    &self,
                    query: &str,
                    limit: u32,
                ) -> Result<Vec<String>, crate::mail::MailError> {
                    if query.contains("school.edu") {
                        return Err(crate::mail::MailError::AuthExpired);
                    }
                    self.0.list_message_ids(query, limit).await
                }
                async fn get_message(
                    &self,
                    id: &str,
                ) -> Result<MailMessage, crate::mail::MailError> {
                    self.0.get_message(id).await
                }
                async fn get_attachments(
                    &self,
                    message: &MailMessage,
                ) -> Result<Vec<crate::mail::Attachment>, crate::mail::MailError> {
                    self.0.get_attachments(message).await
                }
                async fn forward(
                    &self,
                    message_id: &str,
                    recipients: &[String],
                    note: Option<&str>,
                ) -> Result<(), crate::mail::MailError> {
                    self.0.forward(message_id, recipients, note).await
                }
                async fn send_email(&self, mime: &str) -> Result<(), crate::mail::MailError> {
                    self.0.send_email(mime).await
                }
                async fn apply_label(
                    &self,
                    message_id: &str,
                    label: &str,
                ) -> Result<(), crate::mail::MailError> {
                    self.0.apply_label(message_id, label).await
                }
            }
            orchestrator(store.clone(), Arc::new(AuthFailing(fake)), &config)
                .run(&config, &CancellationToken::new())
                .await
                .unwrap()
        };

        assert_eq!(report.failed_packs.len(), 1);
        assert_eq!(report.failed_packs[0].pack_id, "school");
        // The activities pack still ran
        assert_eq!(report.summaries.len(), 1);
        assert_eq!(report.summaries[0].pack_id, "activities");
    }

    #[tokio::test]
    async fn test_token_cleanup_runs_every_run() {
        let config = config_yaml("copilot");
        let store = Arc::new(Store::open_in_memory().unwrap());
        let old = Utc::now() - chrono::Duration::days(40);
        store
            .insert_approval_token(&ApprovalToken {
                id: "t-old".into(),
                operation_id: "op".into(),
                created_at: old,
                expires_at: old + chrono::Duration::hours(2),
                approved: false,
                approved_at: None,
                used: false,
            })
            .unwrap();

        let report = orchestrator(store.clone(), Arc::new(FakeMailSource::default()), &config)
            .run(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.tokens_removed, 1);
        assert!(report.is_quiet());
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_partial() {
        let config = config_yaml("copilot");
        let store = Arc::new(Store::open_in_memory().unwrap());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = orchestrator(store, Arc::new(FakeMailSource::default()), &config)
            .run(&config, &cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert!(report.summaries.is_empty());
    }
}
