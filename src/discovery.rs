//! Per-pack discovery: the central hot loop.
//!
//! For each pack the engine lists message ids, then processes them under a
//! bounded worker pool with per-step timeouts. Every message reaches exactly
//! one terminal state with logged evidence; nothing is silently dropped.
//! INSERT OR IGNORE on the processed-message key makes reruns safe, so a
//! cancelled or crashed run simply resumes on the next schedule.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::assign::{PersonAssigner, SNIPPET_CAP};
use crate::categorize;
use crate::classify::{ItemTypeClassifier, ModelRequest};
use crate::config::{AgentConfig, Pack};
use crate::mail::{build_pack_query, MailError, MailMessage, MailSource};
use crate::relevance;
use crate::store::{Store, StoreError};
use crate::types::{
    Assignment, AuditEntry, AuditLevel, ExtractionStatus, Item, ItemType, ProcessedMessage,
    SHARED_ASSIGNEE,
};
use crate::util::{parse_from_header, email_domain, truncate_chars};

/// Hard ceiling on each mail-source call.
pub const MAIL_TIMEOUT: Duration = Duration::from_secs(15);

/// Worker pool bounds; config.processing.concurrency is clamped into this.
const MIN_WORKERS: usize = 2;
const MAX_WORKERS: usize = 5;

/// Terminal outcome of one message inside a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MessageOutcome {
    AlreadyProcessed,
    SkippedTransient,
    OutOfScope,
    SkippedThreshold,
    Failed,
    Created,
    Deferred,
    Cancelled,
}

/// Per-pack run summary, also serialized into the closing audit row.
#[derive(Debug, Default, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverySummary {
    pub pack_id: String,
    pub listed: usize,
    pub already_processed: usize,
    pub skipped_transient: usize,
    pub out_of_scope: usize,
    pub skipped_threshold: usize,
    pub failed: usize,
    pub created: usize,
    pub deferred: usize,
    pub cancelled: bool,
}

impl DiscoverySummary {
    /// A quiet run processed mail but produced nothing actionable.
    pub fn is_quiet(&self) -> bool {
        self.created == 0 && self.deferred == 0
    }

    fn record(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::AlreadyProcessed => self.already_processed += 1,
            MessageOutcome::SkippedTransient => self.skipped_transient += 1,
            MessageOutcome::OutOfScope => self.out_of_scope += 1,
            MessageOutcome::SkippedThreshold => self.skipped_threshold += 1,
            MessageOutcome::Failed => self.failed += 1,
            MessageOutcome::Created => self.created += 1,
            MessageOutcome::Deferred => self.deferred += 1,
            MessageOutcome::Cancelled => self.cancelled = true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct DiscoveryEngine {
    store: Arc<Store>,
    mail: Arc<dyn MailSource>,
    assigner: Arc<PersonAssigner>,
    classifier: Arc<ItemTypeClassifier>,
    person_assignment_enabled: bool,
}

impl DiscoveryEngine {
    pub fn new(
        store: Arc<Store>,
        mail: Arc<dyn MailSource>,
        assigner: PersonAssigner,
        classifier: ItemTypeClassifier,
        config: &AgentConfig,
    ) -> Self {
        Self {
            store,
            mail,
            assigner: Arc::new(assigner),
            classifier: Arc::new(classifier),
            person_assignment_enabled: config.person_assignment_enabled,
        }
    }

    /// Run discovery for one pack over its standard lookback window.
    pub async fn run_pack(
        &self,
        config: &AgentConfig,
        pack: &Pack,
        cancel: &CancellationToken,
    ) -> Result<DiscoverySummary, DiscoveryError> {
        let today = Utc::now().date_naive();
        let Some(query) = build_pack_query(pack, config.processing.lookback_days, today) else {
            log::info!("pack {} has no sources, skipping", pack.pack_id);
            self.audit_pack(
                pack,
                AuditLevel::Info,
                "pack_skipped",
                serde_json::json!({"reason": "no sources"}),
            )?;
            return Ok(DiscoverySummary {
                pack_id: pack.pack_id.clone(),
                ..Default::default()
            });
        };
        self.run_query(config, pack, &query, cancel).await
    }

    /// Run discovery for one pack with an explicit query. Transient
    /// per-message failures are recovered in place; permanent mail errors
    /// abort the pack and bubble to the orchestrator.
    pub async fn run_query(
        &self,
        config: &AgentConfig,
        pack: &Pack,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<DiscoverySummary, DiscoveryError> {
        let mut summary = DiscoverySummary {
            pack_id: pack.pack_id.clone(),
            ..Default::default()
        };

        log::debug!("pack {} query: {query}", pack.pack_id);
        let ids = self
            .mail
            .list_message_ids(query, config.processing.max_emails_per_run)
            .await?;
        summary.listed = ids.len();

        let workers = (config.processing.concurrency as usize).clamp(MIN_WORKERS, MAX_WORKERS);
        let permits = Arc::new(Semaphore::new(workers));
        let mut tasks: JoinSet<Result<MessageOutcome, MailError>> = JoinSet::new();

        // Child token: a pack-level abort must not cancel the packs that
        // follow, only this pack's in-flight workers.
        let pack_cancel = cancel.child_token();

        for message_id in ids {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if pack_cancel.is_cancelled() {
                break;
            }

            let permit = match permits.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            let worker = Worker {
                store: self.store.clone(),
                mail: self.mail.clone(),
                assigner: self.assigner.clone(),
                classifier: self.classifier.clone(),
                pack: pack.clone(),
                person_assignment_enabled: self.person_assignment_enabled,
            };
            let worker_cancel = pack_cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                worker.process(&message_id, &worker_cancel).await
            });
        }

        let mut pack_error: Option<MailError> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => summary.record(outcome),
                Ok(Err(e)) => {
                    // Permanent mail error: abort the pack, let in-flight
                    // workers drain, report the first cause.
                    log::error!("pack {} aborting: {e}", pack.pack_id);
                    if pack_error.is_none() {
                        pack_error = Some(e);
                        pack_cancel.cancel();
                    }
                }
                Err(join_error) => {
                    log::error!("discovery worker panicked: {join_error}");
                    summary.record(MessageOutcome::Failed);
                }
            }
        }

        let action = if summary.cancelled {
            "discovery_summary_partial"
        } else {
            "discovery_summary"
        };
        self.audit_pack(
            pack,
            AuditLevel::Info,
            action,
            serde_json::to_value(&summary).unwrap_or_default(),
        )?;

        match pack_error {
            Some(e) => Err(e.into()),
            None => Ok(summary),
        }
    }

    fn audit_pack(
        &self,
        pack: &Pack,
        level: AuditLevel,
        action: &str,
        details: serde_json::Value,
    ) -> Result<(), StoreError> {
        self.store.insert_audit_log(&AuditEntry {
            timestamp: Utc::now(),
            level,
            module: "discovery".into(),
            action: action.into(),
            details: serde_json::json!({"packId": pack.pack_id, "detail": details}),
            message_id: None,
            event_fingerprint: None,
            user_id: None,
        })
    }
}

// ============================================================================
// Per-message worker
// ============================================================================

struct Worker {
    store: Arc<Store>,
    mail: Arc<dyn MailSource>,
    assigner: Arc<PersonAssigner>,
    classifier: Arc<ItemTypeClassifier>,
    pack: Pack,
    person_assignment_enabled: bool,
}

impl Worker {
    async fn process(
        &self,
        message_id: &str,
        cancel: &CancellationToken,
    ) -> Result<MessageOutcome, MailError> {
        if cancel.is_cancelled() {
            return Ok(MessageOutcome::Cancelled);
        }

        // Idempotency: the primary duplicate guard.
        if self
            .store
            .get_processed_message(message_id)
            .map_err(store_as_failed)?
            .is_some()
        {
            return Ok(MessageOutcome::AlreadyProcessed);
        }

        // getMessage, bounded
        let message = match self
            .bounded_step("getMessage", message_id, cancel, self.mail.get_message(message_id))
            .await
        {
            StepResult::Ok(Ok(message)) => message,
            StepResult::Ok(Err(e)) => return self.handle_mail_error(message_id, "getMessage", e),
            StepResult::TimedOut => {
                self.skip_transient(message_id, "timeout:getMessage")
                    .map_err(store_as_failed)?;
                return Ok(MessageOutcome::SkippedTransient);
            }
            StepResult::Cancelled => return Ok(MessageOutcome::Cancelled),
        };

        // getAttachments, bounded. The attachment list rides along for the
        // downstream event extractor; failure to fetch it is recoverable.
        let _attachments = match self
            .bounded_step(
                "getAttachments",
                message_id,
                cancel,
                self.mail.get_attachments(&message),
            )
            .await
        {
            StepResult::Ok(Ok(attachments)) => attachments,
            StepResult::Ok(Err(e)) => {
                return self.handle_mail_error(message_id, "getAttachments", e)
            }
            StepResult::TimedOut => {
                self.skip_transient(message_id, "timeout:getAttachments")
                    .map_err(store_as_failed)?;
                return Ok(MessageOutcome::SkippedTransient);
            }
            StepResult::Cancelled => return Ok(MessageOutcome::Cancelled),
        };

        let (from_name, from_email) = parse_from_header(&message.from);

        // score
        let relevance = step("score", message_id, || {
            relevance::score(&self.pack, &from_email, &message.subject, &message.body_text)
        });
        if !relevance.is_candidate() {
            let pm = self.processed(message_id, ExtractionStatus::Skipped, None);
            let audit = self.audit(
                message_id,
                AuditLevel::Info,
                "out_of_scope",
                serde_json::json!({"score": relevance.score, "excludedBy": relevance.excluded_by}),
            );
            self.store
                .record_discovery(&pm, None, &audit)
                .map_err(store_as_failed)?;
            return Ok(MessageOutcome::OutOfScope);
        }

        let snippet = truncate_chars(&message.snippet, SNIPPET_CAP);

        // assignPerson — the feature flag short-circuits to Family/Shared
        // so regressions in the assigner can be isolated without a deploy.
        let assignment = step("assignPerson", message_id, || {
            if self.person_assignment_enabled {
                self.assigner
                    .assign(&message.subject, &snippet, &email_domain(&from_email))
            } else {
                Assignment::shared()
            }
        });

        // categorize
        let category = step("categorize", message_id, || {
            categorize::classify(
                &message.subject,
                &message.body_text,
                &from_email,
                &self.pack,
            )
        });
        if !category.should_save {
            let pm = self.processed(message_id, ExtractionStatus::Skipped, None);
            let audit = self.audit(
                message_id,
                AuditLevel::Info,
                "skipped_threshold",
                serde_json::json!({
                    "primaryCategory": category.primary.as_str(),
                    "saveReasons": [],
                }),
            );
            self.store
                .record_discovery(&pm, None, &audit)
                .map_err(store_as_failed)?;
            return Ok(MessageOutcome::SkippedThreshold);
        }

        // classifyItem
        let received = message.date.map(|d| d.date_naive()).unwrap_or_else(|| Utc::now().date_naive());
        let request = ModelRequest {
            subject: message.subject.clone(),
            from: message.from.clone(),
            snippet: snippet.clone(),
            pack_name: self.pack.pack_id.clone(),
            members: if assignment.person == SHARED_ASSIGNEE {
                vec![]
            } else {
                assignment.person.split(", ").map(String::from).collect()
            },
        };
        log::debug!("before classifyItem message={message_id}");
        let classify_start = Instant::now();
        let classification = self
            .classifier
            .classify(&request, category.primary, received)
            .await;
        log::debug!(
            "after classifyItem ({}ms) message={message_id}",
            classify_start.elapsed().as_millis()
        );

        // insertItem — one transaction for the terminal decision.
        let item = self.build_item(&message, &from_name, &from_email, &snippet, &relevance, &category, &assignment, &classification);
        let outcome = if item.item_type == ItemType::Obligation && item.obligation_date.is_none() {
            MessageOutcome::Deferred
        } else {
            MessageOutcome::Created
        };
        let pm = self.processed(message_id, ExtractionStatus::Success, None);
        let audit = self.audit(
            message_id,
            AuditLevel::Info,
            "processed",
            serde_json::json!({
                "itemId": item.id,
                "itemType": item.item_type.as_str(),
                "person": item.person,
                "saveReasons": item.save_reasons,
            }),
        );
        let inserted = step("insertItem", message_id, || {
            self.store.record_discovery(&pm, Some(&item), &audit)
        })
        .map_err(store_as_failed)?;

        if !inserted {
            // A concurrent worker won the natural-key race.
            return Ok(MessageOutcome::AlreadyProcessed);
        }
        Ok(outcome)
    }

    /// Route a mail error: transient → SKIPPED (no processed-message row,
    /// eligible next run); malformed → failed row with the error text;
    /// anything else aborts the pack.
    fn handle_mail_error(
        &self,
        message_id: &str,
        step_name: &str,
        error: MailError,
    ) -> Result<MessageOutcome, MailError> {
        if error.is_transient() {
            self.skip_transient(message_id, error.skip_reason())
                .map_err(store_as_failed)?;
            return Ok(MessageOutcome::SkippedTransient);
        }
        match error {
            MailError::Malformed(detail) => {
                let pm = self.processed(
                    message_id,
                    ExtractionStatus::Failed,
                    Some(detail.clone()),
                );
                let audit = self.audit(
                    message_id,
                    AuditLevel::Error,
                    "parse_failed",
                    serde_json::json!({"step": step_name, "error": detail}),
                );
                self.store
                    .record_discovery(&pm, None, &audit)
                    .map_err(store_as_failed)?;
                Ok(MessageOutcome::Failed)
            }
            MailError::NotFound(_) => {
                // Listed but gone by fetch time; leave no row, the next run
                // will not list it again.
                self.skip_transient(message_id, "vanished")
                    .map_err(store_as_failed)?;
                Ok(MessageOutcome::SkippedTransient)
            }
            permanent => Err(permanent),
        }
    }

    fn skip_transient(&self, message_id: &str, reason: &str) -> Result<(), StoreError> {
        log::warn!("skipping message {message_id}: {reason}");
        self.store.insert_audit_log(&self.audit(
            message_id,
            AuditLevel::Warning,
            "skipped",
            serde_json::json!({"reason": reason}),
        ))
    }

    fn processed(
        &self,
        message_id: &str,
        status: ExtractionStatus,
        error: Option<String>,
    ) -> ProcessedMessage {
        ProcessedMessage {
            message_id: message_id.to_string(),
            processed_at: Utc::now(),
            pack_id: self.pack.pack_id.clone(),
            extraction_status: status,
            events_extracted: 0,
            fingerprints: vec![],
            error,
        }
    }

    fn audit(
        &self,
        message_id: &str,
        level: AuditLevel,
        action: &str,
        details: serde_json::Value,
    ) -> AuditEntry {
        AuditEntry {
            timestamp: Utc::now(),
            level,
            module: "discovery".into(),
            action: action.into(),
            details,
            message_id: Some(message_id.to_string()),
            event_fingerprint: None,
            user_id: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_item(
        &self,
        message: &MailMessage,
        from_name: &str,
        from_email: &str,
        snippet: &str,
        relevance: &relevance::RelevanceResult,
        category: &crate::types::CategoryResult,
        assignment: &Assignment,
        classification: &crate::types::Classification,
    ) -> Item {
        let classified = classification.confidence.is_some()
            || classification.item_type != ItemType::Unknown;
        Item {
            id: Uuid::new_v4().to_string(),
            message_id: message.id.clone(),
            pack_id: self.pack.pack_id.clone(),
            subject: message.subject.clone(),
            from_name: from_name.to_string(),
            from_email: from_email.to_string(),
            snippet: snippet.to_string(),
            email_body_text: message.body_text.clone(),
            email_body_html: message.body_html.clone(),
            relevance_score: relevance.score,
            primary_category: category.primary,
            secondary_categories: category.secondary.clone(),
            category_scores: category.scores.clone(),
            save_reasons: category.save_reasons.clone(),
            person: assignment.person.clone(),
            assignment_reason: assignment.reason,
            item_type: classification.item_type,
            obligation_date: classification.obligation_date,
            classification_confidence: classification.confidence,
            classification_reasoning: classification.reasoning.clone(),
            classified_at: classified.then(Utc::now),
            approved: false,
            approved_at: None,
            created_at: Utc::now(),
        }
    }

    /// Await a mail call under the 15 s ceiling, honoring cancellation.
    async fn bounded_step<T>(
        &self,
        name: &str,
        message_id: &str,
        cancel: &CancellationToken,
        fut: impl std::future::Future<Output = T>,
    ) -> StepResult<T> {
        log::debug!("before {name} message={message_id}");
        let start = Instant::now();
        let result = tokio::select! {
            _ = cancel.cancelled() => StepResult::Cancelled,
            timed = tokio::time::timeout(MAIL_TIMEOUT, fut) => match timed {
                Ok(value) => StepResult::Ok(value),
                Err(_) => StepResult::TimedOut,
            },
        };
        log::debug!(
            "after {name} ({}ms) message={message_id}",
            start.elapsed().as_millis()
        );
        result
    }
}

enum StepResult<T> {
    Ok(T),
    TimedOut,
    Cancelled,
}

/// Synchronous per-step trace for the in-process stages.
fn step<T>(name: &str, message_id: &str, f: impl FnOnce() -> T) -> T {
    log::debug!("before {name} message={message_id}");
    let start = Instant::now();
    let out = f();
    log::debug!(
        "after {name} ({}ms) message={message_id}",
        start.elapsed().as_millis()
    );
    out
}

/// Store failures inside a worker surface as mail-layer aborts so the pack
/// records a failure rather than losing the error.
fn store_as_failed(e: StoreError) -> MailError {
    MailError::Malformed(format!("store error: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::ItemTypeClassifier;
    use crate::config::{EnvSettings, PackSource};
    use crate::mail::testing::FakeMailSource;
    use crate::types::Sensitivity;

    fn test_config() -> AgentConfig {
        let yaml = r#"
version: 1
packs:
  - packId: school
    priority: 1
    sources:
      - fromDomains: ["school.edu"]
        keywords: ["newsletter"]
    categoryPreferences:
      school: broad
      forms_admin: broad
      medical_health: broad
family:
  members:
    - name: Colin
      aliases: ["colin"]
processing:
  maxEmailsPerRun: 50
  lookbackDays: 7
  concurrency: 2
"#;
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, yaml).expect("write config");
        AgentConfig::load(&path, &EnvSettings::default()).expect("load config")
    }

    fn message(id: &str, from: &str, subject: &str, body: &str) -> MailMessage {
        MailMessage {
            id: id.to_string(),
            thread_id: format!("t-{id}"),
            from: from.to_string(),
            subject: subject.to_string(),
            snippet: truncate_chars(body, 100),
            date: Some(Utc::now()),
            body_text: body.to_string(),
            body_html: String::new(),
        }
    }

    fn engine(store: Arc<Store>, mail: Arc<dyn MailSource>, config: &AgentConfig) -> DiscoveryEngine {
        DiscoveryEngine::new(
            store,
            mail,
            PersonAssigner::new(&config.family),
            ItemTypeClassifier::deterministic(),
            config,
        )
    }

    #[tokio::test]
    async fn test_relevant_message_becomes_item() {
        let config = test_config();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mail = Arc::new(FakeMailSource::with_messages(vec![message(
            "m1",
            "Front Office <office@school.edu>",
            "Annual Medical Form Due Jan 15",
            "Please return the form by Jan 15. school teacher classroom form permission",
        )]));
        let engine = engine(store.clone(), mail, &config);

        let summary = engine
            .run_pack(&config, config.pack("school").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.listed, 1);
        assert_eq!(summary.created, 1);
        assert!(!summary.is_quiet());

        let pm = store.get_processed_message("m1").unwrap().unwrap();
        assert_eq!(pm.extraction_status, ExtractionStatus::Success);

        let items = store.list_pending_items(Some("school")).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].item_type, ItemType::Obligation);
        assert!(items[0].obligation_date.is_some());
        assert_eq!(items[0].from_email, "office@school.edu");
    }

    #[tokio::test]
    async fn test_dateless_obligation_is_deferred() {
        let config = test_config();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mail = Arc::new(FakeMailSource::with_messages(vec![message(
            "m1",
            "office@school.edu",
            "Permission slip due this Friday",
            "school teacher classroom permission slip for the trip",
        )]));
        let engine = engine(store.clone(), mail, &config);

        let summary = engine
            .run_pack(&config, config.pack("school").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.deferred, 1);
        assert_eq!(summary.created, 0);

        let items = store.list_pending_items(None).unwrap();
        assert_eq!(items[0].item_type, ItemType::Obligation);
        assert_eq!(items[0].obligation_date, None);
    }

    #[tokio::test]
    async fn test_rerun_is_idempotent() {
        let config = test_config();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mail = Arc::new(FakeMailSource::with_messages(vec![message(
            "m1",
            "office@school.edu",
            "Kindergarten Weekly Newsletter",
            "This week we learned about the school garden with our teacher in the classroom.",
        )]));
        let engine = engine(store.clone(), mail, &config);
        let pack = config.pack("school").unwrap();

        let first = engine
            .run_pack(&config, pack, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.created, 1);

        let second = engine
            .run_pack(&config, pack, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.already_processed, 1);
        assert!(second.is_quiet());

        assert_eq!(store.count_processed_messages().unwrap(), 1);
        assert_eq!(store.list_pending_items(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_irrelevant_message_is_out_of_scope() {
        let config = test_config();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mail = Arc::new(FakeMailSource::with_messages(vec![message(
            "m1",
            "deals@retailer.com",
            "Huge discounts this weekend",
            "Buy more things",
        )]));
        let engine = engine(store.clone(), mail, &config);

        let summary = engine
            .run_pack(&config, config.pack("school").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.out_of_scope, 1);
        let pm = store.get_processed_message("m1").unwrap().unwrap();
        assert_eq!(pm.extraction_status, ExtractionStatus::Skipped);
        assert!(store.list_pending_items(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_leaves_no_row() {
        let config = test_config();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut fake = FakeMailSource::with_messages(vec![message(
            "m1",
            "office@school.edu",
            "Newsletter",
            "school things",
        )]);
        fake.failing.push("m1".into());
        let engine = engine(store.clone(), Arc::new(fake), &config);

        let summary = engine
            .run_pack(&config, config.pack("school").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.skipped_transient, 1);
        // Eligible again next run: no processed-message row
        assert!(store.get_processed_message("m1").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_fetch_times_out_and_skips() {
        let config = test_config();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut fake = FakeMailSource::with_messages(vec![
            message("m1", "office@school.edu", "Newsletter", "school teacher classroom"),
        ]);
        fake.hanging.push("m1".into());
        let engine = engine(store.clone(), Arc::new(fake), &config);

        let summary = engine
            .run_pack(&config, config.pack("school").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.skipped_transient, 1);
        assert!(store.get_processed_message("m1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancellation_stops_cleanly() {
        let config = test_config();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let messages: Vec<MailMessage> = (0..20)
            .map(|i| {
                message(
                    &format!("m{i}"),
                    "office@school.edu",
                    "Weekly Newsletter",
                    "school teacher classroom garden",
                )
            })
            .collect();
        let engine = engine(store.clone(), Arc::new(FakeMailSource::with_messages(messages)), &config);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = engine
            .run_pack(&config, config.pack("school").unwrap(), &cancel)
            .await
            .unwrap();

        assert!(summary.cancelled);
        // Every committed row is complete: items never outnumber processed messages
        let pm_count = store.count_processed_messages().unwrap();
        let item_count = store.list_pending_items(None).unwrap().len() as i64;
        assert!(item_count <= pm_count);
    }

    #[tokio::test]
    async fn test_person_assignment_flag_short_circuits() {
        let mut config = test_config();
        config.person_assignment_enabled = false;
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mail = Arc::new(FakeMailSource::with_messages(vec![message(
            "m1",
            "office@school.edu",
            "Colin's class newsletter",
            "school teacher classroom colin",
        )]));
        let engine = engine(store.clone(), mail, &config);

        engine
            .run_pack(&config, config.pack("school").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        let items = store.list_pending_items(None).unwrap();
        assert_eq!(items[0].person, SHARED_ASSIGNEE);
    }

    #[tokio::test]
    async fn test_sensitivity_off_skips_with_empty_reasons() {
        let mut config = test_config();
        config.packs[0].category_preferences = crate::types::Category::ALL
            .iter()
            .map(|c| (*c, Sensitivity::Off))
            .collect();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mail = Arc::new(FakeMailSource::with_messages(vec![message(
            "m1",
            "office@school.edu",
            "Weekly Newsletter",
            "school teacher classroom",
        )]));
        let engine = engine(store.clone(), mail, &config);

        let summary = engine
            .run_pack(&config, config.pack("school").unwrap(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.skipped_threshold, 1);
        let pm = store.get_processed_message("m1").unwrap().unwrap();
        assert_eq!(pm.extraction_status, ExtractionStatus::Skipped);
    }

    #[tokio::test]
    async fn test_pack_without_sources_is_skipped() {
        let mut config = test_config();
        config.packs[0].sources = vec![PackSource::default()];
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mail = Arc::new(FakeMailSource::default());
        let engine = engine(store.clone(), mail, &config);

        let summary = engine
            .run_pack(&config, config.pack("school").unwrap(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.listed, 0);
    }

    #[tokio::test]
    async fn test_empty_mailbox_is_quiet() {
        let config = test_config();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let engine = engine(store.clone(), Arc::new(FakeMailSource::default()), &config);

        let summary = engine
            .run_pack(&config, config.pack("school").unwrap(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.listed, 0);
        assert!(summary.is_quiet());
    }
}
