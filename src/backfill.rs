//! Historical backfill over an explicit date window.
//!
//! Deliberately guarded: a live run requires `--confirm`, and item creation
//! is capped per invocation so a wide window cannot flood the store. The
//! same idempotency keys as discovery make overlapping backfills safe.

use chrono::NaiveDate;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::discovery::{DiscoveryEngine, DiscoveryError};
use crate::error::AgentError;
use crate::mail::{build_window_query, MailSource};

/// Hard cap on items created by one backfill invocation.
pub const MAX_CREATED_PER_RUN: usize = 100;

#[derive(Debug, Default, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackfillReport {
    pub dry_run: bool,
    /// pack id → messages the window would cover.
    pub listed: Vec<(String, usize)>,
    pub created: usize,
    pub capped: bool,
}

/// Preview a backfill: list per-pack message counts without processing.
pub async fn preview(
    config: &AgentConfig,
    mail: &dyn MailSource,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<BackfillReport, AgentError> {
    let mut report = BackfillReport {
        dry_run: true,
        ..Default::default()
    };
    for pack in config.enabled_packs() {
        let Some(query) = build_window_query(pack, from, to) else {
            continue;
        };
        let ids = mail
            .list_message_ids(&query, config.processing.max_emails_per_run)
            .await
            .map_err(AgentError::Mail)?;
        report.listed.push((pack.pack_id.clone(), ids.len()));
    }
    Ok(report)
}

/// Run a backfill for real. Refuses without `confirm`; stops creating new
/// items once the per-invocation cap is reached.
pub async fn run(
    config: &AgentConfig,
    engine: &DiscoveryEngine,
    from: NaiveDate,
    to: NaiveDate,
    confirm: bool,
    cancel: &CancellationToken,
) -> Result<BackfillReport, AgentError> {
    if !confirm {
        return Err(AgentError::Usage(
            "backfill without --dry-run requires --confirm".into(),
        ));
    }
    if from > to {
        return Err(AgentError::Usage(format!(
            "backfill window is inverted: {from} > {to}"
        )));
    }

    let mut report = BackfillReport::default();
    for pack in config.enabled_packs() {
        if report.created >= MAX_CREATED_PER_RUN {
            report.capped = true;
            break;
        }
        let Some(query) = build_window_query(pack, from, to) else {
            continue;
        };
        let summary = engine
            .run_query(config, pack, &query, cancel)
            .await
            .map_err(|e| match e {
                DiscoveryError::Mail(m) => AgentError::Mail(m),
                DiscoveryError::Store(s) => AgentError::Store(s),
            })?;
        report.listed.push((pack.pack_id.clone(), summary.listed));
        report.created += summary.created + summary.deferred;
    }
    if report.created >= MAX_CREATED_PER_RUN {
        report.capped = true;
    }
    Ok(report)
}
