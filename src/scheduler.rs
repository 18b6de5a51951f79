//! Cron-driven dispatcher for agent runs, digests, and cleanup.
//!
//! A one-minute poll loop checks each job's cron schedule and sends due
//! jobs down a channel; the single consumer in main serializes execution,
//! so an agent run never overlaps itself. Jobs missed while the process was
//! down are not re-fired.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, ConfigError};

/// Poll interval for the scheduler loop.
const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// How long shutdown waits for an in-flight job to drain.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Job {
    AgentRun,
    DailyDigest,
    WeeklyDigest,
    Cleanup,
}

struct Entry {
    job: Job,
    schedule: Schedule,
}

pub struct Scheduler {
    timezone: Tz,
    entries: Vec<Entry>,
    last_fired: HashMap<Job, DateTime<Utc>>,
    sender: mpsc::Sender<Job>,
}

/// Parse a 5-field cron expression (the cron crate wants six; seconds are
/// pinned to zero).
pub fn parse_cron(expr: &str) -> Result<Schedule, ConfigError> {
    format!("0 {expr}")
        .parse::<Schedule>()
        .map_err(|e| ConfigError::Invalid(format!("invalid cron expression '{expr}': {e}")))
}

impl Scheduler {
    pub fn new(config: &AgentConfig, sender: mpsc::Sender<Job>) -> Result<Self, ConfigError> {
        let timezone: Tz = config.defaults.timezone.parse().map_err(|_| {
            ConfigError::Invalid(format!("invalid timezone '{}'", config.defaults.timezone))
        })?;

        let mut entries = vec![
            Entry {
                job: Job::AgentRun,
                schedule: parse_cron(&config.processing.agent_cron)?,
            },
            Entry {
                job: Job::Cleanup,
                schedule: parse_cron("40 3 * * *")?,
            },
        ];
        if config.digests.enabled {
            entries.push(Entry {
                job: Job::DailyDigest,
                schedule: parse_cron(&config.digests.daily_cron)?,
            });
            entries.push(Entry {
                job: Job::WeeklyDigest,
                schedule: parse_cron(&config.digests.weekly_cron)?,
            });
        }

        Ok(Self {
            timezone,
            entries,
            last_fired: HashMap::new(),
            sender,
        })
    }

    /// Run until cancelled. On cancel, stops accepting triggers and returns;
    /// the consumer drains in-flight work under `DRAIN_TIMEOUT`.
    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("scheduler stopping");
                    return;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }

            let now = Utc::now();
            let due: Vec<Job> = self
                .entries
                .iter()
                .filter(|entry| self.is_due(entry, now))
                .map(|entry| entry.job)
                .collect();

            for job in due {
                self.last_fired.insert(job, now);
                log::info!("scheduling {job:?}");
                if self.sender.send(job).await.is_err() {
                    log::error!("job consumer is gone, scheduler stopping");
                    return;
                }
            }
        }
    }

    /// A job is due when a scheduled occurrence falls within the last poll
    /// window and has not already fired for that occurrence.
    fn is_due(&self, entry: &Entry, now: DateTime<Utc>) -> bool {
        let now_local = now.with_timezone(&self.timezone);
        let window_start = now_local - chrono::Duration::minutes(2);

        // Latest occurrence inside (window_start, now]
        let mut occurrence = None;
        for scheduled in entry.schedule.after(&window_start).take(4) {
            let utc = scheduled.with_timezone(&Utc);
            if utc > now {
                break;
            }
            occurrence = Some(utc);
        }
        let Some(occurrence) = occurrence else {
            return false;
        };
        match self.last_fired.get(&entry.job) {
            Some(last) => *last < occurrence,
            None => true,
        }
    }
}
