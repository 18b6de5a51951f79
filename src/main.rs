//! CLI surface: discover, digest, audit, dismiss, backfill, migrate, run.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use hearth::assign::PersonAssigner;
use hearth::backfill;
use hearth::classify::{llm::AnthropicModel, ItemTypeClassifier};
use hearth::config::{AgentConfig, EnvSettings};
use hearth::digest;
use hearth::discovery::DiscoveryEngine;
use hearth::error::{exit_code, AgentError};
use hearth::mail::{auth::TokenProvider, gmail::GmailClient, MailSource};
use hearth::orchestrator::Orchestrator;
use hearth::reconcile;
use hearth::scheduler::{Job, Scheduler, DRAIN_TIMEOUT};
use hearth::store::Store;
use hearth::types::AgentMode;

#[derive(Parser)]
#[command(name = "hearth", about = "Household email concierge", version)]
struct Cli {
    /// Path to the YAML config (default: ~/.hearth/config.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DigestMode {
    Daily,
    Reconciliation,
}

#[derive(Subcommand)]
enum Command {
    /// Run discovery for one pack
    Discover { pack_id: String },

    /// Build and send a digest
    Digest {
        #[arg(long, value_enum, default_value = "daily")]
        mode: DigestMode,
    },

    /// Print the reconciliation view for a person; optionally append
    /// forward-only config rules
    Audit {
        person: String,
        /// Append a sender domain to a pack: --add-domain <domain> <pack>
        #[arg(long, num_args = 2, value_names = ["DOMAIN", "PACK"])]
        add_domain: Option<Vec<String>>,
        /// Append an exclusion keyword to every pack
        #[arg(long, value_name = "KEYWORD")]
        exclude_keyword: Option<String>,
    },

    /// Dismiss an item, with a reason
    Dismiss { item_id: String, reason: String },

    /// Historical scan over an explicit window
    Backfill {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        confirm: bool,
    },

    /// Apply migrations, or roll back: migrate [VERSION | rollback VERSION]
    Migrate { args: Vec<String> },

    /// Run the resident scheduler
    Run,
}

fn init_logging() {
    let mut builder = env_logger::Builder::new();
    builder.parse_filters(&std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into()));
    if let Ok(path) = std::env::var("LOG_FILE") {
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                builder.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("could not open LOG_FILE {path}: {e}"),
        }
    }
    builder.init();
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_default()
            .join(".hearth")
            .join("config.yaml")
    })
}

struct App {
    env: EnvSettings,
    config: AgentConfig,
    store: Arc<Store>,
}

impl App {
    fn load(cli: &Cli) -> Result<Self, AgentError> {
        let env = EnvSettings::from_env()?;
        let config = AgentConfig::load(&config_path(cli), &env)?;
        let store = Arc::new(Store::open(&env.resolve_db_path()?)?);
        Ok(Self { env, config, store })
    }

    fn mail(&self) -> Result<Arc<dyn MailSource>, AgentError> {
        let tokens = TokenProvider::from_env(&self.env)?;
        Ok(Arc::new(GmailClient::new(tokens)))
    }

    fn engine(&self, mail: Arc<dyn MailSource>) -> DiscoveryEngine {
        let model = self
            .env
            .anthropic_api_key
            .clone()
            .map(|key| Box::new(AnthropicModel::new(key)) as Box<dyn hearth::classify::ItemTypeModel>);
        DiscoveryEngine::new(
            self.store.clone(),
            mail,
            PersonAssigner::new(&self.config.family),
            ItemTypeClassifier::new(model),
            &self.config,
        )
    }

    fn orchestrator(&self, mail: Arc<dyn MailSource>) -> Orchestrator {
        Orchestrator::new(self.store.clone(), self.engine(mail))
    }
}

async fn run_digest(app: &App, mode: DigestMode) -> Result<(), AgentError> {
    let end = Utc::now();
    let days = match mode {
        DigestMode::Daily => 1,
        DigestMode::Reconciliation => 7,
    };
    let start = end - chrono::Duration::days(days);
    let dry_run = app.config.mode == AgentMode::DryRun;

    let built = digest::build(&app.store, start, end, dry_run)?;
    let text = digest::render_text(&built);

    let recipients = &app.config.notifications.digest_to;
    if dry_run || recipients.is_empty() {
        println!("{text}");
        return Ok(());
    }

    let subject_label = if built.is_quiet() { "Quiet week" } else { "Family digest" };
    let mime = format!(
        "To: {}\r\nSubject: {} {} to {}\r\nContent-Type: text/plain; charset=\"UTF-8\"\r\n\r\n{}",
        recipients.join(", "),
        subject_label,
        built.start.format("%b %-d"),
        built.end.format("%b %-d"),
        text
    );
    app.mail()?.send_email(&mime).await?;
    log::info!("digest sent to {}", recipients.join(", "));
    Ok(())
}

fn run_migrate(app: &App, args: &[String]) -> Result<(), AgentError> {
    match args {
        [] => {
            println!("schema at version {}", app.store.schema_version()?);
            Ok(())
        }
        [version] => {
            let target: i32 = version
                .parse()
                .map_err(|_| AgentError::Usage(format!("invalid version '{version}'")))?;
            // Opening the store already migrated forward; an explicit lower
            // target walks the schema back to it.
            app.store.rollback_to(target)?;
            println!("schema at version {}", app.store.schema_version()?);
            Ok(())
        }
        [keyword, version] if keyword == "rollback" => {
            let target: i32 = version
                .parse()
                .map_err(|_| AgentError::Usage(format!("invalid version '{version}'")))?;
            let undone = app.store.rollback_to(target)?;
            println!(
                "rolled back {undone} migrations; schema at version {}",
                app.store.schema_version()?
            );
            Ok(())
        }
        _ => Err(AgentError::Usage(
            "usage: migrate [VERSION | rollback VERSION]".into(),
        )),
    }
}

async fn run_resident(app: &App) -> Result<(), AgentError> {
    let mail = app.mail()?;
    let orchestrator = Arc::new(app.orchestrator(mail));

    let (tx, mut rx) = mpsc::channel::<Job>(8);
    let scheduler = Scheduler::new(&app.config, tx)?;
    let cancel = CancellationToken::new();

    let scheduler_task = tokio::spawn(scheduler.run(cancel.clone()));

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        log::info!("shutdown requested");
        shutdown.cancel();
    });

    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        // Jobs run serialized here; an agent run never overlaps itself.
        let outcome: Result<(), AgentError> = match job {
            Job::AgentRun => orchestrator
                .run(&app.config, &cancel)
                .await
                .map(|report| {
                    log::info!(
                        "run complete: {} packs, {} failed, {} promoted",
                        report.summaries.len(),
                        report.failed_packs.len(),
                        report.promoted
                    );
                })
                .map_err(AgentError::Store),
            Job::DailyDigest => run_digest(app, DigestMode::Daily).await,
            Job::WeeklyDigest => run_digest(app, DigestMode::Reconciliation).await,
            Job::Cleanup => app
                .store
                .cleanup_expired_tokens(Utc::now() - chrono::Duration::days(30))
                .map(|removed| log::info!("cleanup removed {removed} tokens"))
                .map_err(AgentError::Store),
        };
        if let Err(e) = outcome {
            // The next scheduled run proceeds regardless.
            log::error!("job {job:?} failed: {e}");
        }
    }

    // Give the scheduler its drain window, then go.
    let _ = tokio::time::timeout(DRAIN_TIMEOUT, scheduler_task).await;
    Ok(())
}

async fn run(cli: Cli) -> Result<(), AgentError> {
    match &cli.command {
        Command::Discover { pack_id } => {
            let app = App::load(&cli)?;
            let pack = app
                .config
                .pack(pack_id)
                .ok_or_else(|| AgentError::Usage(format!("unknown pack '{pack_id}'")))?;
            let mail = app.mail()?;
            let engine = app.engine(mail);
            let summary = engine
                .run_pack(&app.config, pack, &CancellationToken::new())
                .await
                .map_err(|e| match e {
                    hearth::discovery::DiscoveryError::Mail(m) => AgentError::Mail(m),
                    hearth::discovery::DiscoveryError::Store(s) => AgentError::Store(s),
                })?;
            println!(
                "{}: {} listed, {} created, {} deferred, {} out of scope, {} skipped",
                summary.pack_id,
                summary.listed,
                summary.created,
                summary.deferred,
                summary.out_of_scope,
                summary.skipped_threshold + summary.skipped_transient,
            );
            Ok(())
        }

        Command::Digest { mode } => {
            let app = App::load(&cli)?;
            run_digest(&app, *mode).await
        }

        Command::Audit {
            person,
            add_domain,
            exclude_keyword,
        } => {
            let app = App::load(&cli)?;
            let path = config_path(&cli);

            if let Some(pair) = add_domain {
                let (domain, pack_id) = (&pair[0], &pair[1]);
                let count = reconcile::add_domain(&app.store, &path, pack_id, domain)?;
                println!("added {domain} to {pack_id}; {count} recent messages would now match");
                return Ok(());
            }
            if let Some(keyword) = exclude_keyword {
                let packs: Vec<String> =
                    app.config.packs.iter().map(|p| p.pack_id.clone()).collect();
                for pack_id in packs {
                    reconcile::add_exclude_keyword(&path, &pack_id, keyword)?;
                }
                println!("added exclusion {keyword:?} (forward-only)");
                return Ok(());
            }

            let text = reconcile::view(&app.store, person, Utc::now().date_naive())?;
            print!("{text}");
            Ok(())
        }

        Command::Dismiss { item_id, reason } => {
            if reason.trim().is_empty() {
                return Err(AgentError::Usage("dismiss requires a non-empty reason".into()));
            }
            let app = App::load(&cli)?;
            let dismissed =
                app.store
                    .dismiss_item(item_id, reason, &app.config.defaults.dismissed_by)?;
            println!("dismissed {} ({})", dismissed.original_subject, dismissed.reason);
            Ok(())
        }

        Command::Backfill {
            from,
            to,
            dry_run,
            confirm,
        } => {
            let app = App::load(&cli)?;
            let mail = app.mail()?;
            if *dry_run {
                let report = backfill::preview(&app.config, mail.as_ref(), *from, *to).await?;
                for (pack_id, listed) in &report.listed {
                    println!("{pack_id}: {listed} messages in window");
                }
                return Ok(());
            }
            let engine = app.engine(mail);
            let report = backfill::run(
                &app.config,
                &engine,
                *from,
                *to,
                *confirm,
                &CancellationToken::new(),
            )
            .await?;
            println!(
                "backfill created {} items{}",
                report.created,
                if report.capped { " (cap reached)" } else { "" }
            );
            Ok(())
        }

        Command::Migrate { args } => {
            let app = App::load(&cli)?;
            run_migrate(&app, args)
        }

        Command::Run => {
            let app = App::load(&cli)?;
            run_resident(&app).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::from(exit_code::OK as u8),
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
