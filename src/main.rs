use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use outreach_pipeline::config::{self, Config, StageKind, TransportKind};
use outreach_pipeline::db::{self, PgQueueStore};
use outreach_pipeline::dispatch::{self, Mailbox};
use outreach_pipeline::notes::NoteFilter;
use outreach_pipeline::pipeline::{DraftStage, Orchestrator, PassSettings, PassSummary, SendStage};
use outreach_pipeline::render::Template;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file; environment variables override its values
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Render drafts for the oldest `qualified` items
    Draft {
        /// Maximum number of items to claim
        #[arg(long)]
        batch_size: Option<usize>,

        /// Template file with an optional `Subject:` first line
        #[arg(long)]
        template: Option<PathBuf>,
    },
    /// Deliver `draft_ready` items one by one
    Send {
        /// Maximum number of items to attempt in this pass
        #[arg(long)]
        limit: Option<usize>,

        /// Pause between items, in seconds
        #[arg(long)]
        throttle_secs: Option<f64>,

        /// Only send items whose notes contain this text (case-insensitive)
        #[arg(long)]
        note_filter: Option<String>,

        /// Log messages instead of delivering them
        #[arg(long)]
        dry_run: bool,
    },
    /// Print item counts per status
    Stats,
    /// Print an example YAML configuration
    ConfigExample,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let Args {
        config: config_path,
        command,
    } = Args::parse();
    let load = || config::load(config_path.as_deref());

    match command {
        Command::ConfigExample => print!("{}", config::example()),
        Command::Draft {
            batch_size,
            template,
        } => {
            let mut cfg = load()?;
            if let Some(n) = batch_size {
                cfg.queue.batch_size = n;
            }
            if let Some(path) = template {
                cfg.draft.template_path = path;
            }
            let summary = run_draft(&cfg).await?;
            print_summary("draft", &summary);
        }
        Command::Send {
            limit,
            throttle_secs,
            note_filter,
            dry_run,
        } => {
            let mut cfg = load()?;
            if let Some(n) = limit {
                cfg.queue.send_limit = n;
            }
            if let Some(secs) = throttle_secs {
                cfg.queue.throttle_seconds = secs;
            }
            if let Some(filter) = note_filter {
                cfg.queue.note_filter = Some(filter);
            }
            if dry_run {
                cfg.transport.kind = TransportKind::DryRun;
            }
            let summary = run_send(&cfg).await?;
            print_summary("send", &summary);
        }
        Command::Stats => {
            let cfg = load()?;
            cfg.validate_for(StageKind::Inspect)?;
            let store = connect(&cfg).await?;
            for (status, count) in store.count_by_status().await? {
                println!("{:<12} {count}", status.as_str());
            }
        }
    }
    Ok(())
}

async fn connect(cfg: &Config) -> Result<PgQueueStore> {
    let pool = db::init_pool(&cfg.database)
        .await
        .with_context(|| format!("connecting to {}:{}", cfg.database.host, cfg.database.port))?;
    db::run_migrations(&pool).await?;
    Ok(PgQueueStore::new(pool))
}

async fn run_draft(cfg: &Config) -> Result<PassSummary> {
    cfg.validate_for(StageKind::Draft)?;
    let template = Template::load(&cfg.draft.template_path)
        .await?
        .with_default_subject(cfg.draft.default_subject.clone());

    let store = connect(cfg).await?;
    let stage = DraftStage::new(template, &cfg.draft.actor);
    let orchestrator = Orchestrator::new(
        &store,
        PassSettings {
            batch_size: cfg.queue.batch_size,
            throttle: std::time::Duration::ZERO,
        },
    );
    Ok(orchestrator.run(&stage).await?)
}

async fn run_send(cfg: &Config) -> Result<PassSummary> {
    cfg.validate_for(StageKind::Send)?;
    let dispatcher = dispatch::from_config(cfg)?;
    let from_email = cfg
        .transport
        .from_email
        .as_deref()
        .context("FROM_EMAIL is required for sending")?;
    let note_filter = NoteFilter::parse(cfg.queue.note_filter.as_deref());
    info!(
        transport = dispatcher.transport(),
        limit = cfg.queue.send_limit,
        note_filter = note_filter.as_ref().map(|f| f.as_str()).unwrap_or(""),
        "starting send pass"
    );

    let store = connect(cfg).await?;
    let stage = SendStage::new(
        &*dispatcher,
        Mailbox::new(from_email, Some(&cfg.transport.from_name)),
        cfg.transport.timeout(),
    )
    .with_reply_to(cfg.transport.reply_to.clone())
    .with_note_filter(note_filter);
    let orchestrator = Orchestrator::new(
        &store,
        PassSettings {
            batch_size: cfg.queue.send_limit,
            throttle: cfg.queue.throttle(),
        },
    );
    Ok(orchestrator.run(&stage).await?)
}

fn print_summary(stage: &str, summary: &PassSummary) {
    if summary.is_empty() {
        println!("{stage}: nothing to do");
    } else {
        println!(
            "{stage}: claimed={} ok={} fail={}",
            summary.claimed, summary.succeeded, summary.failed
        );
    }
}
