//! credfix - diagnose and repair Docker credential helpers
//!
//! Commands:
//! - `doctor`: interactive scan, review, consent, fix and verify
//! - `scan`: read-only quick scan
//! - `fix`: apply every automatic fix (optionally simulated)
//! - `backups`: list, restore or delete configuration backups

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use credfix_engine::consent::backup::{BackupStore, FileBackupStore};
use credfix_engine::consent::{ConsentFlow, ConsentPolicy};
use credfix_engine::doctor::console::{self, ConsoleDecisions};
use credfix_engine::doctor::events::{EventSink, ProgressEvent};
use credfix_engine::doctor::session::Scanner;
use credfix_engine::doctor::{AutomaticDecisions, DecisionProvider, Doctor, DoctorReport};
use credfix_engine::repair::{CredentialRepairer, ExecuteOptions};
use credfix_engine::{ProbeContext, Settings};

#[derive(Debug, Parser)]
#[command(name = "credfix", version, about = "Diagnose and repair Docker credential helpers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan, review the findings and fix them step by step
    Doctor {
        #[arg(long)]
        dry_run: bool,
    },
    /// Scan without changing anything
    Scan {
        /// Print the session as JSON
        #[arg(long)]
        json: bool,
    },
    /// Apply every automatic fix
    Fix {
        /// Show what would change without changing it
        #[arg(long)]
        dry_run: bool,
        /// Approve the proposal without asking
        #[arg(long, short)]
        yes: bool,
        #[arg(long)]
        stop_on_failure: bool,
    },
    /// Manage configuration backups
    Backups {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Debug, Subcommand)]
enum BackupAction {
    List,
    Restore { id: String },
    Delete { id: String },
}

/// Progress events go to the log; the console renders the results itself
struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: ProgressEvent) {
        debug!(
            "[{:?} {}%] {}",
            event.event_type,
            event.progress,
            event.message.as_deref().unwrap_or("")
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("credfix_engine=info,credfix=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load().await.context("Failed to load settings")?;

    let code = match cli.command.unwrap_or(Command::Doctor { dry_run: false }) {
        Command::Doctor { dry_run } => {
            let options = ExecuteOptions {
                dry_run: dry_run || settings.repair.dry_run,
                stop_on_failure: settings.repair.stop_on_failure,
            };
            let report = run_doctor(settings, options, &ConsoleDecisions).await?;
            report.outcome.exit_code()
        }
        Command::Scan { json } => scan(settings, json).await?,
        Command::Fix {
            dry_run,
            yes,
            stop_on_failure,
        } => {
            let options = ExecuteOptions {
                dry_run: dry_run || settings.repair.dry_run,
                stop_on_failure: stop_on_failure || settings.repair.stop_on_failure,
            };
            let decisions = if yes {
                settings.consent.policy = ConsentPolicy::Batch;
                AutomaticDecisions::approving()
            } else {
                AutomaticDecisions::asking(ConsoleDecisions)
            };
            let report = run_doctor(settings, options, &decisions).await?;
            if let Some(execution) = &report.execution {
                console::print_execution(execution);
            }
            report.outcome.exit_code()
        }
        Command::Backups { action } => backups(&settings, action)?,
    };

    std::process::exit(code);
}

async fn run_doctor(
    settings: Settings,
    options: ExecuteOptions,
    decisions: &dyn DecisionProvider,
) -> Result<DoctorReport> {
    let store: Arc<dyn BackupStore> = Arc::new(FileBackupStore::new(settings.backup_dir()?));
    let consent = ConsentFlow::new(store, settings.consent.policy);
    let ctx = ProbeContext::from_environment(settings)?;

    let mut doctor = Doctor::new(ctx, consent, Arc::new(LogSink)).with_options(options);
    let report = match doctor.run(decisions).await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("❌ {}", e);
            eprintln!("➜ {}", e.suggestion());
            return Err(e.into());
        }
    };

    info!("Doctor finished in {:?}", doctor.state());
    console::print_outcome(&report.outcome);
    Ok(report)
}

async fn scan(settings: Settings, json: bool) -> Result<i32> {
    let ctx = ProbeContext::from_environment(settings)?;
    let session_id = uuid::Uuid::new_v4().to_string();
    let session = Scanner::new(ctx.clone()).quick_scan(&session_id, &LogSink).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
    } else {
        let analysis = CredentialRepairer::new(ctx).analyze_and_repair(&session.results);
        console::print_report(&session, &analysis);
    }
    Ok(if session.is_healthy() { 0 } else { 1 })
}

fn backups(settings: &Settings, action: BackupAction) -> Result<i32> {
    let store = FileBackupStore::new(settings.backup_dir()?);

    let result = match action {
        BackupAction::List => store.list_backups().map(|records| {
            if records.is_empty() {
                println!("No backups in {}", store.root().display());
            }
            for record in records {
                let paths: Vec<String> = record.source_paths.iter().map(|p| p.display().to_string()).collect();
                println!(
                    "{}  {}  {}{}",
                    record.id,
                    record.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                    paths.join(", "),
                    if record.restorable { "" } else { "  (not restorable)" }
                );
            }
        }),
        BackupAction::Restore { id } => store.restore_backup(&id).map(|outcome| {
            for path in &outcome.restored {
                println!("⏪ restored {}", path.display());
            }
            for path in &outcome.removed {
                println!("🗑️  removed {}", path.display());
            }
        }),
        BackupAction::Delete { id } => store.delete_backup(&id).map(|()| println!("Deleted backup {}", id)),
    };

    match result {
        Ok(()) => Ok(0),
        Err(e) => {
            eprintln!("❌ {}", e);
            eprintln!("➜ {}", e.suggestion());
            Ok(1)
        }
    }
}
