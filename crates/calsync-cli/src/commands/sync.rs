//! Sync subcommand: run rounds against the remote calendar and show status.

use clap::Subcommand;

use calsync_core::storage::database::SharedDatabase;
use calsync_core::{SyncReport, SyncService, SyncTrigger};

use super::{open_session, runtime, Access, CliResult};

/// Key under which the CLI keeps the report of the last round it ran.
const LAST_REPORT_KEY: &str = "cli.last_report";

#[derive(Subcommand)]
pub enum SyncAction {
    /// Run one sync round now
    Now {
        /// Print the round report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a round that lists every mapped calendar in full
    Full {
        #[arg(long)]
        json: bool,
    },
    /// Show queue counts and the last round's report
    Status {
        #[arg(long)]
        json: bool,
    },
}

pub fn run(action: SyncAction) -> CliResult {
    match action {
        SyncAction::Now { json } => run_round(SyncTrigger::Manual, json),
        SyncAction::Full { json } => run_round(SyncTrigger::FullSync, json),
        SyncAction::Status { json } => show_status(json),
    }
}

fn run_round(trigger: SyncTrigger, json: bool) -> CliResult {
    let session = open_session(Access::Remote)?;
    let database = session.database;
    let rt = runtime()?;

    let report = rt.block_on(async {
        let service = SyncService::start(session.engine)?;
        let handle = service.handle();
        let report = match trigger {
            SyncTrigger::FullSync => handle.full_sync().await,
            _ => handle.sync_now().await,
        };
        service.stop().await?;
        report
    })?;
    save_report(&database, &report)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.errors.is_empty() {
        Ok(())
    } else {
        Err(format!("round finished with {} error(s)", report.errors.len()).into())
    }
}

fn show_status(json: bool) -> CliResult {
    let session = open_session(Access::LocalOnly)?;
    let overview = session.engine.overview();
    let last = load_report(&session.database)?;

    if json {
        let value = serde_json::json!({
            "pending": overview.pending_count,
            "dead_lettered": overview.dead_letter_count,
            "errors": overview.error_count,
            "events": session.engine.events().len(),
            "last_report": last,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Sync Status:");
    println!("  Events:         {}", session.engine.events().len());
    println!("  Pending:        {}", overview.pending_count);
    println!("  Dead-lettered:  {}", overview.dead_letter_count);
    println!("  Errored events: {}", overview.error_count);
    match last {
        Some(report) => {
            println!();
            println!("Last round:");
            print_report(&report);
        }
        None => println!("  Last round:     never"),
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    println!(
        "  Round {} ({:?}) finished at {}",
        report.round,
        report.trigger,
        report.finished_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!("  Pushed:    {}", report.pushed);
    println!("  Failed:    {} ({} dead-lettered)", report.failed, report.dead_lettered);
    println!(
        "  Pulled:    {} imported, {} updated, {} deleted",
        report.imported, report.updated_from_remote, report.deleted_from_remote
    );
    if report.deduplicated > 0 {
        println!("  Merged duplicates: {}", report.deduplicated);
    }
    if report.interrupted {
        println!("  Stopped early; remaining actions stay queued");
    }
    for error in &report.errors {
        println!("  error: {error}");
    }
}

fn save_report(database: &SharedDatabase, report: &SyncReport) -> CliResult {
    let db = database.lock().map_err(|_| "database lock poisoned")?;
    db.kv_set(LAST_REPORT_KEY, &serde_json::to_string(report)?)?;
    Ok(())
}

fn load_report(
    database: &SharedDatabase,
) -> Result<Option<SyncReport>, Box<dyn std::error::Error>> {
    let db = database.lock().map_err(|_| "database lock poisoned")?;
    let Some(raw) = db.kv_get(LAST_REPORT_KEY)? else {
        return Ok(None);
    };
    // A report from an older version is not worth failing over.
    Ok(serde_json::from_str(&raw).ok())
}
