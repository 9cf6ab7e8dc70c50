//! Events subcommand: show the local event store.

use clap::Subcommand;

use calsync_core::{Event, SyncStatus};

use super::{open_session, Access, CliResult};

#[derive(Subcommand)]
pub enum EventsAction {
    /// List local events with their sync state
    List {
        /// Only events in this sync status (pending, synced, error, local-only)
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

pub fn run(action: EventsAction) -> CliResult {
    match action {
        EventsAction::List { status, json } => {
            let session = open_session(Access::LocalOnly)?;
            let filter = status.as_deref().map(parse_status).transpose()?;

            let mut events: Vec<Event> = session
                .engine
                .events()
                .into_iter()
                .filter(|e| filter.map_or(true, |s| e.sync_status == s))
                .collect();
            events.sort_by_key(|e| e.start_time);

            if json {
                println!("{}", serde_json::to_string_pretty(&events)?);
                return Ok(());
            }
            if events.is_empty() {
                println!("No events.");
                return Ok(());
            }

            println!(
                "{:<17} {:<10} {:<16} {:<30} ID",
                "START", "STATUS", "CALENDAR", "TITLE"
            );
            for event in &events {
                println!(
                    "{:<17} {:<10} {:<16} {:<30} {}",
                    event.start_time.format("%Y-%m-%d %H:%M"),
                    status_label(event.sync_status),
                    event.calendar_id.as_deref().unwrap_or("-"),
                    truncate(&event.title, 30),
                    event.id
                );
            }
        }
    }
    Ok(())
}

fn parse_status(raw: &str) -> Result<SyncStatus, String> {
    match raw {
        "pending" => Ok(SyncStatus::Pending),
        "synced" => Ok(SyncStatus::Synced),
        "error" => Ok(SyncStatus::Error),
        "local-only" => Ok(SyncStatus::LocalOnly),
        other => Err(format!(
            "unknown status: {other}. Valid values: pending, synced, error, local-only"
        )),
    }
}

fn status_label(status: SyncStatus) -> &'static str {
    match status {
        SyncStatus::Pending => "pending",
        SyncStatus::Synced => "synced",
        SyncStatus::Error => "error",
        SyncStatus::LocalOnly => "local-only",
    }
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut out: String = text.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}
