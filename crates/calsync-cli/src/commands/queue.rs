//! Queue subcommand: inspect the outbox and manage dead-lettered actions.

use clap::Subcommand;

use calsync_core::sync::ActionId;
use calsync_core::Action;

use super::{open_session, Access, CliResult};

#[derive(Subcommand)]
pub enum QueueAction {
    /// List actions still owed to the remote calendar
    List {
        #[arg(long)]
        json: bool,
    },
    /// List dead-lettered actions
    Dead {
        #[arg(long)]
        json: bool,
    },
    /// Put a dead-lettered action back in the queue
    Retry {
        /// Action id
        id: ActionId,
    },
    /// Put every dead-lettered action back in the queue
    RetryAll,
    /// Drop a dead-lettered action without syncing it
    Discard {
        /// Action id
        id: ActionId,
    },
}

pub fn run(action: QueueAction) -> CliResult {
    let mut session = open_session(Access::LocalOnly)?;
    let engine = &mut session.engine;

    match action {
        QueueAction::List { json } => {
            let actions: Vec<Action> = engine.queue().list_pending().into_iter().cloned().collect();
            print_actions(&actions, json, "No pending actions.")?;
        }
        QueueAction::Dead { json } => {
            print_actions(&engine.dead_letters(), json, "No dead-lettered actions.")?;
        }
        QueueAction::Retry { id } => {
            engine.retry_dead_letter(id)?;
            println!("Action {id} requeued");
        }
        QueueAction::RetryAll => {
            let revived = engine.retry_all_dead_letters()?;
            println!("{revived} action(s) requeued");
        }
        QueueAction::Discard { id } => {
            let action = engine.discard_dead_letter(id)?;
            println!(
                "Discarded {:?} for {}",
                action.action_type, action.entity_id
            );
        }
    }
    Ok(())
}

fn print_actions(actions: &[Action], json: bool, empty: &str) -> CliResult {
    if json {
        println!("{}", serde_json::to_string_pretty(actions)?);
        return Ok(());
    }
    if actions.is_empty() {
        println!("{empty}");
        return Ok(());
    }

    println!(
        "{:<6} {:<8} {:<40} {:<20} {:>7}  ERROR",
        "ID", "TYPE", "ENTITY", "CALENDAR", "RETRIES"
    );
    for action in actions {
        println!(
            "{:<6} {:<8} {:<40} {:<20} {:>7}  {}",
            action.id,
            format!("{:?}", action.action_type).to_lowercase(),
            action.entity_id,
            action.calendar_id.as_deref().unwrap_or("-"),
            action.retry_count,
            action.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
