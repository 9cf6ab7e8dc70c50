//! Orphan recovery for events that never got an outbox entry.
//!
//! An event can end up pending without any queued action when it was saved
//! while its category had no calendar mapping, or when the process stopped
//! between the event write and the queue write. Recovery finds those events
//! and enqueues the missing create.
//!
//! ## Usage
//! ```rust,ignore
//! let summary = recover_orphans(&store, &mut queue, &router);
//! for event in &summary.recovered {
//!     println!("{} -> {}", event.id, event.calendar_id);
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::sync::action_queue::ActionQueue;
use crate::sync::event_store::EventStore;
use crate::sync::router::TagRouter;
use crate::sync::types::{Event, NewAction, SyncStatus};

/// An event a create was enqueued for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveredEvent {
    pub id: String,
    pub title: String,
    pub calendar_id: String,
}

/// Outcome of a recovery pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverySummary {
    /// Orphans found.
    pub total_found: usize,
    pub recovered: Vec<RecoveredEvent>,
    /// Orphans whose create was rejected by the queue.
    pub failed: Vec<(String, String)>,
}

impl RecoverySummary {
    pub fn has_recoveries(&self) -> bool {
        !self.recovered.is_empty()
    }
}

/// Whether `event` is pending, unsynced, routable and absent from the queue.
pub fn is_orphan(event: &Event, queue: &ActionQueue, router: &TagRouter) -> bool {
    event.sync_status == SyncStatus::Pending
        && event.remarkable_source
        && event.external_id.is_none()
        && router.has_explicit_route(event)
        && !queue.has_entry_for(&event.id)
}

/// Events that need a create enqueued.
pub fn find_orphans<'a>(
    store: &'a EventStore,
    queue: &ActionQueue,
    router: &TagRouter,
) -> Vec<&'a Event> {
    store
        .iter()
        .filter(|e| is_orphan(e, queue, router))
        .collect()
}

/// Enqueue a create for every orphan.
pub fn recover_orphans(
    store: &EventStore,
    queue: &mut ActionQueue,
    router: &TagRouter,
) -> RecoverySummary {
    let orphans: Vec<Event> = find_orphans(store, queue, router)
        .into_iter()
        .cloned()
        .collect();

    let mut summary = RecoverySummary {
        total_found: orphans.len(),
        ..RecoverySummary::default()
    };

    for event in orphans {
        let Some(calendar_id) = router.resolve(&event) else {
            continue;
        };
        match queue.enqueue(NewAction::create(&event, Some(calendar_id.clone()))) {
            Ok(_) => {
                tracing::info!(event_id = %event.id, calendar_id = %calendar_id, "recovered orphaned event");
                summary.recovered.push(RecoveredEvent {
                    id: event.id,
                    title: event.title,
                    calendar_id,
                });
            }
            Err(e) => {
                tracing::warn!(event_id = %event.id, error = %e, "could not recover orphaned event");
                summary.failed.push((event.id, e.to_string()));
            }
        }
    }

    summary
}
