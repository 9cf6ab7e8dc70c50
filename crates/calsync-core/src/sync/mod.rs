//! Action-based calendar synchronization.
//!
//! Local edits go into the event store and an outbox of create/update/delete
//! actions. A single worker drains the outbox against the remote calendar,
//! then pulls remote changes back in.

pub mod action_queue;
pub mod calendar_client;
pub mod conflict_resolver;
pub mod event_codec;
pub mod event_store;
pub mod migration;
pub mod recovery;
pub mod retry;
pub mod router;
pub mod service;
pub mod sync_engine;
pub mod types;

#[cfg(test)]
mod action_queue_tests;
#[cfg(test)]
mod conflict_resolver_tests;
#[cfg(test)]
mod migration_tests;

pub use action_queue::{ActionQueue, FailureOutcome, QueueCounts};
pub use calendar_client::{CalendarClient, CredentialProvider, ListQuery, RemoteCalendar, StaticToken};
pub use conflict_resolver::{DedupGroup, MergeDecision};
pub use event_codec::{EventPayload, RemoteEvent};
pub use event_store::{ChangeOrigin, EventStore, StoreChange};
pub use migration::{MigrationPlan, PlanKind, PlannedAction};
pub use recovery::RecoverySummary;
pub use retry::RetryPolicy;
pub use router::{CalendarMapping, TagRouter};
pub use service::{SyncHandle, SyncService};
pub use sync_engine::{LocalMutation, SyncEngine};
pub use types::{
    Action, ActionId, ActionSource, ActionType, EngineState, EnqueueOutcome, Event, NewAction,
    SyncError, SyncOverview, SyncReport, SyncStatus, SyncTrigger,
};
