//! # calsync Core Library
//!
//! Action-based synchronization between a local event store and a remote
//! calendar account (Microsoft Graph). The CLI binary is a thin layer over
//! the same library.
//!
//! ## Architecture
//!
//! - **Event Store**: local authoritative list of events, persisted as one blob
//! - **Action Queue**: persisted outbox of create/update/delete intents
//! - **Sync Engine**: drains the outbox, reconciles remote changes, collapses
//!   duplicates and recovers orphaned events
//! - **Sync Service**: background worker owning the engine, driven by timers
//!   and explicit triggers
//!
//! ## Key Components
//!
//! - [`SyncEngine`]: round logic and local mutations
//! - [`SyncService`]: long-running worker with a [`SyncHandle`] client
//! - [`Database`]: SQLite key-value persistence with schema migrations
//! - [`Config`]: TOML configuration including the category to calendar mapping

pub mod error;
pub mod storage;
pub mod sync;

pub use error::{ConfigError, CoreError, StorageError, ValidationError};
pub use storage::{Config, Database, SyncConfig};
pub use sync::{
    Action, ActionQueue, CalendarClient, Event, EventStore, LocalMutation, RemoteCalendar,
    SyncEngine, SyncHandle, SyncReport, SyncService, SyncStatus, SyncTrigger, TagRouter,
};
