//! Core types for calendar synchronization.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monotonically assigned action identifier.
pub type ActionId = u64;

/// Per-event sync state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    /// New or locally modified, not yet pushed.
    #[default]
    Pending,
    Synced,
    /// Never synced and the create was dead-lettered; waits for a manual retry or edit.
    Error,
    /// Never synced outbound.
    LocalOnly,
}

/// Provenance of an event, encoded in its id prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOrigin {
    /// `local-*`: created by the user.
    Local,
    /// `timer-*`: derived from a timer session.
    Timer,
    /// `outlook-*`: imported from the remote calendar.
    Imported,
    Other,
}

impl EventOrigin {
    pub const LOCAL_PREFIX: &'static str = "local-";
    pub const TIMER_PREFIX: &'static str = "timer-";
    pub const IMPORTED_PREFIX: &'static str = "outlook-";

    pub fn from_id(id: &str) -> Self {
        if id.starts_with(Self::LOCAL_PREFIX) {
            EventOrigin::Local
        } else if id.starts_with(Self::TIMER_PREFIX) {
            EventOrigin::Timer
        } else if id.starts_with(Self::IMPORTED_PREFIX) {
            EventOrigin::Imported
        } else {
            EventOrigin::Other
        }
    }

    /// Local id for an event imported from the remote calendar.
    pub fn imported_id(remote_id: &str) -> String {
        format!("{}{}", Self::IMPORTED_PREFIX, remote_id)
    }
}

fn default_true() -> bool {
    true
}

/// The synchronizable unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    #[serde(default)]
    pub is_all_day: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub location: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub category_ids: Vec<String>,
    /// Remote calendar this event targets or lives in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,
    /// Locally authored, eligible for outbound sync.
    #[serde(default = "default_true")]
    pub remarkable_source: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<DateTime<Utc>>,
    /// Bumped on every local content or routing change.
    #[serde(default)]
    pub local_version: u64,
    /// `local_version` of the payload last accepted by the remote.
    #[serde(default)]
    pub synced_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_local_change: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_error: Option<String>,
}

impl Event {
    /// A fresh locally authored event with a `local-` id.
    pub fn new_local(title: impl Into<String>, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            id: format!("{}{}", EventOrigin::LOCAL_PREFIX, uuid::Uuid::new_v4()),
            title: title.into(),
            start_time: start,
            end_time: end,
            is_all_day: false,
            description: String::new(),
            location: String::new(),
            category_id: None,
            category_ids: Vec::new(),
            calendar_id: None,
            remarkable_source: true,
            external_id: None,
            sync_status: SyncStatus::Pending,
            last_sync_time: None,
            local_version: 0,
            synced_version: 0,
            last_local_change: None,
            sync_error: None,
        }
    }

    pub fn with_category(mut self, category_id: impl Into<String>) -> Self {
        self.category_id = Some(category_id.into());
        self
    }

    pub fn origin(&self) -> EventOrigin {
        EventOrigin::from_id(&self.id)
    }

    /// Category used for routing: the first of `category_ids`, else `category_id`.
    pub fn canonical_category(&self) -> Option<&str> {
        self.category_ids
            .first()
            .map(String::as_str)
            .or(self.category_id.as_deref())
    }

    /// Whether any field the remote calendar stores differs.
    pub fn content_differs(&self, other: &Event) -> bool {
        self.title != other.title
            || self.description != other.description
            || self.location != other.location
            || self.is_all_day != other.is_all_day
            || self.start_time != other.start_time
            || self.end_time != other.end_time
    }

    /// Whether local edits have not been accepted by the remote yet.
    ///
    /// Uses the version counters when present and falls back to timestamps.
    pub fn has_unpushed_changes(&self) -> bool {
        if self.local_version > 0 || self.synced_version > 0 {
            return self.local_version > self.synced_version;
        }
        match (self.last_local_change, self.last_sync_time) {
            (Some(changed), Some(synced)) => changed > synced,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Record a local edit.
    pub fn touch_local(&mut self, now: DateTime<Utc>) {
        self.local_version += 1;
        self.last_local_change = Some(now);
        if self.sync_status != SyncStatus::LocalOnly {
            self.sync_status = SyncStatus::Pending;
        }
    }

    /// Record that the remote accepted the payload at `version`.
    pub fn mark_pushed(&mut self, external_id: Option<String>, version: u64, now: DateTime<Utc>) {
        if external_id.is_some() {
            self.external_id = external_id;
        }
        self.synced_version = self.synced_version.max(version);
        self.last_sync_time = Some(now);
        self.sync_error = None;
        self.sync_status = if self.local_version > self.synced_version {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };
    }

    /// Whether the event takes part in outbound sync.
    pub fn is_outbound(&self) -> bool {
        self.remarkable_source && self.sync_status != SyncStatus::LocalOnly
    }
}

/// Queued mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Create,
    Update,
    Delete,
}

/// Kind of entity an action refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    #[default]
    Event,
}

/// Who caused an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ActionSource {
    #[default]
    Local,
    /// Caused by applying a remote change; never pushed back out.
    RemoteEcho,
}

/// A queued mutation intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub id: ActionId,
    #[serde(rename = "type")]
    pub action_type: ActionType,
    #[serde(default)]
    pub entity_type: EntityType,
    pub entity_id: String,
    /// Event snapshot captured at enqueue time.
    pub data: Event,
    /// Target calendar, pinned when the action was planned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calendar_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub source: ActionSource,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Debounce or backoff deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub synchronized: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synchronized_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub dead_lettered: bool,
}

impl Action {
    /// Still owed to the remote.
    pub fn is_open(&self) -> bool {
        !self.synchronized
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |t| t <= now)
    }
}

/// Intent passed to `ActionQueue::enqueue`.
#[derive(Debug, Clone)]
pub struct NewAction {
    pub action_type: ActionType,
    pub entity_id: String,
    pub data: Event,
    pub calendar_id: Option<String>,
    pub external_id: Option<String>,
    pub source: ActionSource,
}

impl NewAction {
    pub fn create(event: &Event, calendar_id: Option<String>) -> Self {
        Self {
            action_type: ActionType::Create,
            entity_id: event.id.clone(),
            data: event.clone(),
            calendar_id,
            external_id: None,
            source: ActionSource::Local,
        }
    }

    pub fn update(event: &Event, calendar_id: Option<String>) -> Self {
        Self {
            action_type: ActionType::Update,
            entity_id: event.id.clone(),
            data: event.clone(),
            calendar_id,
            external_id: event.external_id.clone(),
            source: ActionSource::Local,
        }
    }

    pub fn delete(event: &Event, calendar_id: Option<String>) -> Self {
        Self {
            action_type: ActionType::Delete,
            entity_id: event.id.clone(),
            data: event.clone(),
            calendar_id,
            external_id: event.external_id.clone(),
            source: ActionSource::Local,
        }
    }

    pub fn with_source(mut self, source: ActionSource) -> Self {
        self.source = source;
        self
    }
}

/// What `enqueue` did with a new intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Appended(ActionId),
    /// Merged into an existing unsynchronized action.
    Coalesced(ActionId),
    /// Delete of an entity that never reached the remote; nothing to send.
    LocalOnly { cancelled: Vec<ActionId> },
    /// Delete appended after cancelling pending create/update actions.
    Superseded {
        id: ActionId,
        cancelled: Vec<ActionId>,
    },
    /// Caused by the engine's own remote writes; dropped.
    EchoSuppressed,
}

impl EnqueueOutcome {
    /// The queued action carrying the intent, if any.
    pub fn action_id(&self) -> Option<ActionId> {
        match self {
            EnqueueOutcome::Appended(id)
            | EnqueueOutcome::Coalesced(id)
            | EnqueueOutcome::Superseded { id, .. } => Some(*id),
            EnqueueOutcome::LocalOnly { .. } | EnqueueOutcome::EchoSuppressed => None,
        }
    }
}

/// Sync engine state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    #[default]
    Idle,
    Draining,
    Reconciling,
}

/// Why a round started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Startup,
    Interval,
    NetworkOnline,
    Manual,
    /// Manual round that also lists every calendar in full.
    FullSync,
}

impl SyncTrigger {
    /// User-initiated rounds skip debounce and backoff waits.
    pub fn is_forced(&self) -> bool {
        matches!(self, SyncTrigger::Manual | SyncTrigger::FullSync)
    }
}

/// Summary of one sync round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub round: u64,
    pub trigger: SyncTrigger,
    pub full_listing: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Actions accepted by the remote.
    pub pushed: usize,
    /// Actions completed without a remote call.
    pub completed_locally: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub imported: usize,
    pub updated_from_remote: usize,
    pub deleted_from_remote: usize,
    pub deduplicated: usize,
    pub recovered: usize,
    pub cleaned_up: usize,
    /// The round was cut short by a stop request.
    #[serde(default)]
    pub interrupted: bool,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn new(round: u64, trigger: SyncTrigger, started_at: DateTime<Utc>) -> Self {
        Self {
            round,
            trigger,
            full_listing: false,
            started_at,
            finished_at: started_at,
            pushed: 0,
            completed_locally: 0,
            failed: 0,
            dead_lettered: 0,
            imported: 0,
            updated_from_remote: 0,
            deleted_from_remote: 0,
            deduplicated: 0,
            recovered: 0,
            cleaned_up: 0,
            interrupted: false,
            errors: Vec::new(),
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

/// Current sync status.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncOverview {
    pub state: EngineState,
    /// Last round that finished without a reconcile failure.
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Number of actions still owed to the remote.
    pub pending_count: usize,
    pub dead_letter_count: usize,
    /// Events in `error` status.
    pub error_count: usize,
    pub last_report: Option<SyncReport>,
}

/// Remote calendar errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Calendar API error {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Unauthorized after token refresh")]
    Unauthorized,

    #[error("Rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Remote event not found")]
    NotFound,

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Credential provider error: {0}")]
    Credentials(String),

    #[error("Invalid remote payload: {0}")]
    Payload(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("No calendar route for event '{0}'")]
    Unroutable(String),
}

impl SyncError {
    /// Transient failures are retried with backoff; the rest dead-letter at once.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Http { status, .. } => *status >= 500 || *status == 408,
            SyncError::RateLimited { .. } | SyncError::Timeout | SyncError::Network(_) => true,
            SyncError::Unauthorized
            | SyncError::NotFound
            | SyncError::Credentials(_)
            | SyncError::Payload(_)
            | SyncError::Serialization(_)
            | SyncError::Unroutable(_) => false,
        }
    }

    /// HTTP status when the remote answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::Http { status, .. } => Some(*status),
            SyncError::Unauthorized => Some(401),
            SyncError::NotFound => Some(404),
            SyncError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SyncError::Timeout
        } else if err.is_decode() {
            SyncError::Payload(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for SyncError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        SyncError::Timeout
    }
}
