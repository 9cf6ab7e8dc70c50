//! Sync engine: local mutations, outbox drain and remote reconciliation.
//!
//! The engine is the single writer of the event store and the action queue.
//! A round runs `idle -> draining -> reconciling -> idle`:
//!
//! 1. drain ready outbox actions, up to `max_in_flight` remote calls at a time
//! 2. list remote changes, merge them, collapse duplicates
//! 3. recover orphaned events, archive synchronized actions, persist

use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use crate::error::{Result, ValidationError};
use crate::storage::{PayloadSource, SharedDatabase, SyncConfig};
use crate::sync::action_queue::{ActionQueue, FailureOutcome};
use crate::sync::calendar_client::{ListQuery, RemoteCalendar};
use crate::sync::conflict_resolver::{apply_remote_content, decide_merge, find_duplicates, MergeDecision};
use crate::sync::event_codec::{import_remote_event, payload_for, remote_differs, EventPayload, RemoteEvent, SyncNote};
use crate::sync::event_store::{ChangeOrigin, EventStore, StoreChange};
use crate::sync::migration::{self, PlanKind};
use crate::sync::recovery::{recover_orphans, RecoverySummary};
use crate::sync::retry::RetryPolicy;
use crate::sync::router::TagRouter;
use crate::sync::types::{
    Action, ActionId, ActionType, EngineState, Event, EventOrigin, NewAction, SyncError,
    SyncOverview, SyncReport, SyncStatus, SyncTrigger,
};

/// Callback run between drain waves and calendar listings.
///
/// The service uses it to apply queued commands while a round is running.
/// Returning `Break` ends the round early: calls already in flight finish,
/// nothing new is sent or listed, and the round still persists.
pub type RoundHook<'a> = dyn FnMut(&mut SyncEngine) -> ControlFlow<()> + Send + 'a;

/// A local change to the event store.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalMutation {
    Create(Event),
    Update(Event),
    Delete { id: String },
}

/// Remote request derived from an action.
#[derive(Debug, Clone)]
enum RemoteCall {
    Create {
        calendar_id: String,
        payload: EventPayload,
    },
    Update {
        calendar_id: String,
        external_id: String,
        payload: EventPayload,
    },
    Delete {
        calendar_id: String,
        external_id: String,
    },
}

impl RemoteCall {
    fn action_type(&self) -> ActionType {
        match self {
            RemoteCall::Create { .. } => ActionType::Create,
            RemoteCall::Update { .. } => ActionType::Update,
            RemoteCall::Delete { .. } => ActionType::Delete,
        }
    }

    fn calendar_id(&self) -> &str {
        match self {
            RemoteCall::Create { calendar_id, .. }
            | RemoteCall::Update { calendar_id, .. }
            | RemoteCall::Delete { calendar_id, .. } => calendar_id,
        }
    }

    async fn execute(&self, remote: &dyn RemoteCalendar) -> std::result::Result<Option<String>, SyncError> {
        match self {
            RemoteCall::Create {
                calendar_id,
                payload,
            } => remote.create_event(calendar_id, payload).await.map(Some),
            RemoteCall::Update {
                calendar_id,
                external_id,
                payload,
            } => remote
                .update_event(calendar_id, external_id, payload)
                .await
                .map(|_| None),
            RemoteCall::Delete {
                calendar_id,
                external_id,
            } => remote
                .delete_event(calendar_id, external_id)
                .await
                .map(|_| None),
        }
    }
}

/// How a ready action will be handled.
enum Prepared {
    /// Nothing to send; complete without a remote call.
    Local(&'static str),
    Remote(RemoteCall),
}

/// Bookkeeping for one in-flight remote call.
struct InFlight {
    action_id: ActionId,
    entity_id: String,
    call: RemoteCall,
    /// `local_version` of the payload sent.
    version: u64,
    /// Snapshot, used to compensate a create whose action was cancelled mid-flight.
    snapshot: Event,
}

/// Drives synchronization between the local event store and one remote account.
pub struct SyncEngine {
    store: EventStore,
    queue: ActionQueue,
    router: TagRouter,
    remote: Arc<dyn RemoteCalendar>,
    config: SyncConfig,
    retry: RetryPolicy,
    state: EngineState,
    round: u64,
    last_reconcile_at: Option<DateTime<Utc>>,
    needs_full_sync: bool,
    selection: Option<String>,
    last_sync_at: Option<DateTime<Utc>>,
    last_report: Option<SyncReport>,
}

impl SyncEngine {
    pub fn new(
        store: EventStore,
        queue: ActionQueue,
        router: TagRouter,
        remote: Arc<dyn RemoteCalendar>,
        config: SyncConfig,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config);
        Self {
            store,
            queue,
            router,
            remote,
            config,
            retry,
            state: EngineState::Idle,
            round: 0,
            last_reconcile_at: None,
            needs_full_sync: true,
            selection: None,
            last_sync_at: None,
            last_report: None,
        }
    }

    /// Load both stores from `database`.
    pub fn open(
        database: SharedDatabase,
        router: TagRouter,
        remote: Arc<dyn RemoteCalendar>,
        config: SyncConfig,
    ) -> Result<Self> {
        let store = EventStore::open(database.clone())?;
        let queue = ActionQueue::open(database)?.with_debounce(config.debounce());
        Ok(Self::new(store, queue, router, remote, config))
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn router(&self) -> &TagRouter {
        &self.router
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn events(&self) -> Vec<Event> {
        self.store.get_all()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }

    /// Replace the mapping table. The next round lists every calendar in full.
    pub fn set_router(&mut self, router: TagRouter) {
        self.router = router;
        self.needs_full_sync = true;
    }

    /// Event currently selected in the UI, preferred on dedup ties.
    pub fn set_selection(&mut self, selection: Option<String>) {
        self.selection = selection;
    }

    pub fn request_full_sync(&mut self) {
        self.needs_full_sync = true;
    }

    /// Recover orphans left by an earlier run.
    pub fn startup(&mut self) -> Result<RecoverySummary> {
        let summary = recover_orphans(&self.store, &mut self.queue, &self.router);
        if summary.has_recoveries() {
            tracing::info!(recovered = summary.recovered.len(), "startup recovery enqueued creates");
        }
        self.persist()?;
        Ok(summary)
    }

    // ========================================================================
    // Local mutations
    // ========================================================================

    pub fn apply(&mut self, mutation: LocalMutation) -> Result<()> {
        match mutation {
            LocalMutation::Create(event) => self.create_event(event).map(|_| ()),
            LocalMutation::Update(event) => self.update_event(event).map(|_| ()),
            LocalMutation::Delete { id } => self.delete_event(&id).map(|_| ()),
        }
    }

    /// Store a new event and enqueue its create.
    ///
    /// Events with no resolvable calendar are stored without an action;
    /// orphan recovery picks them up once a mapping exists.
    pub fn create_event(&mut self, mut event: Event) -> Result<Event> {
        validate_range(&event)?;
        if self.store.contains(&event.id) {
            return Err(ValidationError::DuplicateEntity {
                entity_id: event.id,
            }
            .into());
        }

        let now = Utc::now();
        event.touch_local(now);
        if event.is_outbound() {
            match self.router.resolve(&event) {
                Some(calendar_id) => {
                    self.queue
                        .enqueue_at(NewAction::create(&event, Some(calendar_id)), now)?;
                }
                None => tracing::debug!(event_id = %event.id, "no calendar route yet"),
            }
        }

        self.store.upsert(event.clone(), ChangeOrigin::Local);
        self.persist()?;
        Ok(event)
    }

    /// Apply an edit and enqueue the remote actions the migration planner calls for.
    pub fn update_event(&mut self, changed: Event) -> Result<Event> {
        validate_range(&changed)?;
        let before = self
            .store
            .get_by_id(&changed.id)
            .cloned()
            .ok_or_else(|| ValidationError::EntityNotFound {
                entity_id: changed.id.clone(),
            })?;

        let mut after = before.clone();
        after.title = changed.title;
        after.description = changed.description;
        after.location = changed.location;
        after.start_time = changed.start_time;
        after.end_time = changed.end_time;
        after.is_all_day = changed.is_all_day;
        after.category_id = changed.category_id;
        after.category_ids = changed.category_ids;
        after.calendar_id = changed.calendar_id;

        if !after.content_differs(&before) && !migration::routing_changed(&before, &after) {
            return Ok(before);
        }

        let now = Utc::now();
        after.touch_local(now);

        if after.is_outbound() {
            let plan = migration::plan(&before, &after, &self.router);
            match plan.kind {
                PlanKind::InPlace => {
                    self.queue
                        .enqueue_at(NewAction::update(&after, plan.target_calendar), now)?;
                }
                PlanKind::Migration => {
                    tracing::info!(
                        event_id = %after.id,
                        from = ?plan.source_calendar,
                        to = ?plan.target_calendar,
                        "migrating event between calendars"
                    );
                    self.queue
                        .enqueue_at(NewAction::delete(&before, plan.source_calendar), now)?;
                    after.external_id = None;
                    after.calendar_id = plan.target_calendar.clone();
                    after.sync_status = SyncStatus::Pending;
                    self.queue
                        .enqueue_at(NewAction::create(&after, plan.target_calendar), now)?;
                }
                PlanKind::FirstPush => {
                    self.queue
                        .enqueue_at(NewAction::create(&after, plan.target_calendar), now)?;
                }
                PlanKind::Unrouted => {
                    tracing::debug!(event_id = %after.id, "edited event has no calendar route");
                }
            }
        }

        self.store.upsert(after.clone(), ChangeOrigin::Local);
        self.persist()?;
        Ok(after)
    }

    /// Remove an event locally and enqueue its remote delete.
    pub fn delete_event(&mut self, id: &str) -> Result<Event> {
        let event = self
            .store
            .delete(id, ChangeOrigin::Local)
            .ok_or_else(|| ValidationError::EntityNotFound {
                entity_id: id.to_string(),
            })?;

        if event.remarkable_source {
            let calendar_id = self.router.resolve(&event);
            self.queue.enqueue(NewAction::delete(&event, calendar_id))?;
        } else {
            self.queue.cancel_all_for(id);
        }

        self.persist()?;
        Ok(event)
    }

    // ========================================================================
    // Dead letters
    // ========================================================================

    pub fn dead_letters(&self) -> Vec<Action> {
        self.queue.dead_letters().into_iter().cloned().collect()
    }

    pub fn retry_dead_letter(&mut self, id: ActionId) -> Result<()> {
        self.queue.retry_dead_letter(id)?;
        if let Some(entity_id) = self.queue.get(id).map(|a| a.entity_id.clone()) {
            self.clear_error_status(&entity_id);
        }
        self.persist()
    }

    /// Returns how many actions were revived.
    pub fn retry_all_dead_letters(&mut self) -> Result<usize> {
        let revived = self.queue.retry_all_dead_letters();
        let entities: Vec<String> = revived
            .iter()
            .filter_map(|id| self.queue.get(*id).map(|a| a.entity_id.clone()))
            .collect();
        for entity_id in entities {
            self.clear_error_status(&entity_id);
        }
        self.persist()?;
        Ok(revived.len())
    }

    pub fn discard_dead_letter(&mut self, id: ActionId) -> Result<Action> {
        let action = self.queue.discard_dead_letter(id)?;
        tracing::info!(action_id = id, entity_id = %action.entity_id, "discarded dead-lettered action");
        self.persist()?;
        Ok(action)
    }

    fn clear_error_status(&mut self, entity_id: &str) {
        self.store.modify(entity_id, ChangeOrigin::Sync, |e| {
            if e.sync_status == SyncStatus::Error {
                e.sync_status = SyncStatus::Pending;
            }
            e.sync_error = None;
        });
    }

    pub fn overview(&self) -> SyncOverview {
        let counts = self.queue.counts();
        SyncOverview {
            state: self.state,
            last_sync_at: self.last_sync_at,
            pending_count: counts.pending,
            dead_letter_count: counts.dead_lettered,
            error_count: self
                .store
                .iter()
                .filter(|e| e.sync_status == SyncStatus::Error)
                .count(),
            last_report: self.last_report.clone(),
        }
    }

    /// How long until a debounced or backed-off action becomes ready.
    pub fn next_ready_in(&self) -> Option<std::time::Duration> {
        self.queue
            .time_until_next_ready(Utc::now())
            .and_then(|wait| wait.to_std().ok())
    }

    /// Flush the event store, then the queue.
    pub fn persist(&self) -> Result<()> {
        self.store.persist()?;
        self.queue.persist()?;
        Ok(())
    }

    // ========================================================================
    // Rounds
    // ========================================================================

    pub async fn run_round(&mut self, trigger: SyncTrigger) -> SyncReport {
        self.run_round_with(trigger, &mut |_: &mut SyncEngine| ControlFlow::Continue(()))
            .await
    }

    /// Run one round, calling `hook` whenever the engine is between remote calls.
    pub async fn run_round_with(
        &mut self,
        trigger: SyncTrigger,
        hook: &mut RoundHook<'_>,
    ) -> SyncReport {
        self.round += 1;
        let mut report = SyncReport::new(self.round, trigger, Utc::now());
        tracing::info!(round = self.round, ?trigger, "sync round started");

        self.state = EngineState::Draining;
        let mut flow = self.drain(&mut report, hook).await;

        let mut reconciled = false;
        if flow.is_continue() {
            self.state = EngineState::Reconciling;
            (reconciled, flow) = self.reconcile(&mut report, hook).await;
        }
        if flow.is_break() {
            report.interrupted = true;
            tracing::info!(round = self.round, "sync round interrupted");
        }
        self.deduplicate(&mut report);

        let recovery = recover_orphans(&self.store, &mut self.queue, &self.router);
        report.recovered = recovery.recovered.len();

        let now = Utc::now();
        report.cleaned_up = self
            .queue
            .cleanup_synchronized(now, self.config.archive_grace());

        if let Err(e) = self.persist() {
            tracing::error!(round = self.round, error = %e, "failed to persist sync state");
            report.errors.push(e.to_string());
        }

        self.state = EngineState::Idle;
        report.finished_at = Utc::now();
        if reconciled {
            self.last_sync_at = Some(report.finished_at);
        }

        tracing::info!(
            round = report.round,
            pushed = report.pushed,
            failed = report.failed,
            dead_lettered = report.dead_lettered,
            imported = report.imported,
            updated = report.updated_from_remote,
            deleted = report.deleted_from_remote,
            deduplicated = report.deduplicated,
            recovered = report.recovered,
            duration_ms = report.duration().num_milliseconds(),
            "sync round finished"
        );
        self.last_report = Some(report.clone());
        report
    }

    /// Push ready actions in waves. Each wave holds at most `max_in_flight`
    /// calls and at most one action per entity.
    async fn drain(&mut self, report: &mut SyncReport, hook: &mut RoundHook<'_>) -> ControlFlow<()> {
        let force = report.trigger.is_forced();
        let max_in_flight = self.config.max_in_flight.max(1);
        let timeout = self.config.request_timeout();
        let mut attempted: HashSet<ActionId> = HashSet::new();

        loop {
            if hook(self).is_break() {
                return ControlFlow::Break(());
            }

            let batch: Vec<Action> = self
                .queue
                .list_ready(Utc::now(), force)
                .into_iter()
                .filter(|a| !attempted.contains(&a.id))
                .take(max_in_flight)
                .cloned()
                .collect();
            if batch.is_empty() {
                return ControlFlow::Continue(());
            }

            let mut calls = JoinSet::new();
            for action in batch {
                attempted.insert(action.id);
                match self.prepare(&action) {
                    Ok(Prepared::Local(reason)) => {
                        tracing::debug!(action_id = action.id, entity_id = %action.entity_id, reason, "completed without remote call");
                        if let Ok(true) = self.queue.mark_synchronized(action.id, Utc::now()) {
                            report.completed_locally += 1;
                        }
                    }
                    Ok(Prepared::Remote(call)) => {
                        let version = match self.config.payload_source {
                            PayloadSource::Reread => self
                                .store
                                .get_by_id(&action.entity_id)
                                .map_or(action.data.local_version, |e| e.local_version),
                            PayloadSource::Snapshot => action.data.local_version,
                        };
                        let inflight = InFlight {
                            action_id: action.id,
                            entity_id: action.entity_id.clone(),
                            call,
                            version,
                            snapshot: action.data.clone(),
                        };
                        let remote = Arc::clone(&self.remote);
                        calls.spawn(async move {
                            let result =
                                match tokio::time::timeout(timeout, inflight.call.execute(remote.as_ref())).await {
                                    Ok(result) => result,
                                    Err(elapsed) => Err(SyncError::from(elapsed)),
                                };
                            (inflight, result)
                        });
                    }
                    Err(error) => self.settle_failure(action.id, &action.entity_id, error, report),
                }
            }

            while let Some(joined) = calls.join_next().await {
                match joined {
                    Ok((inflight, Ok(remote_id))) => self.settle_success(inflight, remote_id, report),
                    Ok((inflight, Err(SyncError::NotFound)))
                        if inflight.call.action_type() == ActionType::Update =>
                    {
                        self.recreate_vanished(&inflight);
                        attempted.remove(&inflight.action_id);
                    }
                    Ok((inflight, Err(error))) => {
                        self.settle_failure(inflight.action_id, &inflight.entity_id, error, report)
                    }
                    Err(e) => tracing::error!(error = %e, "remote call task failed"),
                }
            }
        }
    }

    /// Build the remote call for `action`.
    fn prepare(&self, action: &Action) -> std::result::Result<Prepared, SyncError> {
        let current = self.store.get_by_id(&action.entity_id);
        let data = match (self.config.payload_source, current) {
            (PayloadSource::Reread, Some(event)) => event,
            _ => &action.data,
        };
        let external_id = action
            .external_id
            .clone()
            .or_else(|| current.and_then(|e| e.external_id.clone()));

        if action.action_type == ActionType::Delete {
            let Some(external_id) = external_id else {
                return Ok(Prepared::Local("delete of event never pushed"));
            };
            let calendar_id = action
                .calendar_id
                .clone()
                .or_else(|| self.router.resolve(&action.data))
                .ok_or_else(|| SyncError::Unroutable(action.entity_id.clone()))?;
            return Ok(Prepared::Remote(RemoteCall::Delete {
                calendar_id,
                external_id,
            }));
        }

        if current.is_none() {
            return Ok(Prepared::Local("event no longer exists"));
        }
        let calendar_id = action
            .calendar_id
            .clone()
            .or_else(|| self.router.resolve(data))
            .ok_or_else(|| SyncError::Unroutable(action.entity_id.clone()))?;

        match (action.action_type, external_id) {
            (ActionType::Update, Some(external_id)) => Ok(Prepared::Remote(RemoteCall::Update {
                calendar_id,
                external_id,
                payload: payload_for(data, SyncNote::Edited(Utc::now())),
            })),
            _ => Ok(Prepared::Remote(RemoteCall::Create {
                calendar_id,
                payload: payload_for(data, SyncNote::Created),
            })),
        }
    }

    fn settle_success(&mut self, inflight: InFlight, remote_id: Option<String>, report: &mut SyncReport) {
        let now = Utc::now();
        let InFlight {
            action_id,
            entity_id,
            call,
            version,
            snapshot,
        } = inflight;

        match self.queue.mark_synchronized(action_id, now) {
            Ok(true) => report.pushed += 1,
            Ok(false) => return,
            Err(_) => {
                // Cancelled while the call was in flight.
                if let Some(remote_id) = remote_id {
                    let mut orphan = snapshot;
                    orphan.external_id = Some(remote_id);
                    tracing::warn!(action_id, entity_id = %entity_id, "create finished after cancel, deleting remote copy");
                    if let Err(e) = self
                        .queue
                        .enqueue(NewAction::delete(&orphan, Some(call.calendar_id().to_string())))
                    {
                        report.errors.push(e.to_string());
                    }
                }
                return;
            }
        }

        tracing::debug!(action_id, entity_id = %entity_id, action_type = ?call.action_type(), "action synchronized");
        match (call, remote_id) {
            (RemoteCall::Create { calendar_id, .. }, Some(remote_id)) => {
                self.queue.assign_external_id(&entity_id, &remote_id);
                self.store.modify(&entity_id, ChangeOrigin::Sync, |e| {
                    e.calendar_id = Some(calendar_id);
                    e.mark_pushed(Some(remote_id), version, now);
                });
            }
            (RemoteCall::Update { .. }, _) => {
                self.store.modify(&entity_id, ChangeOrigin::Sync, |e| {
                    e.mark_pushed(None, version, now);
                });
            }
            _ => {}
        }
    }

    /// An update hit a remote copy that no longer exists: push it as a create.
    fn recreate_vanished(&mut self, inflight: &InFlight) {
        tracing::warn!(
            action_id = inflight.action_id,
            entity_id = %inflight.entity_id,
            "remote copy vanished, recreating"
        );
        if let Err(e) = self.queue.convert_to_create(inflight.action_id) {
            tracing::warn!(action_id = inflight.action_id, error = %e, "could not convert action");
            return;
        }
        self.store.modify(&inflight.entity_id, ChangeOrigin::Sync, |e| {
            e.external_id = None;
            e.sync_status = SyncStatus::Pending;
        });
    }

    fn settle_failure(
        &mut self,
        action_id: ActionId,
        entity_id: &str,
        error: SyncError,
        report: &mut SyncReport,
    ) {
        let message = error.to_string();
        report.errors.push(format!("action {action_id}: {message}"));

        match self
            .queue
            .mark_failed(action_id, &error, &self.retry, Utc::now())
        {
            Ok(FailureOutcome::Retrying {
                retry_count,
                retry_at,
            }) => {
                report.failed += 1;
                tracing::warn!(action_id, entity_id, retry_count, %retry_at, error = %message, "remote call failed, will retry");
                self.store.modify(entity_id, ChangeOrigin::Sync, |e| {
                    e.sync_error = Some(message);
                });
            }
            Ok(FailureOutcome::DeadLettered { retry_count }) => {
                report.dead_lettered += 1;
                tracing::error!(action_id, entity_id, retry_count, error = %message, "action dead-lettered");
                // A remote copy exists for synced events, so they stay pending.
                self.store.modify(entity_id, ChangeOrigin::Sync, |e| {
                    if e.external_id.is_none() {
                        e.sync_status = SyncStatus::Error;
                    }
                    e.sync_error = Some(message);
                });
            }
            Err(e) => tracing::warn!(action_id, error = %e, "failed action vanished from queue"),
        }
    }

    /// List remote changes and merge them. Returns whether every listing
    /// succeeded, and whether the hook asked to stop.
    async fn reconcile(
        &mut self,
        report: &mut SyncReport,
        hook: &mut RoundHook<'_>,
    ) -> (bool, ControlFlow<()>) {
        let started = Utc::now();
        let full = self.needs_full_sync
            || report.trigger == SyncTrigger::FullSync
            || self.last_reconcile_at.is_none();
        report.full_listing = full;

        let window = (
            started - Duration::days(i64::from(self.config.past_days)),
            started + Duration::days(i64::from(self.config.future_days)),
        );
        let query = ListQuery {
            modified_since: if full { None } else { self.last_reconcile_at },
            window: Some(window),
        };

        let calendars: BTreeSet<String> = self
            .router
            .calendars()
            .into_iter()
            .chain(self.store.iter().filter_map(|e| e.calendar_id.clone()))
            .collect();

        let mut all_ok = true;
        for calendar_id in calendars {
            if hook(self).is_break() {
                // A partial listing must not advance the incremental cursor.
                return (false, ControlFlow::Break(()));
            }
            match self.remote.list_events(&calendar_id, &query).await {
                Ok(remote) => self.merge_remote(&calendar_id, remote, full.then_some(window), report),
                Err(error) => {
                    all_ok = false;
                    tracing::warn!(calendar_id = %calendar_id, error = %error, "listing remote events failed");
                    report.errors.push(format!("list {calendar_id}: {error}"));
                }
            }
        }

        if all_ok {
            self.last_reconcile_at = Some(started);
            if full {
                self.needs_full_sync = false;
            }
        }
        (all_ok, ControlFlow::Continue(()))
    }

    /// Merge one calendar's listing. `full_window` is set for full listings,
    /// which also detect remote deletions inside that window.
    fn merge_remote(
        &mut self,
        calendar_id: &str,
        remote: Vec<RemoteEvent>,
        full_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
        report: &mut SyncReport,
    ) {
        let now = Utc::now();
        let mut seen: HashSet<String> = HashSet::new();

        for remote_event in remote {
            seen.insert(remote_event.id.clone());
            let mut local_ids: Vec<String> = self
                .store
                .by_external_id(&remote_event.id)
                .iter()
                .map(|e| e.id.clone())
                .collect();
            if local_ids.is_empty() {
                let imported_id = EventOrigin::imported_id(&remote_event.id);
                if self.store.contains(&imported_id) {
                    local_ids.push(imported_id);
                }
            }

            if remote_event.is_removed {
                for id in local_ids {
                    if !self.queue.has_entry_for(&id) {
                        self.store.delete(&id, ChangeOrigin::Remote);
                        report.deleted_from_remote += 1;
                    }
                }
                continue;
            }

            if local_ids.is_empty() {
                if self.awaits_remote_delete(&remote_event.id) {
                    continue;
                }
                let imported = import_remote_event(&remote_event, now);
                tracing::debug!(event_id = %imported.id, calendar_id, "imported remote event");
                self.store.upsert(imported, ChangeOrigin::Remote);
                report.imported += 1;
                continue;
            }

            for id in local_ids {
                self.merge_one(&id, &remote_event, now, report);
            }
        }

        if let Some((from, to)) = full_window {
            let vanished: Vec<String> = self
                .store
                .iter()
                .filter(|e| e.sync_status == SyncStatus::Synced)
                .filter(|e| e.external_id.as_ref().is_some_and(|x| !seen.contains(x)))
                .filter(|e| e.start_time >= from && e.start_time <= to)
                .filter(|e| self.router.resolve(e).as_deref() == Some(calendar_id))
                .filter(|e| !self.queue.has_entry_for(&e.id))
                .map(|e| e.id.clone())
                .collect();
            for id in vanished {
                tracing::debug!(event_id = %id, calendar_id, "event removed remotely");
                self.store.delete(&id, ChangeOrigin::Remote);
                report.deleted_from_remote += 1;
            }
        }
    }

    /// Whether an open action will delete `external_id` remotely (a migration source).
    fn awaits_remote_delete(&self, external_id: &str) -> bool {
        self.queue.all().iter().any(|a| {
            a.is_open()
                && a.action_type == ActionType::Delete
                && a.external_id.as_deref() == Some(external_id)
        })
    }

    fn merge_one(&mut self, id: &str, remote: &RemoteEvent, now: DateTime<Utc>, report: &mut SyncReport) {
        let Some(local) = self.store.get_by_id(id) else {
            return;
        };

        match decide_merge(local, remote.last_modified) {
            MergeDecision::Unchanged => {}
            MergeDecision::UseRemote if remote_differs(local, remote) => {
                self.store.modify(id, ChangeOrigin::Remote, |e| {
                    apply_remote_content(e, remote, now);
                });
                self.queue.cancel_pending_for(id, &[ActionType::Update]);
                report.updated_from_remote += 1;
            }
            MergeDecision::UseRemote => {
                self.store.modify(id, ChangeOrigin::Sync, |e| {
                    e.last_sync_time = Some(now.max(remote.last_modified));
                });
            }
            MergeDecision::UseLocal => {
                if local.is_outbound() && !self.queue.has_entry_for(id) {
                    let intent = NewAction::update(local, self.router.resolve(local));
                    if let Err(e) = self.queue.enqueue(intent) {
                        report.errors.push(e.to_string());
                    }
                }
            }
        }
    }

    /// Collapse events sharing one remote identity.
    fn deduplicate(&mut self, report: &mut SyncReport) {
        let groups = find_duplicates(self.store.iter(), self.selection.as_deref());
        for group in groups {
            tracing::info!(
                external_id = %group.external_id,
                survivor = %group.survivor,
                removed = group.losers.len(),
                "collapsed duplicate events"
            );
            for loser in group.losers {
                self.queue.cancel_all_for(&loser);
                self.store.delete(&loser, ChangeOrigin::Sync);
                report.deduplicated += 1;
            }
        }
    }
}

fn validate_range(event: &Event) -> Result<()> {
    if event.end_time < event.start_time {
        return Err(ValidationError::InvalidTimeRange {
            start: event.start_time,
            end: event.end_time,
        }
        .into());
    }
    Ok(())
}
