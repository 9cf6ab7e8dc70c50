//! Persisted outbox of pending remote mutations.
//!
//! Actions are kept in id order. For any one entity only the oldest open
//! action is ever handed out, so per-entity order is preserved while
//! unrelated entities can be drained in parallel.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{StorageError, ValidationError};
use crate::storage::{BlobLoad, SharedDatabase};
use crate::sync::retry::RetryPolicy;
use crate::sync::types::{
    Action, ActionId, ActionSource, ActionType, EnqueueOutcome, EntityType, NewAction, SyncError,
};

/// Storage key of the queue blob.
pub const ACTION_QUEUE_KEY: &str = "action_queue";

/// Persisted form; `next_id` survives restarts so ids are never reused.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueueSnapshot {
    next_id: ActionId,
    actions: Vec<Action>,
}

/// Result of recording a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Will be retried after `retry_at`.
    Retrying {
        retry_count: u32,
        retry_at: DateTime<Utc>,
    },
    /// Moved to the dead-letter view.
    DeadLettered { retry_count: u32 },
}

/// Queue size by state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub dead_lettered: usize,
    pub synchronized: usize,
}

/// Outbox of create/update/delete intents.
pub struct ActionQueue {
    actions: Vec<Action>,
    next_id: ActionId,
    debounce: Duration,
    database: Option<SharedDatabase>,
}

impl ActionQueue {
    /// Empty queue without debounce or persistence.
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            next_id: 1,
            debounce: Duration::zero(),
            database: None,
        }
    }

    pub fn with_debounce(mut self, debounce: std::time::Duration) -> Self {
        self.debounce = Duration::milliseconds(debounce.as_millis() as i64);
        self
    }

    /// Load the queue from `database`.
    ///
    /// A corrupt blob is quarantined and the queue starts empty.
    pub fn open(database: SharedDatabase) -> Result<Self, StorageError> {
        let loaded = {
            let db = database.lock().map_err(|_| StorageError::Locked)?;
            db.load_blob::<QueueSnapshot>(ACTION_QUEUE_KEY)?
        };

        let mut queue = Self::new();
        match loaded {
            BlobLoad::Missing => {}
            BlobLoad::Loaded(snapshot) => {
                let mut actions = snapshot.actions;
                actions.sort_by_key(|a| a.id);
                let max_id = actions.last().map_or(0, |a| a.id);
                queue.next_id = snapshot.next_id.max(max_id + 1);
                queue.actions = actions;
            }
            BlobLoad::Corrupt {
                quarantined_as,
                message,
            } => {
                tracing::error!(
                    key = ACTION_QUEUE_KEY,
                    quarantined_as = %quarantined_as,
                    error = %message,
                    "action queue blob is corrupt, starting empty"
                );
            }
        }
        queue.database = Some(database);
        tracing::debug!(actions = queue.actions.len(), "action queue loaded");
        Ok(queue)
    }

    /// Enqueue a mutation intent at the current time.
    pub fn enqueue(&mut self, intent: NewAction) -> Result<EnqueueOutcome, ValidationError> {
        self.enqueue_at(intent, Utc::now())
    }

    /// Enqueue a mutation intent.
    ///
    /// - remote echoes are dropped
    /// - intents for events that are not locally authored are rejected
    /// - a create/update merges into the entity's last open create/update
    /// - a delete cancels the entity's open create/update actions and is
    ///   dropped entirely when the entity never reached the remote
    pub fn enqueue_at(
        &mut self,
        intent: NewAction,
        now: DateTime<Utc>,
    ) -> Result<EnqueueOutcome, ValidationError> {
        if intent.source == ActionSource::RemoteEcho {
            tracing::debug!(entity_id = %intent.entity_id, "suppressed remote echo");
            return Ok(EnqueueOutcome::EchoSuppressed);
        }
        if !intent.data.remarkable_source {
            tracing::warn!(
                entity_id = %intent.entity_id,
                "rejected outbound action for non-local event"
            );
            return Err(ValidationError::NotRemarkable {
                entity_id: intent.entity_id,
            });
        }

        match intent.action_type {
            ActionType::Create | ActionType::Update => Ok(self.enqueue_upsert(intent, now)),
            ActionType::Delete => Ok(self.enqueue_delete(intent, now)),
        }
    }

    fn enqueue_upsert(&mut self, intent: NewAction, now: DateTime<Utc>) -> EnqueueOutcome {
        let not_before = self.debounce_deadline(now);
        let last_open = self
            .actions
            .iter_mut()
            .rev()
            .find(|a| a.is_open() && a.entity_id == intent.entity_id);

        if let Some(existing) = last_open {
            if existing.action_type != ActionType::Delete {
                existing.data = intent.data;
                existing.updated_at = now;
                existing.not_before = not_before;
                if intent.calendar_id.is_some() {
                    existing.calendar_id = intent.calendar_id;
                }
                if intent.external_id.is_some() {
                    existing.external_id = intent.external_id;
                }
                if existing.dead_lettered {
                    existing.dead_lettered = false;
                    existing.retry_count = 0;
                    existing.last_error = None;
                }
                tracing::debug!(
                    action_id = existing.id,
                    entity_id = %existing.entity_id,
                    "coalesced into pending action"
                );
                return EnqueueOutcome::Coalesced(existing.id);
            }
        }

        EnqueueOutcome::Appended(self.push(intent, now, not_before))
    }

    fn enqueue_delete(&mut self, intent: NewAction, now: DateTime<Utc>) -> EnqueueOutcome {
        let cancelled = self.cancel_pending_for(
            &intent.entity_id,
            &[ActionType::Create, ActionType::Update],
        );

        if let Some(existing) = self.actions.iter_mut().find(|a| {
            a.is_open() && a.entity_id == intent.entity_id && a.action_type == ActionType::Delete
        }) {
            existing.updated_at = now;
            if existing.external_id.is_none() {
                existing.external_id = intent.external_id;
            }
            return EnqueueOutcome::Coalesced(existing.id);
        }

        if intent.external_id.is_none() {
            tracing::debug!(
                entity_id = %intent.entity_id,
                cancelled = cancelled.len(),
                "delete of never-synced event handled locally"
            );
            return EnqueueOutcome::LocalOnly { cancelled };
        }

        let id = self.push(intent, now, None);
        if cancelled.is_empty() {
            EnqueueOutcome::Appended(id)
        } else {
            EnqueueOutcome::Superseded { id, cancelled }
        }
    }

    fn push(
        &mut self,
        intent: NewAction,
        now: DateTime<Utc>,
        not_before: Option<DateTime<Utc>>,
    ) -> ActionId {
        let id = self.next_id;
        self.next_id += 1;
        tracing::debug!(
            action_id = id,
            entity_id = %intent.entity_id,
            action_type = ?intent.action_type,
            "enqueued action"
        );
        self.actions.push(Action {
            id,
            action_type: intent.action_type,
            entity_type: EntityType::Event,
            entity_id: intent.entity_id,
            data: intent.data,
            calendar_id: intent.calendar_id,
            external_id: intent.external_id,
            source: intent.source,
            created_at: now,
            updated_at: now,
            not_before,
            synchronized: false,
            synchronized_at: None,
            retry_count: 0,
            last_error: None,
            dead_lettered: false,
        });
        id
    }

    fn debounce_deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.debounce > Duration::zero()).then(|| now + self.debounce)
    }

    /// Open, non-dead-lettered actions in FIFO order.
    pub fn list_pending(&self) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| a.is_open() && !a.dead_lettered)
            .collect()
    }

    /// The oldest open action of each entity that may run now.
    ///
    /// A dead-lettered or waiting head blocks the actions behind it. `force`
    /// ignores debounce and backoff deadlines.
    pub fn list_ready(&self, now: DateTime<Utc>, force: bool) -> Vec<&Action> {
        let mut seen = HashSet::new();
        self.actions
            .iter()
            .filter(|a| a.is_open())
            .filter(|a| seen.insert(a.entity_id.as_str()))
            .filter(|a| !a.dead_lettered && (force || a.is_ready(now)))
            .collect()
    }

    pub fn get(&self, id: ActionId) -> Option<&Action> {
        self.actions.iter().find(|a| a.id == id)
    }

    fn get_mut(&mut self, id: ActionId) -> Result<&mut Action, ValidationError> {
        self.actions
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(ValidationError::ActionNotFound { action_id: id })
    }

    /// Record remote success. Returns `false` if it was already synchronized.
    pub fn mark_synchronized(
        &mut self,
        id: ActionId,
        now: DateTime<Utc>,
    ) -> Result<bool, ValidationError> {
        let action = self.get_mut(id)?;
        if action.synchronized {
            return Ok(false);
        }
        action.synchronized = true;
        action.synchronized_at = Some(now);
        action.not_before = None;
        action.last_error = None;
        action.dead_lettered = false;
        Ok(true)
    }

    /// Record a failed attempt and schedule the retry or dead-letter it.
    pub fn mark_failed(
        &mut self,
        id: ActionId,
        error: &SyncError,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, ValidationError> {
        let action = self.get_mut(id)?;
        action.retry_count += 1;
        action.last_error = Some(error.to_string());

        if !error.is_retryable() || policy.exhausted(action.retry_count) {
            action.dead_lettered = true;
            action.not_before = None;
            return Ok(FailureOutcome::DeadLettered {
                retry_count: action.retry_count,
            });
        }

        let delay = policy.jittered_delay(action.retry_count, error);
        let retry_at = now + Duration::milliseconds(delay.as_millis() as i64);
        action.not_before = Some(retry_at);
        Ok(FailureOutcome::Retrying {
            retry_count: action.retry_count,
            retry_at,
        })
    }

    /// Turn an update whose remote copy vanished into a create.
    pub fn convert_to_create(&mut self, id: ActionId) -> Result<(), ValidationError> {
        let action = self.get_mut(id)?;
        action.action_type = ActionType::Create;
        action.external_id = None;
        action.not_before = None;
        Ok(())
    }

    /// Fill in the remote id on open actions queued behind a create.
    pub fn assign_external_id(&mut self, entity_id: &str, external_id: &str) {
        for action in self
            .actions
            .iter_mut()
            .filter(|a| a.is_open() && a.entity_id == entity_id && a.external_id.is_none())
            .filter(|a| a.action_type != ActionType::Create)
        {
            action.external_id = Some(external_id.to_string());
        }
    }

    /// Whether any open action (dead-lettered included) refers to `entity_id`.
    pub fn has_entry_for(&self, entity_id: &str) -> bool {
        self.actions
            .iter()
            .any(|a| a.is_open() && a.entity_id == entity_id)
    }

    /// Open actions for `entity_id`, oldest first.
    pub fn pending_for(&self, entity_id: &str) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| a.is_open() && a.entity_id == entity_id)
            .collect()
    }

    /// Drop open actions of the given types for `entity_id`.
    pub fn cancel_pending_for(&mut self, entity_id: &str, types: &[ActionType]) -> Vec<ActionId> {
        let mut cancelled = Vec::new();
        self.actions.retain(|a| {
            let cancel =
                a.is_open() && a.entity_id == entity_id && types.contains(&a.action_type);
            if cancel {
                cancelled.push(a.id);
            }
            !cancel
        });
        if !cancelled.is_empty() {
            tracing::debug!(entity_id, ?cancelled, "cancelled pending actions");
        }
        cancelled
    }

    /// Drop every open action for `entity_id`.
    pub fn cancel_all_for(&mut self, entity_id: &str) -> Vec<ActionId> {
        self.cancel_pending_for(
            entity_id,
            &[ActionType::Create, ActionType::Update, ActionType::Delete],
        )
    }

    pub fn dead_letters(&self) -> Vec<&Action> {
        self.actions
            .iter()
            .filter(|a| a.is_open() && a.dead_lettered)
            .collect()
    }

    /// Return a dead-lettered action to the pending list.
    pub fn retry_dead_letter(&mut self, id: ActionId) -> Result<(), ValidationError> {
        let action = self.get_mut(id)?;
        if !action.dead_lettered {
            return Err(ValidationError::NotDeadLettered { action_id: id });
        }
        action.dead_lettered = false;
        action.retry_count = 0;
        action.last_error = None;
        action.not_before = None;
        Ok(())
    }

    /// Returns the ids that were revived.
    pub fn retry_all_dead_letters(&mut self) -> Vec<ActionId> {
        let mut revived = Vec::new();
        for action in self.actions.iter_mut().filter(|a| a.dead_lettered) {
            action.dead_lettered = false;
            action.retry_count = 0;
            action.last_error = None;
            action.not_before = None;
            revived.push(action.id);
        }
        revived
    }

    /// Remove a dead-lettered action without applying it.
    pub fn discard_dead_letter(&mut self, id: ActionId) -> Result<Action, ValidationError> {
        let index = self
            .actions
            .iter()
            .position(|a| a.id == id)
            .ok_or(ValidationError::ActionNotFound { action_id: id })?;
        if !self.actions[index].dead_lettered {
            return Err(ValidationError::NotDeadLettered { action_id: id });
        }
        Ok(self.actions.remove(index))
    }

    /// Drop synchronized actions older than `grace`. Returns how many were dropped.
    pub fn cleanup_synchronized(&mut self, now: DateTime<Utc>, grace: Duration) -> usize {
        let before = self.actions.len();
        self.actions.retain(|a| match (a.synchronized, a.synchronized_at) {
            (true, Some(at)) => at + grace > now,
            (true, None) => false,
            _ => true,
        });
        before - self.actions.len()
    }

    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for action in &self.actions {
            if action.synchronized {
                counts.synchronized += 1;
            } else if action.dead_lettered {
                counts.dead_lettered += 1;
            } else {
                counts.pending += 1;
            }
        }
        counts
    }

    /// All actions, including synchronized ones awaiting cleanup.
    pub fn all(&self) -> &[Action] {
        &self.actions
    }

    /// Get number of open actions.
    pub fn len(&self) -> usize {
        self.actions.iter().filter(|a| a.is_open()).count()
    }

    /// Check if nothing is owed to the remote.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time until the earliest debounce or backoff deadline still ahead of `now`.
    ///
    /// `None` when no pending action is waiting on the clock.
    pub fn time_until_next_ready(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.list_pending()
            .iter()
            .filter_map(|a| a.not_before)
            .filter(|t| *t > now)
            .map(|t| t - now)
            .min()
    }

    /// Flush to the backing database, if any.
    pub fn persist(&self) -> Result<(), StorageError> {
        let Some(database) = &self.database else {
            return Ok(());
        };
        let snapshot = QueueSnapshot {
            next_id: self.next_id,
            actions: self.actions.clone(),
        };
        let db = database.lock().map_err(|_| StorageError::Locked)?;
        db.save_blob(ACTION_QUEUE_KEY, &snapshot)
    }
}

impl Default for ActionQueue {
    fn default() -> Self {
        Self::new()
    }
}
