//! Local authoritative event table with change notifications.

use std::collections::BTreeMap;

use tokio::sync::broadcast;

use crate::error::StorageError;
use crate::storage::{BlobLoad, SharedDatabase};
use crate::sync::types::Event;

/// Storage key of the event blob.
pub const EVENTS_KEY: &str = "events";

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Who caused a store change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A user mutation.
    Local,
    /// Applied from a remote listing.
    Remote,
    /// Sync bookkeeping (status, external id, dedup).
    Sync,
}

/// Notification sent to subscribers after every store change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Upserted { id: String, origin: ChangeOrigin },
    Deleted { id: String, origin: ChangeOrigin },
}

/// In-memory event table, flushed to a single blob.
pub struct EventStore {
    events: BTreeMap<String, Event>,
    changes: broadcast::Sender<StoreChange>,
    database: Option<SharedDatabase>,
}

impl EventStore {
    /// Empty store without persistence.
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            events: BTreeMap::new(),
            changes,
            database: None,
        }
    }

    /// Load the store from `database`.
    ///
    /// A corrupt blob is quarantined and the store starts empty.
    pub fn open(database: SharedDatabase) -> Result<Self, StorageError> {
        let loaded = {
            let db = database.lock().map_err(|_| StorageError::Locked)?;
            db.load_blob::<Vec<Event>>(EVENTS_KEY)?
        };

        let mut store = Self::new();
        match loaded {
            BlobLoad::Missing => {}
            BlobLoad::Loaded(events) => {
                store.events = events.into_iter().map(|e| (e.id.clone(), e)).collect();
            }
            BlobLoad::Corrupt {
                quarantined_as,
                message,
            } => {
                tracing::error!(
                    key = EVENTS_KEY,
                    quarantined_as = %quarantined_as,
                    error = %message,
                    "event store blob is corrupt, starting empty"
                );
            }
        }
        store.database = Some(database);
        tracing::debug!(events = store.events.len(), "event store loaded");
        Ok(store)
    }

    pub fn get_all(&self) -> Vec<Event> {
        self.events.values().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.values()
    }

    pub fn get_by_id(&self, id: &str) -> Option<&Event> {
        self.events.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.events.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events holding `external_id`, in id order.
    pub fn by_external_id(&self, external_id: &str) -> Vec<&Event> {
        self.events
            .values()
            .filter(|e| e.external_id.as_deref() == Some(external_id))
            .collect()
    }

    /// Insert or replace, returning the previous record.
    pub fn upsert(&mut self, event: Event, origin: ChangeOrigin) -> Option<Event> {
        let id = event.id.clone();
        let previous = self.events.insert(id.clone(), event);
        let _ = self.changes.send(StoreChange::Upserted { id, origin });
        previous
    }

    pub fn delete(&mut self, id: &str, origin: ChangeOrigin) -> Option<Event> {
        let removed = self.events.remove(id);
        if removed.is_some() {
            let _ = self.changes.send(StoreChange::Deleted {
                id: id.to_string(),
                origin,
            });
        }
        removed
    }

    /// Apply `f` to the event in place, notifying subscribers if it exists.
    pub fn modify<F>(&mut self, id: &str, origin: ChangeOrigin, f: F) -> bool
    where
        F: FnOnce(&mut Event),
    {
        let Some(event) = self.events.get_mut(id) else {
            return false;
        };
        f(event);
        let _ = self.changes.send(StoreChange::Upserted {
            id: id.to_string(),
            origin,
        });
        true
    }

    /// Receive a notification for every subsequent change.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }

    /// Sender side, for handing out subscriptions from other tasks.
    pub fn change_sender(&self) -> broadcast::Sender<StoreChange> {
        self.changes.clone()
    }

    /// Flush to the backing database, if any.
    pub fn persist(&self) -> Result<(), StorageError> {
        let Some(database) = &self.database else {
            return Ok(());
        };
        let events: Vec<&Event> = self.events.values().collect();
        let db = database.lock().map_err(|_| StorageError::Locked)?;
        db.save_blob(EVENTS_KEY, &events)
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use chrono::Utc;

    fn event(id: &str) -> Event {
        let now = Utc::now();
        let mut e = Event::new_local("Focus", now, now);
        e.id = id.to_string();
        e
    }

    #[test]
    fn upsert_get_delete() {
        let mut store = EventStore::new();
        assert!(store.upsert(event("local-1"), ChangeOrigin::Local).is_none());
        assert!(store.upsert(event("local-1"), ChangeOrigin::Local).is_some());
        assert_eq!(store.len(), 1);
        assert!(store.get_by_id("local-1").is_some());

        assert!(store.delete("local-1", ChangeOrigin::Local).is_some());
        assert!(store.delete("local-1", ChangeOrigin::Local).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn subscribers_see_changes() {
        let mut store = EventStore::new();
        let mut rx = store.subscribe();

        store.upsert(event("local-1"), ChangeOrigin::Local);
        store.modify("local-1", ChangeOrigin::Sync, |e| e.title = "x".into());
        store.delete("local-1", ChangeOrigin::Remote);

        assert_eq!(
            rx.try_recv().unwrap(),
            StoreChange::Upserted { id: "local-1".into(), origin: ChangeOrigin::Local }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            StoreChange::Upserted { id: "local-1".into(), origin: ChangeOrigin::Sync }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            StoreChange::Deleted { id: "local-1".into(), origin: ChangeOrigin::Remote }
        );
    }

    #[test]
    fn by_external_id_finds_all_holders() {
        let mut store = EventStore::new();
        for id in ["local-1", "local-2", "local-3"] {
            let mut e = event(id);
            if id != "local-3" {
                e.external_id = Some("ext-9".into());
            }
            store.upsert(e, ChangeOrigin::Local);
        }
        let ids: Vec<&str> = store
            .by_external_id("ext-9")
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(ids, vec!["local-1", "local-2"]);
    }

    #[test]
    fn persist_and_reopen() {
        let db = Database::open_memory().unwrap().shared();
        let mut store = EventStore::open(db.clone()).unwrap();
        store.upsert(event("local-1"), ChangeOrigin::Local);
        store.persist().unwrap();

        let reopened = EventStore::open(db).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get_by_id("local-1").unwrap().title, "Focus");
    }

    #[test]
    fn corrupt_blob_starts_empty() {
        let db = Database::open_memory().unwrap().shared();
        db.lock().unwrap().kv_set(EVENTS_KEY, "][").unwrap();

        let store = EventStore::open(db.clone()).unwrap();
        assert!(store.is_empty());

        let keys = db.lock().unwrap().kv_keys().unwrap();
        assert!(keys.iter().any(|k| k.starts_with("events.corrupt.")));
    }
}
