//! Tests for action_queue module.

#[cfg(test)]
mod tests {
    use super::super::action_queue::*;
    use crate::error::ValidationError;
    use crate::storage::Database;
    use crate::sync::retry::RetryPolicy;
    use crate::sync::types::*;
    use chrono::{Duration, Utc};

    fn event(id: &str) -> Event {
        let now = Utc::now();
        let mut e = Event::new_local("Write report", now, now + Duration::hours(1));
        e.id = id.to_string();
        e
    }

    fn synced_event(id: &str, external_id: &str) -> Event {
        let mut e = event(id);
        e.external_id = Some(external_id.to_string());
        e.sync_status = SyncStatus::Synced;
        e
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: std::time::Duration::from_millis(100),
            max_delay: std::time::Duration::from_millis(1000),
        }
    }

    #[test]
    fn test_ids_are_monotonic() {
        let mut queue = ActionQueue::new();
        let a = queue.enqueue(NewAction::create(&event("local-1"), None)).unwrap();
        let b = queue.enqueue(NewAction::create(&event("local-2"), None)).unwrap();
        assert_eq!(a, EnqueueOutcome::Appended(1));
        assert_eq!(b, EnqueueOutcome::Appended(2));
        let pending: Vec<ActionId> = queue.list_pending().iter().map(|a| a.id).collect();
        assert_eq!(pending, vec![1, 2]);
    }

    #[test]
    fn test_updates_coalesce_to_last_payload() {
        let mut queue = ActionQueue::new();
        let mut e = synced_event("local-1", "ext-1");
        for i in 0..5 {
            e.title = format!("v{i}");
            queue.enqueue(NewAction::update(&e, Some("cal".into()))).unwrap();
        }
        let pending = queue.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_type, ActionType::Update);
        assert_eq!(pending[0].data.title, "v4");
    }

    #[test]
    fn test_update_coalesces_into_pending_create() {
        let mut queue = ActionQueue::new();
        let mut e = event("local-1");
        let first = queue.enqueue(NewAction::create(&e, Some("cal".into()))).unwrap();
        e.title = "edited".into();
        let second = queue.enqueue(NewAction::update(&e, None)).unwrap();

        assert_eq!(second, EnqueueOutcome::Coalesced(first.action_id().unwrap()));
        let pending = queue.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_type, ActionType::Create);
        assert_eq!(pending[0].data.title, "edited");
        assert_eq!(pending[0].calendar_id.as_deref(), Some("cal"));
    }

    #[test]
    fn test_delete_of_never_synced_event_is_local_only() {
        let mut queue = ActionQueue::new();
        let e = event("local-1");
        queue.enqueue(NewAction::create(&e, None)).unwrap();
        queue.enqueue(NewAction::update(&e, None)).unwrap();
        let outcome = queue.enqueue(NewAction::delete(&e, None)).unwrap();

        assert_eq!(outcome, EnqueueOutcome::LocalOnly { cancelled: vec![1] });
        assert!(queue.is_empty());
        assert!(!queue.has_entry_for("local-1"));
    }

    #[test]
    fn test_delete_supersedes_pending_update() {
        let mut queue = ActionQueue::new();
        let e = synced_event("local-1", "ext-1");
        queue.enqueue(NewAction::update(&e, Some("cal".into()))).unwrap();
        let outcome = queue.enqueue(NewAction::delete(&e, Some("cal".into()))).unwrap();

        assert_eq!(outcome, EnqueueOutcome::Superseded { id: 2, cancelled: vec![1] });
        let pending = queue.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].action_type, ActionType::Delete);
        assert_eq!(pending[0].external_id.as_deref(), Some("ext-1"));
    }

    #[test]
    fn test_create_after_delete_is_appended() {
        let mut queue = ActionQueue::new();
        let before = synced_event("local-1", "ext-1");
        queue.enqueue(NewAction::delete(&before, Some("cal-1".into()))).unwrap();
        let mut after = before.clone();
        after.external_id = None;
        let outcome = queue.enqueue(NewAction::create(&after, Some("cal-2".into()))).unwrap();

        assert_eq!(outcome, EnqueueOutcome::Appended(2));
        let types: Vec<ActionType> = queue.list_pending().iter().map(|a| a.action_type).collect();
        assert_eq!(types, vec![ActionType::Delete, ActionType::Create]);
    }

    #[test]
    fn test_second_delete_coalesces() {
        let mut queue = ActionQueue::new();
        let e = synced_event("local-1", "ext-1");
        queue.enqueue(NewAction::delete(&e, Some("cal".into()))).unwrap();
        let outcome = queue.enqueue(NewAction::delete(&e, Some("cal".into()))).unwrap();
        assert_eq!(outcome, EnqueueOutcome::Coalesced(1));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_rejects_non_remarkable_event() {
        let mut queue = ActionQueue::new();
        let mut e = event("outlook-AAA");
        e.remarkable_source = false;
        let err = queue.enqueue(NewAction::update(&e, None)).unwrap_err();
        assert_eq!(err, ValidationError::NotRemarkable { entity_id: "outlook-AAA".into() });
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remote_echo_is_suppressed() {
        let mut queue = ActionQueue::new();
        let e = event("local-1");
        let outcome = queue
            .enqueue(NewAction::update(&e, None).with_source(ActionSource::RemoteEcho))
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::EchoSuppressed);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_list_ready_returns_one_head_per_entity() {
        let mut queue = ActionQueue::new();
        let e1 = synced_event("local-1", "ext-1");
        queue.enqueue(NewAction::delete(&e1, Some("cal-1".into()))).unwrap();
        let mut moved = e1.clone();
        moved.external_id = None;
        queue.enqueue(NewAction::create(&moved, Some("cal-2".into()))).unwrap();
        queue.enqueue(NewAction::create(&event("local-2"), None)).unwrap();

        let ready: Vec<ActionId> = queue.list_ready(Utc::now(), false).iter().map(|a| a.id).collect();
        assert_eq!(ready, vec![1, 3]);

        queue.mark_synchronized(1, Utc::now()).unwrap();
        let ready: Vec<ActionId> = queue.list_ready(Utc::now(), false).iter().map(|a| a.id).collect();
        assert_eq!(ready, vec![2, 3]);
    }

    #[test]
    fn test_debounce_delays_readiness_unless_forced() {
        let mut queue = ActionQueue::new().with_debounce(std::time::Duration::from_millis(1500));
        let now = Utc::now();
        queue.enqueue_at(NewAction::create(&event("local-1"), None), now).unwrap();

        assert!(queue.list_ready(now, false).is_empty());
        assert_eq!(queue.list_ready(now, true).len(), 1);
        assert_eq!(queue.list_ready(now + Duration::seconds(2), false).len(), 1);
        assert_eq!(
            queue.time_until_next_ready(now),
            Some(Duration::milliseconds(1500))
        );
        assert_eq!(queue.time_until_next_ready(now + Duration::seconds(2)), None);
    }

    #[test]
    fn test_mark_synchronized_is_idempotent() {
        let mut queue = ActionQueue::new();
        queue.enqueue(NewAction::create(&event("local-1"), None)).unwrap();
        assert!(queue.mark_synchronized(1, Utc::now()).unwrap());
        assert!(!queue.mark_synchronized(1, Utc::now()).unwrap());
        assert!(queue.list_ready(Utc::now(), true).is_empty());
        assert_eq!(
            queue.mark_synchronized(99, Utc::now()),
            Err(ValidationError::ActionNotFound { action_id: 99 })
        );
    }

    #[test]
    fn test_retryable_failure_backs_off_then_dead_letters() {
        let mut queue = ActionQueue::new();
        queue.enqueue(NewAction::create(&event("local-1"), None)).unwrap();
        let now = Utc::now();

        for attempt in 1..=3 {
            match queue.mark_failed(1, &SyncError::Timeout, &policy(), now).unwrap() {
                FailureOutcome::Retrying { retry_count, retry_at } => {
                    assert_eq!(retry_count, attempt);
                    assert!(retry_at > now);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert!(queue.list_ready(now, false).is_empty());

        let outcome = queue.mark_failed(1, &SyncError::Timeout, &policy(), now).unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered { retry_count: 4 });
        assert_eq!(queue.dead_letters().len(), 1);
        assert!(queue.list_pending().is_empty());
        assert!(queue.has_entry_for("local-1"));
    }

    #[test]
    fn test_terminal_failure_dead_letters_immediately() {
        let mut queue = ActionQueue::new();
        queue.enqueue(NewAction::create(&event("local-1"), None)).unwrap();
        let outcome = queue
            .mark_failed(1, &SyncError::Unauthorized, &policy(), Utc::now())
            .unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered { retry_count: 1 });
        assert_eq!(
            queue.get(1).unwrap().last_error.as_deref(),
            Some("Unauthorized after token refresh")
        );
    }

    #[test]
    fn test_dead_head_blocks_entity() {
        let mut queue = ActionQueue::new();
        let e = synced_event("local-1", "ext-1");
        queue.enqueue(NewAction::delete(&e, Some("cal-1".into()))).unwrap();
        let mut moved = e.clone();
        moved.external_id = None;
        queue.enqueue(NewAction::create(&moved, Some("cal-2".into()))).unwrap();
        queue
            .mark_failed(1, &SyncError::Unauthorized, &policy(), Utc::now())
            .unwrap();

        assert!(queue.list_ready(Utc::now(), true).is_empty());
        queue.retry_dead_letter(1).unwrap();
        assert_eq!(queue.list_ready(Utc::now(), true)[0].id, 1);
    }

    #[test]
    fn test_dead_letter_management() {
        let mut queue = ActionQueue::new();
        queue.enqueue(NewAction::create(&event("local-1"), None)).unwrap();
        queue.enqueue(NewAction::create(&event("local-2"), None)).unwrap();
        let now = Utc::now();
        queue.mark_failed(1, &SyncError::Unauthorized, &policy(), now).unwrap();
        queue.mark_failed(2, &SyncError::Unauthorized, &policy(), now).unwrap();

        assert_eq!(
            queue.retry_dead_letter(3),
            Err(ValidationError::ActionNotFound { action_id: 3 })
        );
        assert_eq!(queue.retry_all_dead_letters(), vec![1, 2]);
        assert_eq!(queue.get(1).unwrap().retry_count, 0);
        assert_eq!(
            queue.retry_dead_letter(1),
            Err(ValidationError::NotDeadLettered { action_id: 1 })
        );

        queue.mark_failed(2, &SyncError::Unauthorized, &policy(), now).unwrap();
        let discarded = queue.discard_dead_letter(2).unwrap();
        assert_eq!(discarded.entity_id, "local-2");
        assert!(!queue.has_entry_for("local-2"));
        assert!(queue.discard_dead_letter(1).is_err());
    }

    #[test]
    fn test_new_edit_revives_dead_lettered_action() {
        let mut queue = ActionQueue::new();
        let mut e = event("local-1");
        queue.enqueue(NewAction::create(&e, None)).unwrap();
        queue
            .mark_failed(1, &SyncError::Http { status: 400, message: "bad".into() }, &policy(), Utc::now())
            .unwrap();

        e.title = "fixed".into();
        assert_eq!(
            queue.enqueue(NewAction::update(&e, None)).unwrap(),
            EnqueueOutcome::Coalesced(1)
        );
        assert!(queue.dead_letters().is_empty());
        assert_eq!(queue.list_pending()[0].data.title, "fixed");
    }

    #[test]
    fn test_cleanup_keeps_recent_and_dead_letters() {
        let mut queue = ActionQueue::new();
        let now = Utc::now();
        queue.enqueue(NewAction::create(&event("local-1"), None)).unwrap();
        queue.enqueue(NewAction::create(&event("local-2"), None)).unwrap();
        queue.enqueue(NewAction::create(&event("local-3"), None)).unwrap();
        queue.mark_synchronized(1, now - Duration::minutes(10)).unwrap();
        queue.mark_synchronized(2, now).unwrap();
        queue.mark_failed(3, &SyncError::Unauthorized, &policy(), now).unwrap();

        assert_eq!(queue.cleanup_synchronized(now, Duration::minutes(5)), 1);
        assert!(queue.get(1).is_none());
        assert!(queue.get(2).is_some());
        assert_eq!(queue.dead_letters().len(), 1);
        assert_eq!(
            queue.counts(),
            QueueCounts { pending: 0, dead_lettered: 1, synchronized: 1 }
        );
    }

    #[test]
    fn test_assign_external_id_and_convert_to_create() {
        let mut queue = ActionQueue::new();
        let e = event("local-1");
        queue.enqueue(NewAction::create(&e, Some("cal".into()))).unwrap();
        queue.mark_synchronized(1, Utc::now()).unwrap();
        queue.enqueue(NewAction::update(&e, Some("cal".into()))).unwrap();

        queue.assign_external_id("local-1", "ext-1");
        assert_eq!(queue.get(2).unwrap().external_id.as_deref(), Some("ext-1"));

        queue.convert_to_create(2).unwrap();
        let action = queue.get(2).unwrap();
        assert_eq!(action.action_type, ActionType::Create);
        assert_eq!(action.external_id, None);
    }

    #[test]
    fn test_persist_and_reopen_keeps_ids() {
        let db = Database::open_memory().unwrap().shared();
        let mut queue = ActionQueue::open(db.clone()).unwrap();
        queue.enqueue(NewAction::create(&event("local-1"), None)).unwrap();
        queue.enqueue(NewAction::create(&event("local-2"), None)).unwrap();
        queue.mark_synchronized(2, Utc::now()).unwrap();
        queue.cleanup_synchronized(Utc::now() + Duration::hours(1), Duration::zero());
        queue.persist().unwrap();

        let mut reopened = ActionQueue::open(db).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(
            reopened.enqueue(NewAction::create(&event("local-3"), None)).unwrap(),
            EnqueueOutcome::Appended(3)
        );
    }

    #[test]
    fn test_corrupt_queue_does_not_touch_events() {
        let db = Database::open_memory().unwrap().shared();
        {
            let guard = db.lock().unwrap();
            guard.kv_set(ACTION_QUEUE_KEY, "{\"nextId\":").unwrap();
            guard.kv_set("events", "[]").unwrap();
        }
        let queue = ActionQueue::open(db.clone()).unwrap();
        assert!(queue.is_empty());
        assert_eq!(db.lock().unwrap().kv_get("events").unwrap().as_deref(), Some("[]"));
    }
}
