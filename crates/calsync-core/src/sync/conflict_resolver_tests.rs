//! Tests for conflict_resolver module.

#[cfg(test)]
mod tests {
    use super::super::conflict_resolver::*;
    use crate::sync::event_codec::RemoteEvent;
    use crate::sync::types::{Event, SyncStatus};
    use chrono::{DateTime, TimeZone, Utc};

    fn t(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 5, 1, hour, 0, 0).unwrap()
    }

    fn synced_at(id: &str, external_id: &str, synced: DateTime<Utc>) -> Event {
        let mut e = Event::new_local("Sync", t(8), t(9));
        e.id = id.to_string();
        e.external_id = Some(external_id.to_string());
        e.sync_status = SyncStatus::Synced;
        e.last_sync_time = Some(synced);
        e
    }

    fn remote(id: &str, modified: DateTime<Utc>) -> RemoteEvent {
        RemoteEvent {
            id: id.to_string(),
            calendar_id: "cal-remote".into(),
            subject: "Remote title".into(),
            description: "remote body".into(),
            start: t(14),
            end: t(15),
            is_all_day: false,
            location: "Remote room".into(),
            last_modified: modified,
            is_removed: false,
        }
    }

    #[test]
    fn test_remote_not_newer_is_unchanged() {
        let local = synced_at("local-1", "ext-1", t(10));
        assert_eq!(decide_merge(&local, t(10)), MergeDecision::Unchanged);
        assert_eq!(decide_merge(&local, t(9)), MergeDecision::Unchanged);
    }

    #[test]
    fn test_remote_newer_without_local_changes_wins() {
        let local = synced_at("local-1", "ext-1", t(10));
        assert_eq!(decide_merge(&local, t(11)), MergeDecision::UseRemote);
    }

    #[test]
    fn test_both_changed_latest_wins() {
        let mut local = synced_at("local-1", "ext-1", t(10));
        local.touch_local(t(12));
        assert_eq!(decide_merge(&local, t(11)), MergeDecision::UseLocal);

        let mut local = synced_at("local-1", "ext-1", t(10));
        local.touch_local(t(11));
        assert_eq!(decide_merge(&local, t(12)), MergeDecision::UseRemote);
    }

    #[test]
    fn test_counter_overrides_skewed_clock() {
        let mut local = synced_at("local-1", "ext-1", t(10));
        local.local_version = 3;
        local.synced_version = 3;
        // Wall clock claims a later local edit, but the counters say it was pushed.
        local.last_local_change = Some(t(13));
        assert_eq!(decide_merge(&local, t(12)), MergeDecision::UseRemote);
    }

    #[test]
    fn test_apply_remote_keeps_routing_fields() {
        let mut local = synced_at("local-1", "ext-1", t(10));
        local.category_id = Some("work".into());
        local.category_ids = vec!["work".into(), "urgent".into()];
        local.calendar_id = Some("cal-work".into());
        local.local_version = 2;

        apply_remote_content(&mut local, &remote("ext-1", t(11)), t(12));

        assert_eq!(local.title, "Remote title");
        assert_eq!(local.description, "remote body");
        assert_eq!(local.start_time, t(14));
        assert_eq!(local.location, "Remote room");
        assert_eq!(local.category_id.as_deref(), Some("work"));
        assert_eq!(local.category_ids, vec!["work".to_string(), "urgent".to_string()]);
        assert_eq!(local.calendar_id.as_deref(), Some("cal-work"));
        assert_eq!(local.synced_version, 2);
        assert_eq!(local.last_sync_time, Some(t(12)));
        assert_eq!(local.sync_status, SyncStatus::Synced);
    }

    #[test]
    fn test_dedup_keeps_latest_sync() {
        let e3 = synced_at("local-3", "ext-9", t(12));
        let e4 = synced_at("local-4", "ext-9", t(10));
        let groups = find_duplicates([&e3, &e4], None);
        assert_eq!(
            groups,
            vec![DedupGroup {
                external_id: "ext-9".into(),
                survivor: "local-3".into(),
                losers: vec!["local-4".into()],
            }]
        );
    }

    #[test]
    fn test_dedup_tie_prefers_selection_then_larger_id() {
        let a = synced_at("local-a", "ext-1", t(10));
        let b = synced_at("local-b", "ext-1", t(10));
        assert_eq!(pick_survivor(&[&a, &b], None).unwrap().id, "local-b");
        assert_eq!(pick_survivor(&[&a, &b], Some("local-a")).unwrap().id, "local-a");
        // Selection never beats a strictly newer sync.
        let c = synced_at("local-c", "ext-1", t(11));
        assert_eq!(pick_survivor(&[&a, &c], Some("local-a")).unwrap().id, "local-c");
    }

    #[test]
    fn test_dedup_never_synced_loses() {
        let mut never = synced_at("local-z", "ext-1", t(10));
        never.last_sync_time = None;
        let synced = synced_at("local-a", "ext-1", t(9));
        assert_eq!(pick_survivor(&[&never, &synced], None).unwrap().id, "local-a");
    }

    #[test]
    fn test_dedup_ignores_unique_and_unsynced() {
        let a = synced_at("local-a", "ext-1", t(10));
        let b = synced_at("local-b", "ext-2", t(10));
        let mut c = Event::new_local("fresh", t(1), t(2));
        c.id = "local-c".into();
        let mut d = c.clone();
        d.id = "local-d".into();
        assert!(find_duplicates([&a, &b, &c, &d], None).is_empty());
    }
}
