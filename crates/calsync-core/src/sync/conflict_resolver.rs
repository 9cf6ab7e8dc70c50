//! Conflict resolution and deduplication for synced events.
//!
//! Resolution is last-writer-wins. Remote changes never touch the local
//! routing fields (`category_id`, `category_ids`, `calendar_id`).

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::sync::event_codec::RemoteEvent;
use crate::sync::types::{Event, SyncStatus};

/// Merge decision for a remote version of a local event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Keep local content; it will be pushed.
    UseLocal,
    /// Overwrite local content with the remote version.
    UseRemote,
    /// Remote has not changed since the last sync.
    Unchanged,
}

/// Decide between a local event and a remote version modified at `remote_modified`.
///
/// The remote is considered changed when it was modified after the local
/// `last_sync_time`. If only one side changed, that side wins. If both did,
/// the later of `remote_modified` and `last_local_change` wins.
pub fn decide_merge(local: &Event, remote_modified: DateTime<Utc>) -> MergeDecision {
    let remote_changed = local
        .last_sync_time
        .map_or(true, |synced| remote_modified > synced);
    if !remote_changed {
        return MergeDecision::Unchanged;
    }
    if !local.has_unpushed_changes() {
        return MergeDecision::UseRemote;
    }

    match local.last_local_change {
        Some(changed) if changed >= remote_modified => MergeDecision::UseLocal,
        _ => MergeDecision::UseRemote,
    }
}

/// Overwrite content fields with the remote version and mark the event synced.
pub fn apply_remote_content(local: &mut Event, remote: &RemoteEvent, now: DateTime<Utc>) {
    local.title = remote.subject.clone();
    local.description = remote.description.clone();
    local.start_time = remote.start;
    local.end_time = remote.end;
    local.is_all_day = remote.is_all_day;
    local.location = remote.location.clone();
    local.external_id = Some(remote.id.clone());

    local.synced_version = local.local_version;
    local.last_sync_time = Some(now.max(remote.last_modified));
    local.sync_error = None;
    if local.sync_status != SyncStatus::LocalOnly {
        local.sync_status = SyncStatus::Synced;
    }
}

/// Events sharing one remote identity, split into the survivor and the rest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupGroup {
    pub external_id: String,
    pub survivor: String,
    pub losers: Vec<String>,
}

fn survivor_order(a: &Event, b: &Event, preferred: Option<&str>) -> Ordering {
    a.last_sync_time
        .cmp(&b.last_sync_time)
        .then_with(|| {
            let a_pref = preferred == Some(a.id.as_str());
            let b_pref = preferred == Some(b.id.as_str());
            a_pref.cmp(&b_pref)
        })
        .then_with(|| a.id.cmp(&b.id))
}

/// Pick the event to keep among duplicates.
///
/// Greatest `last_sync_time` wins; on an exact tie the `preferred` event
/// (current selection), then the lexicographically larger id.
pub fn pick_survivor<'a>(events: &[&'a Event], preferred: Option<&str>) -> Option<&'a Event> {
    events
        .iter()
        .copied()
        .max_by(|a, b| survivor_order(a, b, preferred))
}

/// Group events by `external_id` and return every group with duplicates.
pub fn find_duplicates<'a, I>(events: I, preferred: Option<&str>) -> Vec<DedupGroup>
where
    I: IntoIterator<Item = &'a Event>,
{
    let mut groups: BTreeMap<&str, Vec<&Event>> = BTreeMap::new();
    for event in events {
        if let Some(external_id) = event.external_id.as_deref() {
            groups.entry(external_id).or_default().push(event);
        }
    }

    groups
        .into_iter()
        .filter(|(_, members)| members.len() > 1)
        .filter_map(|(external_id, members)| {
            let survivor = pick_survivor(&members, preferred)?;
            let losers = members
                .iter()
                .filter(|e| e.id != survivor.id)
                .map(|e| e.id.clone())
                .collect();
            Some(DedupGroup {
                external_id: external_id.to_string(),
                survivor: survivor.id.clone(),
                losers,
            })
        })
        .collect()
}
