//! Update-in-place vs delete+create decisions for edited events.
//!
//! The planner is pure: it compares where an event lives now with where its
//! new routing sends it and returns the remote actions needed. The caller
//! enqueues them and, for a migration, clears the event's `external_id`
//! until the create succeeds.

use crate::sync::router::TagRouter;
use crate::sync::types::{ActionType, Event};

/// Kind of plan produced for an edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanKind {
    /// Same calendar: a single update.
    InPlace,
    /// Calendar changed: delete from the old one, create in the new one.
    Migration,
    /// Never reached the remote: a create against the target.
    FirstPush,
    /// No calendar can be resolved; nothing to send yet.
    Unrouted,
}

/// One remote action the plan calls for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedAction {
    pub action_type: ActionType,
    pub calendar_id: String,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationPlan {
    pub kind: PlanKind,
    /// Calendar the remote copy lives in before the edit.
    pub source_calendar: Option<String>,
    /// Calendar the event belongs in after the edit.
    pub target_calendar: Option<String>,
    /// In execution order.
    pub actions: Vec<PlannedAction>,
}

impl MigrationPlan {
    pub fn is_migration(&self) -> bool {
        self.kind == PlanKind::Migration
    }

    fn unrouted() -> Self {
        Self {
            kind: PlanKind::Unrouted,
            source_calendar: None,
            target_calendar: None,
            actions: Vec::new(),
        }
    }
}

/// Whether the edit touched the routing inputs.
pub fn routing_changed(before: &Event, after: &Event) -> bool {
    before.canonical_category() != after.canonical_category()
        || before.calendar_id != after.calendar_id
}

/// Calendar an edited event should target.
///
/// An explicit calendar change wins. A category change routes through the
/// mapping table; a new category without a mapping keeps the current calendar.
pub fn target_calendar(before: &Event, after: &Event, router: &TagRouter) -> Option<String> {
    let current = router.resolve(before);

    if after.calendar_id.is_some() && after.calendar_id != before.calendar_id {
        return after.calendar_id.clone();
    }
    if before.canonical_category() != after.canonical_category() {
        let mapped = after
            .canonical_category()
            .and_then(|c| router.route(c))
            .map(str::to_string);
        return mapped.or(current);
    }
    current
}

/// Plan the remote actions for an edit from `before` to `after`.
pub fn plan(before: &Event, after: &Event, router: &TagRouter) -> MigrationPlan {
    let source = router.resolve(before);
    let target = if routing_changed(before, after) {
        target_calendar(before, after, router)
    } else {
        source.clone()
    };

    let Some(external_id) = before.external_id.clone() else {
        return match target {
            Some(calendar_id) => MigrationPlan {
                kind: PlanKind::FirstPush,
                source_calendar: None,
                target_calendar: Some(calendar_id.clone()),
                actions: vec![PlannedAction {
                    action_type: ActionType::Create,
                    calendar_id,
                    external_id: None,
                }],
            },
            None => MigrationPlan::unrouted(),
        };
    };

    match (source, target) {
        (Some(source), Some(target)) if source != target => MigrationPlan {
            kind: PlanKind::Migration,
            source_calendar: Some(source.clone()),
            target_calendar: Some(target.clone()),
            actions: vec![
                PlannedAction {
                    action_type: ActionType::Delete,
                    calendar_id: source,
                    external_id: Some(external_id),
                },
                PlannedAction {
                    action_type: ActionType::Create,
                    calendar_id: target,
                    external_id: None,
                },
            ],
        },
        (source, target) => match target.or(source) {
            Some(calendar_id) => MigrationPlan {
                kind: PlanKind::InPlace,
                source_calendar: Some(calendar_id.clone()),
                target_calendar: Some(calendar_id.clone()),
                actions: vec![PlannedAction {
                    action_type: ActionType::Update,
                    calendar_id,
                    external_id: Some(external_id),
                }],
            },
            None => MigrationPlan::unrouted(),
        },
    }
}
