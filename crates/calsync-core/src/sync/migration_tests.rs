//! Tests for migration module.

#[cfg(test)]
mod tests {
    use super::super::migration::*;
    use crate::sync::router::TagRouter;
    use crate::sync::types::{ActionType, Event};
    use chrono::Utc;

    fn router() -> TagRouter {
        TagRouter::default()
            .with_mapping("A", "Calendar1", "One")
            .with_mapping("B", "Calendar1", "One")
            .with_mapping("C", "Calendar2", "Two")
    }

    fn synced(category: &str, external_id: &str) -> Event {
        let now = Utc::now();
        let mut e = Event::new_local("Review", now, now).with_category(category);
        e.external_id = Some(external_id.into());
        e
    }

    #[test]
    fn test_same_target_category_change_is_single_update() {
        let before = synced("A", "ext-1");
        let mut after = before.clone();
        after.category_id = Some("B".into());

        let plan = plan(&before, &after, &router());
        assert_eq!(plan.kind, PlanKind::InPlace);
        assert_eq!(
            plan.actions,
            vec![PlannedAction {
                action_type: ActionType::Update,
                calendar_id: "Calendar1".into(),
                external_id: Some("ext-1".into()),
            }]
        );
    }

    #[test]
    fn test_different_target_is_delete_then_create() {
        let before = synced("A", "ext-2");
        let mut after = before.clone();
        after.category_id = Some("C".into());

        let plan = plan(&before, &after, &router());
        assert!(plan.is_migration());
        assert_eq!(plan.source_calendar.as_deref(), Some("Calendar1"));
        assert_eq!(plan.target_calendar.as_deref(), Some("Calendar2"));
        assert_eq!(plan.actions.len(), 2);
        assert_eq!(plan.actions[0].action_type, ActionType::Delete);
        assert_eq!(plan.actions[0].calendar_id, "Calendar1");
        assert_eq!(plan.actions[0].external_id.as_deref(), Some("ext-2"));
        assert_eq!(plan.actions[1].action_type, ActionType::Create);
        assert_eq!(plan.actions[1].calendar_id, "Calendar2");
        assert_eq!(plan.actions[1].external_id, None);
    }

    #[test]
    fn test_content_edit_never_migrates() {
        let before = synced("A", "ext-3");
        let mut after = before.clone();
        after.title = "Renamed".into();
        after.start_time = after.start_time + chrono::Duration::hours(2);

        let plan = plan(&before, &after, &router());
        assert_eq!(plan.kind, PlanKind::InPlace);
        assert_eq!(plan.actions.len(), 1);
    }

    #[test]
    fn test_unmapped_new_category_keeps_current_calendar() {
        let before = synced("A", "ext-4");
        let mut after = before.clone();
        after.category_id = Some("unknown".into());

        let plan = plan(&before, &after, &router());
        assert_eq!(plan.kind, PlanKind::InPlace);
        assert_eq!(plan.target_calendar.as_deref(), Some("Calendar1"));
    }

    #[test]
    fn test_recorded_calendar_is_the_source() {
        let mut before = synced("A", "ext-5");
        before.calendar_id = Some("Calendar1".into());
        let mut after = before.clone();
        after.category_id = Some("C".into());

        let plan = plan(&before, &after, &router());
        assert!(plan.is_migration());
        assert_eq!(plan.actions[0].calendar_id, "Calendar1");
        assert_eq!(plan.actions[1].calendar_id, "Calendar2");
    }

    #[test]
    fn test_explicit_calendar_change_migrates() {
        let before = synced("A", "ext-6");
        let mut after = before.clone();
        after.calendar_id = Some("Calendar9".into());

        let plan = plan(&before, &after, &router());
        assert!(plan.is_migration());
        assert_eq!(plan.target_calendar.as_deref(), Some("Calendar9"));
    }

    #[test]
    fn test_never_pushed_event_plans_first_push() {
        let now = Utc::now();
        let before = Event::new_local("Draft", now, now).with_category("A");
        let mut after = before.clone();
        after.category_id = Some("C".into());

        let plan = plan(&before, &after, &router());
        assert_eq!(plan.kind, PlanKind::FirstPush);
        assert_eq!(plan.actions[0].action_type, ActionType::Create);
        assert_eq!(plan.actions[0].calendar_id, "Calendar2");
    }

    #[test]
    fn test_unroutable_event_plans_nothing() {
        let now = Utc::now();
        let before = Event::new_local("Draft", now, now);
        let after = before.clone();
        let plan = plan(&before, &after, &router());
        assert_eq!(plan.kind, PlanKind::Unrouted);
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn test_first_of_category_list_decides() {
        let before = synced("A", "ext-7");
        let mut after = before.clone();
        after.category_ids = vec!["C".into(), "A".into()];

        let plan = plan(&before, &after, &router());
        assert!(plan.is_migration());
    }
}
