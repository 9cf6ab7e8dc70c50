//! Category to remote calendar routing.
//!
//! Pure lookup over the configured mapping table. Changing the table does not
//! touch existing events; the next sync round re-evaluates them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::sync::types::Event;

/// Target of a category mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarMapping {
    pub calendar_id: String,
    #[serde(default)]
    pub calendar_name: String,
}

impl CalendarMapping {
    pub fn new(calendar_id: impl Into<String>, calendar_name: impl Into<String>) -> Self {
        Self {
            calendar_id: calendar_id.into(),
            calendar_name: calendar_name.into(),
        }
    }
}

/// Maps categories to remote calendars.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TagRouter {
    mappings: BTreeMap<String, CalendarMapping>,
    default_calendar: Option<String>,
}

impl TagRouter {
    pub fn new(
        mappings: BTreeMap<String, CalendarMapping>,
        default_calendar: Option<String>,
    ) -> Self {
        Self {
            mappings,
            default_calendar,
        }
    }

    /// Builder-style mapping insert.
    pub fn with_mapping(
        mut self,
        category_id: impl Into<String>,
        calendar_id: impl Into<String>,
        calendar_name: impl Into<String>,
    ) -> Self {
        self.mappings.insert(
            category_id.into(),
            CalendarMapping::new(calendar_id, calendar_name),
        );
        self
    }

    pub fn with_default_calendar(mut self, calendar_id: impl Into<String>) -> Self {
        self.default_calendar = Some(calendar_id.into());
        self
    }

    pub fn mappings(&self) -> &BTreeMap<String, CalendarMapping> {
        &self.mappings
    }

    pub fn default_calendar(&self) -> Option<&str> {
        self.default_calendar.as_deref()
    }

    /// Calendar mapped to `category_id`, ignoring the default.
    pub fn route(&self, category_id: &str) -> Option<&str> {
        self.mappings
            .get(category_id)
            .map(|m| m.calendar_id.as_str())
    }

    /// Calendar for an optional category, falling back to the default calendar.
    pub fn route_calendar(&self, category_id: Option<&str>) -> Option<&str> {
        category_id
            .and_then(|c| self.route(c))
            .or(self.default_calendar.as_deref())
    }

    /// Where `event` should live: its explicit calendar, then its canonical
    /// category mapping, then the default calendar.
    pub fn resolve(&self, event: &Event) -> Option<String> {
        event
            .calendar_id
            .as_deref()
            .or_else(|| self.route_calendar(event.canonical_category()))
            .map(str::to_string)
    }

    /// Routing that does not rely on the default calendar.
    pub fn has_explicit_route(&self, event: &Event) -> bool {
        event.calendar_id.is_some()
            || event
                .canonical_category()
                .is_some_and(|c| self.route(c).is_some())
    }

    /// Every distinct calendar this router can send events to.
    pub fn calendars(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .mappings
            .values()
            .map(|m| m.calendar_id.clone())
            .chain(self.default_calendar.clone())
            .collect();
        out.sort();
        out.dedup();
        out
    }
}
