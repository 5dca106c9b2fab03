use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::DomainEvent;

/// Filter criteria for event queries, replays and subscriptions.
///
/// Every `None` criterion matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFilter {
    pub entity_id: Option<String>,
    pub entity_type: Option<String>,
    pub event_type: Option<String>,
    /// Inclusive lower bound on `occurred_at`.
    pub occurred_after: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `occurred_at`.
    pub occurred_before: Option<DateTime<Utc>>,
}

impl EventFilter {
    pub fn for_entity(entity_id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            entity_type: Some(entity_type.into()),
            ..Default::default()
        }
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn matches(&self, event: &DomainEvent) -> bool {
        self.entity_id.as_deref().is_none_or(|id| id == event.entity_id)
            && self
                .entity_type
                .as_deref()
                .is_none_or(|t| t == event.entity_type)
            && self
                .event_type
                .as_deref()
                .is_none_or(|t| t == event.event_type)
            && self.occurred_after.is_none_or(|t| event.occurred_at >= t)
            && self.occurred_before.is_none_or(|t| event.occurred_at < t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn event(entity_id: &str, event_type: &str) -> DomainEvent {
        DomainEvent {
            event_id: Uuid::now_v7(),
            entity_id: entity_id.to_string(),
            entity_type: "purchase_order".to_string(),
            sequence_number: 1,
            event_type: event_type.to_string(),
            schema_version: 1,
            occurred_at: Utc::now(),
            payload: json!({}),
        }
    }

    #[test]
    fn empty_filter_matches_everything() {
        assert!(EventFilter::default().matches(&event("a", "x")));
    }

    #[test]
    fn criteria_are_conjunctive() {
        let filter = EventFilter::for_entity("a", "purchase_order").with_event_type("x");
        assert!(filter.matches(&event("a", "x")));
        assert!(!filter.matches(&event("b", "x")));
        assert!(!filter.matches(&event("a", "y")));
    }
}
