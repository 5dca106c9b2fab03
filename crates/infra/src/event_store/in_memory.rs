use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use ordersync_core::ExpectedVersion;
use ordersync_events::{DomainEvent, EventFilter, NewEvent};

use super::r#trait::{EventStore, EventStoreError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StreamKey {
    entity_type: String,
    entity_id: String,
}

#[derive(Debug, Default)]
struct Log {
    /// Every retained event, in global append order.
    events: Vec<DomainEvent>,
    /// Highest sequence number ever assigned per stream (survives pruning).
    versions: HashMap<StreamKey, u64>,
}

/// In-memory append-only event store.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    log: RwLock<Log>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> EventStoreError {
        EventStoreError::Backend("lock poisoned".to_string())
    }
}

impl EventStore for InMemoryEventStore {
    fn append(
        &self,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let Some(first) = events.first() else {
            return Ok(vec![]);
        };

        // All events must target the same stream.
        let key = StreamKey {
            entity_type: first.entity_type.clone(),
            entity_id: first.entity_id.clone(),
        };
        for (idx, e) in events.iter().enumerate() {
            if e.entity_type != key.entity_type || e.entity_id != key.entity_id {
                return Err(EventStoreError::InvalidAppend(format!(
                    "batch contains multiple streams (index {idx})"
                )));
            }
        }

        let mut log = self.log.write().map_err(|_| Self::poisoned())?;
        let current = log.versions.get(&key).copied().unwrap_or(0);

        if !expected_version.matches(current) {
            return Err(EventStoreError::Concurrency(format!(
                "expected {expected_version:?}, found {current}"
            )));
        }

        let mut next = current;
        let mut committed = Vec::with_capacity(events.len());
        for e in events {
            next += 1;
            let stored = DomainEvent::committed(e, next);
            log.events.push(stored.clone());
            committed.push(stored);
        }
        log.versions.insert(key, next);

        Ok(committed)
    }

    fn load_stream(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        let log = self.log.read().map_err(|_| Self::poisoned())?;
        Ok(log
            .events
            .iter()
            .filter(|e| e.entity_type == entity_type && e.entity_id == entity_id)
            .cloned()
            .collect())
    }

    fn query(&self, filter: &EventFilter) -> Result<Vec<DomainEvent>, EventStoreError> {
        let log = self.log.read().map_err(|_| Self::poisoned())?;
        Ok(log.events.iter().filter(|e| filter.matches(e)).cloned().collect())
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EventStoreError> {
        let mut log = self.log.write().map_err(|_| Self::poisoned())?;
        let before = log.events.len();
        log.events.retain(|e| e.occurred_at >= cutoff);
        let removed = before - log.events.len();
        if removed > 0 {
            tracing::info!(removed, %cutoff, "pruned events past retention");
        }
        Ok(removed)
    }
}
