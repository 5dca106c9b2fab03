use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use ordersync_core::ExpectedVersion;
use ordersync_events::{DomainEvent, EventFilter, NewEvent};

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, concurrency) as opposed to
/// domain errors (validation, invariants).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("optimistic concurrency check failed: {0}")]
    Concurrency(String),

    #[error("invalid append: {0}")]
    InvalidAppend(String),

    #[error("event store backend failed: {0}")]
    Backend(String),
}

/// Append-only, per-entity event store.
///
/// ## Append Semantics
///
/// `append()`:
/// - Validates scoping (all events in a batch must target the same entity)
/// - Checks optimistic concurrency against the stream's current version
/// - Assigns sequence numbers starting at `current_version + 1`
/// - Persists events atomically (all or nothing)
///
/// ## Retention
///
/// `delete_older_than()` drops events whose `occurred_at` is before the
/// cutoff. Stream versions are not reset: the next append continues after
/// the highest sequence number ever assigned.
pub trait EventStore: Send + Sync {
    fn append(
        &self,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Full stream of one entity, in sequence order.
    fn load_stream(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<DomainEvent>, EventStoreError>;

    /// Events matching `filter`, in global append order.
    fn query(&self, filter: &EventFilter) -> Result<Vec<DomainEvent>, EventStoreError>;

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EventStoreError>;
}

impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    fn append(
        &self,
        events: Vec<NewEvent>,
        expected_version: ExpectedVersion,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).append(events, expected_version)
    }

    fn load_stream(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).load_stream(entity_type, entity_id)
    }

    fn query(&self, filter: &EventFilter) -> Result<Vec<DomainEvent>, EventStoreError> {
        (**self).query(filter)
    }

    fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EventStoreError> {
        (**self).delete_older_than(cutoff)
    }
}
