use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

/// A domain-agnostic event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - designed to be **append-only**
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name/type identifier (e.g. "sync.order.synced").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32;

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}

/// An event ready to be appended (not yet assigned a stream position).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_id: Uuid,
    pub entity_id: String,
    pub entity_type: String,

    pub event_type: String,
    pub schema_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl NewEvent {
    /// Wrap a typed event with the entity it concerns.
    pub fn from_typed<E>(
        entity_id: impl Into<String>,
        entity_type: impl Into<String>,
        event: &E,
    ) -> Result<Self, serde_json::Error>
    where
        E: Event + Serialize,
    {
        Ok(Self {
            event_id: Uuid::now_v7(),
            entity_id: entity_id.into(),
            entity_type: entity_type.into(),
            event_type: event.event_type().to_string(),
            schema_version: event.version(),
            occurred_at: event.occurred_at(),
            payload: serde_json::to_value(event)?,
        })
    }
}

/// A published event.
///
/// `sequence_number` is the monotonic version of the entity's stream: the
/// first event for an entity is 1 and every later one is strictly greater.
/// Published events are never edited; new facts are appended instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    pub event_id: Uuid,
    pub entity_id: String,
    pub entity_type: String,

    pub sequence_number: u64,

    pub event_type: String,
    pub schema_version: u32,
    pub occurred_at: DateTime<Utc>,

    pub payload: JsonValue,
}

impl DomainEvent {
    pub fn committed(event: NewEvent, sequence_number: u64) -> Self {
        Self {
            event_id: event.event_id,
            entity_id: event.entity_id,
            entity_type: event.entity_type,
            sequence_number,
            event_type: event.event_type,
            schema_version: event.schema_version,
            occurred_at: event.occurred_at,
            payload: event.payload,
        }
    }

    /// Decode the payload back into its typed form.
    pub fn decode<E: DeserializeOwned>(&self) -> Result<E, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}
