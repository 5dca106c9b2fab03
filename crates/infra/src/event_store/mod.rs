//! Append-only event store boundary.
//!
//! Streams are keyed by `(entity_type, entity_id)`. Events are never edited;
//! the only removal path is explicit retention pruning.

pub mod in_memory;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use r#trait::{EventStore, EventStoreError};
