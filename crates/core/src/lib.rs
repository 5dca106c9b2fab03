//! `ordersync-core`: building blocks shared by the order synchronization engine.
//!
//! This crate contains **pure** primitives (no IO, no async).

pub mod conflict;
pub mod error;
pub mod id;
pub mod money;
pub mod sync_status;
pub mod version;

pub use conflict::{ConflictType, ResolutionStrategy};
pub use error::{DomainError, DomainResult, ErrorClass};
pub use id::{ConflictId, OrderId, OrderItemId, RemoteId};
pub use money::{Money, TaxRate, ValueObject};
pub use sync_status::{SyncDirection, SyncOperation, SyncStatus};
pub use version::{ExpectedVersion, Versioned};
