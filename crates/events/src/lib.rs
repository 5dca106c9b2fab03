//! Domain events for the order synchronization engine.
//!
//! This crate holds event *mechanics* (records, filters, subscriber registry)
//! and the concrete sync event payloads. Storage and dispatch live in
//! `ordersync-infra`.

pub mod event;
pub mod filter;
pub mod subscription;
pub mod sync_event;

pub use event::{DomainEvent, Event, NewEvent};
pub use filter::EventFilter;
pub use subscription::{
    ALL_EVENTS, DeliveryFailure, EventHandler, HandlerError, SubscribeOptions, Subscriber,
    SubscriberRegistry, Subscription,
};
pub use sync_event::{PURCHASE_ORDER, SyncEvent};
