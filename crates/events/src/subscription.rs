//! Subscriber registry and subscription handles.
//!
//! Subscriptions are explicit objects: registering a handler returns a
//! [`Subscription`] whose `unsubscribe` removes it. Dropping the handle does
//! **not** unsubscribe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::event::DomainEvent;
use crate::filter::EventFilter;

/// Event type selector matching every event.
pub const ALL_EVENTS: &str = "*";

/// Failure reported by a subscriber's handler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("handler failed: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Synchronous in-process handler invoked for every matching event.
pub type EventHandler = Arc<dyn Fn(&DomainEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Delivery options for a subscription.
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Additional predicate on top of the event type.
    pub filter: Option<EventFilter>,
    /// Retry failed deliveries with exponential backoff.
    pub retry: bool,
    /// Retries after the first attempt (ignored unless `retry`).
    pub max_retries: u32,
    /// Delay before the first retry; doubles on every further retry.
    pub retry_delay: Duration,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            filter: None,
            retry: false,
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl SubscribeOptions {
    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.retry = true;
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }
}

/// A registered subscriber.
pub struct Subscriber {
    pub id: u64,
    event_type: String,
    handler: EventHandler,
    options: SubscribeOptions,
}

impl core::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Subscriber {
    pub fn accepts(&self, event: &DomainEvent) -> bool {
        (self.event_type == ALL_EVENTS || self.event_type == event.event_type)
            && self.options.filter.as_ref().is_none_or(|f| f.matches(event))
    }

    pub fn handle(&self, event: &DomainEvent) -> Result<(), HandlerError> {
        (self.handler)(event)
    }

    /// Total delivery attempts allowed for one event.
    pub fn max_attempts(&self) -> u32 {
        if self.options.retry {
            1 + self.options.max_retries
        } else {
            1
        }
    }

    /// Delay to wait before `attempt` (1-based; the first attempt is immediate).
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 2).min(16);
        self.options.retry_delay.saturating_mul(factor)
    }
}

/// Thread-safe list of subscribers, in registration order.
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(
        self: &Arc<Self>,
        event_type: impl Into<String>,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let subscriber = Arc::new(Subscriber {
            id,
            event_type: event_type.into(),
            handler,
            options,
        });

        // A poisoned registry still hands out a handle; it just never fires.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(subscriber);
        }

        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    pub fn remove(&self, id: u64) -> bool {
        match self.subscribers.lock() {
            Ok(mut subs) => {
                let before = subs.len();
                subs.retain(|s| s.id != id);
                subs.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.subscribers
            .lock()
            .map(|subs| subs.iter().any(|s| s.id == id))
            .unwrap_or(false)
    }

    /// Subscribers that accept `event`, in registration order.
    pub fn matching(&self, event: &DomainEvent) -> Vec<Arc<Subscriber>> {
        self.subscribers
            .lock()
            .map(|subs| subs.iter().filter(|s| s.accepts(event)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by `subscribe`.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.contains(self.id))
    }

    /// Remove the subscriber. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        self.registry
            .upgrade()
            .is_some_and(|registry| registry.remove(self.id))
    }
}

/// An event that a subscriber failed to process after all attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub subscription_id: u64,
    pub event_id: Uuid,
    pub event_type: String,
    pub entity_id: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str) -> DomainEvent {
        DomainEvent {
            event_id: Uuid::now_v7(),
            entity_id: "order-1".to_string(),
            entity_type: "purchase_order".to_string(),
            sequence_number: 1,
            event_type: event_type.to_string(),
            schema_version: 1,
            occurred_at: Utc::now(),
            payload: json!({}),
        }
    }

    fn noop() -> EventHandler {
        Arc::new(|_| Ok(()))
    }

    #[test]
    fn wildcard_and_typed_subscribers_match() {
        let registry = SubscriberRegistry::new();
        let _all = registry.register(ALL_EVENTS, noop(), SubscribeOptions::default());
        let _typed = registry.register("a", noop(), SubscribeOptions::default());

        assert_eq!(registry.matching(&event("a")).len(), 2);
        assert_eq!(registry.matching(&event("b")).len(), 1);
    }

    #[test]
    fn filter_narrows_delivery() {
        let registry = SubscriberRegistry::new();
        let filter = EventFilter::for_entity("order-2", "purchase_order");
        let _sub = registry.register(
            ALL_EVENTS,
            noop(),
            SubscribeOptions::default().with_filter(filter),
        );
        assert!(registry.matching(&event("a")).is_empty());
    }

    #[test]
    fn unsubscribe_removes_subscriber_once() {
        let registry = SubscriberRegistry::new();
        let sub = registry.register("a", noop(), SubscribeOptions::default());
        assert!(sub.is_active());
        assert!(sub.unsubscribe());
        assert!(registry.is_empty());
    }

    #[test]
    fn retry_backoff_doubles() {
        let registry = SubscriberRegistry::new();
        let _sub = registry.register(
            "a",
            noop(),
            SubscribeOptions::default().with_retry(3, Duration::from_millis(10)),
        );
        let subscriber = registry.matching(&event("a")).remove(0);
        assert_eq!(subscriber.max_attempts(), 4);
        assert_eq!(subscriber.delay_before(1), Duration::ZERO);
        assert_eq!(subscriber.delay_before(2), Duration::from_millis(10));
        assert_eq!(subscriber.delay_before(3), Duration::from_millis(20));
        assert_eq!(subscriber.delay_before(4), Duration::from_millis(40));
    }
}
