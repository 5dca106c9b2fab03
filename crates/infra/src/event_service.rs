//! Publish/subscribe over the event store.
//!
//! Publishing appends first and fans out only after the append succeeded.
//! Fan-out is serialized by a dispatch lock, so every subscriber observes
//! events in publish order.
//!
//! Only the first delivery attempt runs under the lock. A subscriber whose
//! handler fails gets a retry worker; its later events queue behind the
//! retried one, so publishers and other subscribers never wait on backoff.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use ordersync_core::ExpectedVersion;
use ordersync_events::{
    DeliveryFailure, DomainEvent, Event, EventFilter, EventHandler, NewEvent, SubscribeOptions,
    Subscriber, SubscriberRegistry, Subscription,
};

use crate::event_store::{EventStore, EventStoreError};

#[derive(Debug, Error)]
pub enum EventServiceError {
    #[error(transparent)]
    Store(#[from] EventStoreError),

    #[error("event payload could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outcome of a replay.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    pub replayed: usize,
    pub failed: usize,
}

#[async_trait]
pub trait EventService: Send + Sync {
    async fn publish(&self, event: NewEvent) -> Result<DomainEvent, EventServiceError>;

    /// Append and deliver several events. Events for the same entity keep
    /// their relative order.
    async fn publish_batch(&self, events: Vec<NewEvent>) -> Result<Vec<DomainEvent>, EventServiceError>;

    fn subscribe(
        &self,
        event_type: &str,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> Subscription;

    async fn get_event_history(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Vec<DomainEvent>, EventServiceError>;

    /// Feed stored events matching `filter` to `handler`, oldest first.
    async fn replay_events(
        &self,
        filter: &EventFilter,
        handler: EventHandler,
    ) -> Result<ReplayReport, EventServiceError>;

    async fn failed_deliveries(&self) -> Vec<DeliveryFailure>;

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EventServiceError>;
}

/// Typed publishing helper.
pub async fn publish_typed<E>(
    service: &dyn EventService,
    entity_id: &str,
    entity_type: &str,
    event: &E,
) -> Result<DomainEvent, EventServiceError>
where
    E: Event + Serialize,
{
    let new = NewEvent::from_typed(entity_id, entity_type, event)?;
    service.publish(new).await
}

/// Failed deliveries kept for inspection; older entries are dropped first.
pub const DEFAULT_FAILURE_CAPACITY: usize = 1_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Retry queues and the failure ledger, shared with retry workers.
#[derive(Debug)]
struct Delivery {
    registry: Arc<SubscriberRegistry>,
    retrying: Mutex<HashMap<u64, mpsc::UnboundedSender<DomainEvent>>>,
    failures: Mutex<VecDeque<DeliveryFailure>>,
    failure_capacity: usize,
}

impl Delivery {
    fn record(&self, failure: DeliveryFailure) {
        tracing::error!(
            subscription_id = failure.subscription_id,
            event_type = %failure.event_type,
            entity_id = %failure.entity_id,
            attempts = failure.attempts,
            error = %failure.error,
            "event delivery failed"
        );
        if self.failure_capacity == 0 {
            return;
        }
        let mut failures = lock(&self.failures);
        while failures.len() >= self.failure_capacity {
            failures.pop_front();
        }
        failures.push_back(failure);
    }

    /// Queue `event` behind a pending retry for `subscriber`, if there is one.
    fn enqueue(&self, subscriber: u64, event: &DomainEvent) -> bool {
        lock(&self.retrying)
            .get(&subscriber)
            .is_some_and(|queue| queue.send(event.clone()).is_ok())
    }

    fn start_retries(self: &Arc<Self>, subscriber: Arc<Subscriber>, event: DomainEvent) {
        let (queue, mut pending) = mpsc::unbounded_channel();
        lock(&self.retrying).insert(subscriber.id, queue);
        let delivery = self.clone();
        tokio::spawn(async move {
            // The first attempt already ran under the dispatch lock.
            let mut next = Some((event, 2));
            while let Some((event, first_attempt)) = next {
                if delivery.registry.contains(subscriber.id) {
                    if let Err(failure) = deliver_to(&subscriber, &event, first_attempt).await {
                        delivery.record(failure);
                    }
                }
                next = delivery.next_queued(subscriber.id, &mut pending).map(|e| (e, 1));
            }
        });
    }

    /// Next queued event, or `None` after retiring the queue. Checked under
    /// the queue lock so nothing is enqueued into a retired queue.
    fn next_queued(
        &self,
        subscriber: u64,
        pending: &mut mpsc::UnboundedReceiver<DomainEvent>,
    ) -> Option<DomainEvent> {
        let mut retrying = lock(&self.retrying);
        match pending.try_recv() {
            Ok(event) => Some(event),
            Err(_) => {
                retrying.remove(&subscriber);
                None
            }
        }
    }
}

/// In-process event service backed by any [`EventStore`].
pub struct InProcessEventService<S> {
    store: S,
    registry: Arc<SubscriberRegistry>,
    dispatch: tokio::sync::Mutex<()>,
    delivery: Arc<Delivery>,
}

impl<S> InProcessEventService<S> {
    pub fn new(store: S) -> Self {
        Self::with_failure_capacity(store, DEFAULT_FAILURE_CAPACITY)
    }

    pub fn with_failure_capacity(store: S, failure_capacity: usize) -> Self {
        let registry = SubscriberRegistry::new();
        Self {
            store,
            registry: registry.clone(),
            dispatch: tokio::sync::Mutex::new(()),
            delivery: Arc::new(Delivery {
                registry,
                retrying: Mutex::new(HashMap::new()),
                failures: Mutex::new(VecDeque::new()),
                failure_capacity,
            }),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.len()
    }

    fn deliver(&self, event: &DomainEvent) {
        for subscriber in self.registry.matching(event) {
            if self.delivery.enqueue(subscriber.id, event) {
                continue;
            }
            let Err(err) = subscriber.handle(event) else {
                continue;
            };
            tracing::debug!(subscription_id = subscriber.id, attempt = 1, error = %err, "handler failed");
            if subscriber.max_attempts() > 1 {
                self.delivery.start_retries(subscriber, event.clone());
            } else {
                self.delivery.record(failure(&subscriber, event, 1, err.to_string()));
            }
        }
    }
}

fn failure(subscriber: &Subscriber, event: &DomainEvent, attempts: u32, error: String) -> DeliveryFailure {
    DeliveryFailure {
        subscription_id: subscriber.id,
        event_id: event.event_id,
        event_type: event.event_type.clone(),
        entity_id: event.entity_id.clone(),
        attempts,
        error,
        failed_at: Utc::now(),
    }
}

async fn deliver_to(
    subscriber: &Subscriber,
    event: &DomainEvent,
    first_attempt: u32,
) -> Result<(), DeliveryFailure> {
    let max = subscriber.max_attempts();
    let mut last_error = String::new();
    for attempt in first_attempt..=max {
        let delay = subscriber.delay_before(attempt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match subscriber.handle(event) {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::debug!(subscription_id = subscriber.id, attempt, error = %err, "handler failed");
                last_error = err.to_string();
            }
        }
    }
    Err(failure(subscriber, event, max, last_error))
}

#[async_trait]
impl<S: EventStore> EventService for InProcessEventService<S> {
    async fn publish(&self, event: NewEvent) -> Result<DomainEvent, EventServiceError> {
        let _dispatch = self.dispatch.lock().await;
        let event = self
            .store
            .append(vec![event], ExpectedVersion::Any)?
            .into_iter()
            .next()
            .ok_or_else(|| EventStoreError::Backend("append returned no events".into()))?;
        tracing::debug!(event_type = %event.event_type, entity_id = %event.entity_id, sequence = event.sequence_number, "event published");
        self.deliver(&event);
        Ok(event)
    }

    async fn publish_batch(&self, events: Vec<NewEvent>) -> Result<Vec<DomainEvent>, EventServiceError> {
        let _dispatch = self.dispatch.lock().await;

        // One atomic append per stream, streams in order of first appearance.
        let mut order: Vec<(String, String)> = Vec::new();
        let mut streams: BTreeMap<(String, String), Vec<NewEvent>> = BTreeMap::new();
        for e in events {
            let key = (e.entity_type.clone(), e.entity_id.clone());
            if !streams.contains_key(&key) {
                order.push(key.clone());
            }
            streams.entry(key).or_default().push(e);
        }

        let mut committed = Vec::new();
        for key in order {
            if let Some(batch) = streams.remove(&key) {
                committed.extend(self.store.append(batch, ExpectedVersion::Any)?);
            }
        }
        for event in &committed {
            self.deliver(event);
        }
        Ok(committed)
    }

    fn subscribe(
        &self,
        event_type: &str,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> Subscription {
        self.registry.register(event_type, handler, options)
    }

    async fn get_event_history(
        &self,
        entity_id: &str,
        entity_type: &str,
    ) -> Result<Vec<DomainEvent>, EventServiceError> {
        Ok(self.store.load_stream(entity_type, entity_id)?)
    }

    async fn replay_events(
        &self,
        filter: &EventFilter,
        handler: EventHandler,
    ) -> Result<ReplayReport, EventServiceError> {
        let events = self.store.query(filter)?;
        let mut report = ReplayReport::default();
        for event in &events {
            match handler(event) {
                Ok(()) => report.replayed += 1,
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(event_id = %event.event_id, error = %err, "replay handler failed");
                }
            }
        }
        Ok(report)
    }

    async fn failed_deliveries(&self) -> Vec<DeliveryFailure> {
        lock(&self.delivery.failures).iter().cloned().collect()
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, EventServiceError> {
        Ok(self.store.delete_older_than(cutoff)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_store::InMemoryEventStore;
    use ordersync_events::{ALL_EVENTS, HandlerError, PURCHASE_ORDER, SyncEvent};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn service() -> InProcessEventService<InMemoryEventStore> {
        InProcessEventService::new(InMemoryEventStore::new())
    }

    fn imported(entity: &str, remote: i64) -> NewEvent {
        NewEvent::from_typed(
            entity,
            PURCHASE_ORDER,
            &SyncEvent::OrderImported {
                remote_id: ordersync_core::RemoteId::new(remote).unwrap(),
                occurred_at: Utc::now(),
            },
        )
        .unwrap()
    }

    fn recorder(seen: Arc<Mutex<Vec<String>>>) -> EventHandler {
        Arc::new(move |e: &DomainEvent| {
            seen.lock().unwrap().push(format!("{}#{}", e.entity_id, e.sequence_number));
            Ok(())
        })
    }

    #[tokio::test]
    async fn subscribers_see_events_in_publish_order() {
        let svc = service();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = svc.subscribe(ALL_EVENTS, recorder(seen.clone()), SubscribeOptions::default());

        svc.publish(imported("a", 1)).await.unwrap();
        svc.publish_batch(vec![imported("b", 2), imported("a", 3), imported("b", 4)])
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a#1", "b#1", "b#2", "a#2"]);
    }

    #[tokio::test]
    async fn filters_and_unsubscribe() {
        let svc = service();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = svc.subscribe(
            SyncEvent::ORDER_IMPORTED,
            recorder(seen.clone()),
            SubscribeOptions::default().with_filter(EventFilter::for_entity("a", PURCHASE_ORDER)),
        );

        svc.publish(imported("b", 1)).await.unwrap();
        svc.publish(imported("a", 2)).await.unwrap();
        assert!(sub.unsubscribe());
        svc.publish(imported("a", 3)).await.unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["a#1"]);
        assert_eq!(svc.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_records_failure_without_blocking_others() {
        let svc = service();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let _failing = svc.subscribe(
            ALL_EVENTS,
            Arc::new(move |_e: &DomainEvent| {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::new("boom"))
            }),
            SubscribeOptions::default().with_retry(2, Duration::from_millis(10)),
        );
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _ok = svc.subscribe(ALL_EVENTS, recorder(seen.clone()), SubscribeOptions::default());

        svc.publish(imported("a", 1)).await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        let failures = svc.failed_deliveries().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].attempts, 3);
    }

    #[tokio::test]
    async fn publishing_does_not_wait_for_retry_backoff() {
        let svc = service();
        let _failing = svc.subscribe(
            ALL_EVENTS,
            Arc::new(|_e: &DomainEvent| Err(HandlerError::new("down"))),
            SubscribeOptions::default().with_retry(5, Duration::from_secs(10)),
        );

        let published = tokio::time::timeout(Duration::from_secs(2), async {
            svc.publish(imported("a", 1)).await.unwrap();
            svc.publish(imported("b", 2)).await.unwrap();
        })
        .await;

        assert!(published.is_ok(), "publish waited on a subscriber's backoff");
    }

    #[tokio::test(start_paused = true)]
    async fn retried_subscriber_still_sees_events_in_order() {
        let svc = service();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let failed_once = Arc::new(AtomicU32::new(0));
        let log = seen.clone();
        let _flaky = svc.subscribe(
            ALL_EVENTS,
            Arc::new(move |e: &DomainEvent| {
                if failed_once.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(HandlerError::new("cold start"));
                }
                log.lock().unwrap().push(e.entity_id.clone());
                Ok(())
            }),
            SubscribeOptions::default().with_retry(3, Duration::from_millis(50)),
        );

        svc.publish(imported("a", 1)).await.unwrap();
        svc.publish(imported("b", 2)).await.unwrap();
        svc.publish(imported("c", 3)).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert!(svc.failed_deliveries().await.is_empty());

        svc.publish(imported("d", 4)).await.unwrap();
        assert_eq!(seen.lock().unwrap().last().map(String::as_str), Some("d"));
    }

    #[tokio::test]
    async fn failure_ledger_keeps_only_the_newest_entries() {
        let svc = InProcessEventService::with_failure_capacity(InMemoryEventStore::new(), 2);
        let _failing = svc.subscribe(
            ALL_EVENTS,
            Arc::new(|_e: &DomainEvent| Err(HandlerError::new("down"))),
            SubscribeOptions::default(),
        );

        for (n, entity) in ["a", "b", "c"].into_iter().enumerate() {
            svc.publish(imported(entity, n as i64 + 1)).await.unwrap();
        }

        let failures = svc.failed_deliveries().await;
        let entities: Vec<_> = failures.iter().map(|f| f.entity_id.as_str()).collect();
        assert_eq!(entities, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn history_and_replay() {
        let svc = service();
        svc.publish(imported("a", 1)).await.unwrap();
        svc.publish(imported("b", 2)).await.unwrap();
        svc.publish(imported("a", 3)).await.unwrap();

        let history = svc.get_event_history("a", PURCHASE_ORDER).await.unwrap();
        assert_eq!(history.iter().map(|e| e.sequence_number).collect::<Vec<_>>(), vec![1, 2]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let report = svc
            .replay_events(&EventFilter::for_entity("a", PURCHASE_ORDER), recorder(seen.clone()))
            .await
            .unwrap();
        assert_eq!(report, ReplayReport { replayed: 2, failed: 0 });
        let decoded: SyncEvent = history[0].decode().unwrap();
        assert!(matches!(decoded, SyncEvent::OrderImported { .. }));
    }
}
