//! Topic/type publish-subscribe event bus
//!
//! Synchronous listeners run on the publishing task in priority order
//! (highest first) and may cancel a cancellable envelope to stop the rest of
//! the synchronous chain. Asynchronous listeners are fed through a bounded
//! queue drained by a fixed pool of worker tasks; `publish` never waits for
//! them. Each async listener call runs on the blocking pool, so a listener
//! that blocks holds up its worker but not the runtime.
//!
//! A failing or panicking listener is logged on the error channel
//! (`warden::events` target) and delivery continues with the next listener.

use std::collections::HashSet;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, Mutex};
use warden_api::EventEnvelope;

/// Opaque handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// How a listener is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// On the publishing task, in priority order
    #[default]
    Sync,
    /// On the worker pool
    Async,
}

/// Topic and type filter. Empty sets match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    pub topics: HashSet<String>,
    pub types: HashSet<String>,
}

impl EventFilter {
    /// Match every event
    pub fn all() -> Self {
        Self::default()
    }

    /// Match a single topic
    pub fn topic(topic: impl Into<String>) -> Self {
        Self::default().with_topic(topic)
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.insert(topic.into());
        self
    }

    pub fn with_type(mut self, event_type: impl Into<String>) -> Self {
        self.types.insert(event_type.into());
        self
    }

    pub fn matches(&self, event: &EventEnvelope) -> bool {
        (self.topics.is_empty() || self.topics.contains(&event.topic))
            && (self.types.is_empty() || self.types.contains(&event.event_type))
    }
}

/// Receiver of events
///
/// Closures of the form `Fn(&mut EventEnvelope) -> anyhow::Result<()>`
/// implement this trait.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &mut EventEnvelope) -> anyhow::Result<()>;
}

impl<F> EventListener for F
where
    F: Fn(&mut EventEnvelope) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &mut EventEnvelope) -> anyhow::Result<()> {
        self(event)
    }
}

/// Public description of a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub filter: EventFilter,
    /// Higher runs first among synchronous listeners
    pub priority: i32,
    pub mode: DeliveryMode,
}

/// Configuration for the bus worker pool
#[derive(Debug, Clone)]
pub struct EventBusConfig {
    /// Number of async delivery workers
    pub workers: usize,
    /// Pending async deliveries before new ones are dropped
    pub queue_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
        }
    }
}

/// Result of one `publish` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublishOutcome {
    /// Synchronous listeners invoked
    pub delivered: usize,
    /// Async deliveries queued
    pub queued: usize,
    /// Async deliveries dropped because the queue was full
    pub dropped: usize,
    /// A synchronous listener cancelled the event
    pub cancelled: bool,
}

/// Counters since the bus was created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusStats {
    pub published: u64,
    pub delivered: u64,
    pub listener_failures: u64,
    pub dropped: u64,
}

struct Entry {
    info: Subscription,
    listener: Arc<dyn EventListener>,
}

struct AsyncDelivery {
    subscription: SubscriptionId,
    listener: Arc<dyn EventListener>,
    event: EventEnvelope,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    listener_failures: AtomicU64,
    dropped: AtomicU64,
}

struct BusInner {
    /// Kept sorted by descending priority, then subscription order
    entries: RwLock<Vec<Entry>>,
    next_id: AtomicU64,
    async_tx: mpsc::Sender<AsyncDelivery>,
    counters: Arc<Counters>,
}

/// A thread-safe event bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a bus with the default worker pool.
    ///
    /// Must be called inside a tokio runtime; the async workers are spawned
    /// immediately and exit once the last clone of the bus is dropped.
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// Create a bus with a custom worker pool
    pub fn with_config(config: EventBusConfig) -> Self {
        let (async_tx, async_rx) = mpsc::channel::<AsyncDelivery>(config.queue_capacity.max(1));
        let async_rx = Arc::new(Mutex::new(async_rx));
        let counters = Arc::new(Counters::default());

        for worker in 0..config.workers.max(1) {
            let rx = async_rx.clone();
            let counters = counters.clone();
            tokio::spawn(async move {
                loop {
                    let next = { rx.lock().await.recv().await };
                    let Some(mut delivery) = next else {
                        tracing::debug!(worker, "Event worker shutting down");
                        break;
                    };
                    let counters = counters.clone();
                    let call = tokio::task::spawn_blocking(move || {
                        invoke(
                            delivery.subscription,
                            delivery.listener.as_ref(),
                            &mut delivery.event,
                            &counters,
                        )
                    });
                    if let Err(e) = call.await {
                        tracing::error!(target: "warden::events", worker, error = %e, "Async listener task failed");
                    }
                }
            });
        }

        Self {
            inner: Arc::new(BusInner {
                entries: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                async_tx,
                counters,
            }),
        }
    }

    /// Register a listener
    pub fn subscribe(
        &self,
        filter: EventFilter,
        listener: impl EventListener + 'static,
        priority: i32,
        mode: DeliveryMode,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            info: Subscription {
                id,
                filter,
                priority,
                mode,
            },
            listener: Arc::new(listener),
        };

        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // Insert after every entry of equal or higher priority to keep
        // registration order among equals.
        let pos = entries.partition_point(|e| e.info.priority >= priority);
        entries.insert(pos, entry);

        tracing::debug!(subscription = %id, priority, ?mode, "Listener subscribed");
        id
    }

    /// Register a synchronous closure listener
    pub fn subscribe_sync<F>(&self, filter: EventFilter, priority: i32, listener: F) -> SubscriptionId
    where
        F: Fn(&mut EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(filter, listener, priority, DeliveryMode::Sync)
    }

    /// Register an asynchronous closure listener
    pub fn subscribe_async<F>(&self, filter: EventFilter, listener: F) -> SubscriptionId
    where
        F: Fn(&mut EventEnvelope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(filter, listener, 0, DeliveryMode::Async)
    }

    /// Remove a listener
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| e.info.id != id);
        before != entries.len()
    }

    /// Remove every listener matching the predicate
    pub fn unsubscribe_all(&self, predicate: impl Fn(&Subscription) -> bool) -> usize {
        let mut entries = self
            .inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|e| !predicate(&e.info));
        before - entries.len()
    }

    /// Current subscriptions in delivery order
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|e| e.info.clone())
            .collect()
    }

    /// Deliver an event
    pub fn publish(&self, mut event: EventEnvelope) -> PublishOutcome {
        let counters = &self.inner.counters;
        counters.published.fetch_add(1, Ordering::Relaxed);

        // Snapshot matching listeners so callbacks may (un)subscribe freely.
        let (sync, asynchronous): (Vec<_>, Vec<_>) = {
            let entries = self
                .inner
                .entries
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .filter(|e| e.info.filter.matches(&event))
                .map(|e| (e.info.id, e.info.mode, e.listener.clone()))
                .partition(|(_, mode, _)| *mode == DeliveryMode::Sync)
        };

        let mut outcome = PublishOutcome::default();

        for (id, _, listener) in sync {
            if event.is_cancelled() {
                break;
            }
            invoke(id, listener.as_ref(), &mut event, counters);
            outcome.delivered += 1;
        }
        outcome.cancelled = event.is_cancelled();

        for (id, _, listener) in asynchronous {
            let delivery = AsyncDelivery {
                subscription: id,
                listener,
                event: event.clone(),
            };
            match self.inner.async_tx.try_send(delivery) {
                Ok(()) => outcome.queued += 1,
                Err(e) => {
                    outcome.dropped += 1;
                    counters.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        subscription = %id,
                        topic = %event.topic,
                        event_type = %event.event_type,
                        error = %e,
                        "Async event delivery dropped"
                    );
                }
            }
        }

        outcome
    }

    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            listener_failures: c.listener_failures.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for EventBus {
    /// Creates a bus with the default worker pool.
    ///
    /// # Panics
    /// Panics when called outside a tokio runtime.
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriptions", &self.subscriptions().len())
            .field("stats", &self.stats())
            .finish()
    }
}

fn invoke(
    id: SubscriptionId,
    listener: &dyn EventListener,
    event: &mut EventEnvelope,
    counters: &Counters,
) {
    match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        Ok(Ok(())) => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            counters.listener_failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                target: "warden::events",
                subscription = %id,
                topic = %event.topic,
                event_type = %event.event_type,
                error = %e,
                "Event listener failed"
            );
        }
        Err(panic) => {
            counters.listener_failures.fetch_add(1, Ordering::Relaxed);
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(
                target: "warden::events",
                subscription = %id,
                topic = %event.topic,
                event_type = %event.event_type,
                panic = %message,
                "Event listener panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use warden_api::{kinds, topics};

    fn event(topic: &str, kind: &str) -> EventEnvelope {
        EventEnvelope::new(topic, kind, "test")
    }

    #[tokio::test]
    async fn test_sync_priority_order() {
        let bus = EventBus::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        for priority in [5, 50, -3, 20] {
            let seen = seen.clone();
            bus.subscribe_sync(EventFilter::all(), priority, move |_: &mut EventEnvelope| {
                seen.lock().unwrap().push(priority);
                Ok(())
            });
        }

        let outcome = bus.publish(event(topics::PLUGIN, kinds::STARTED));
        assert_eq!(outcome.delivered, 4);
        assert_eq!(*seen.lock().unwrap(), vec![50, 20, 5, -3]);
    }

    #[tokio::test]
    async fn test_equal_priority_keeps_subscription_order() {
        let bus = EventBus::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));

        for name in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.subscribe_sync(EventFilter::all(), 1, move |_: &mut EventEnvelope| {
                seen.lock().unwrap().push(name);
                Ok(())
            });
        }

        bus.publish(event(topics::PLUGIN, kinds::STARTED));
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_filter_by_topic_and_type() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicU64::new(0));

        let c = count.clone();
        bus.subscribe_sync(
            EventFilter::topic(topics::HEALTH).with_type(kinds::HEALTH_CHECK),
            0,
            move |_: &mut EventEnvelope| {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );

        bus.publish(event(topics::HEALTH, kinds::HEALTH_CHECK));
        bus.publish(event(topics::HEALTH, kinds::ISOLATED));
        bus.publish(event(topics::PLUGIN, kinds::HEALTH_CHECK));

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_sync_chain_only() {
        let bus = EventBus::new();
        let sync_seen = Arc::new(AtomicU64::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel::<bool>();

        bus.subscribe_sync(EventFilter::all(), 10, |e: &mut EventEnvelope| {
            e.cancel();
            Ok(())
        });
        let s = sync_seen.clone();
        bus.subscribe_sync(EventFilter::all(), 1, move |_: &mut EventEnvelope| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.subscribe_async(EventFilter::all(), move |e: &mut EventEnvelope| {
            let _ = tx.send(e.is_cancelled());
            Ok(())
        });

        let outcome = bus.publish(event(topics::PLUGIN, kinds::STOPPED).cancellable());
        assert!(outcome.cancelled);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(sync_seen.load(Ordering::SeqCst), 0);

        let observed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(observed, Some(true));
    }

    #[tokio::test]
    async fn test_non_cancellable_event_reaches_everyone() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU64::new(0));

        bus.subscribe_sync(EventFilter::all(), 10, |e: &mut EventEnvelope| {
            e.cancel();
            Ok(())
        });
        let s = seen.clone();
        bus.subscribe_sync(EventFilter::all(), 1, move |_: &mut EventEnvelope| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let outcome = bus.publish(event(topics::PLUGIN, kinds::STOPPED));
        assert!(!outcome.cancelled);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_listeners_do_not_stop_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(AtomicU64::new(0));

        bus.subscribe_sync(EventFilter::all(), 3, |_: &mut EventEnvelope| {
            Err(anyhow::anyhow!("listener error"))
        });
        bus.subscribe_sync(EventFilter::all(), 2, |_: &mut EventEnvelope| -> anyhow::Result<()> {
            panic!("listener panic")
        });
        let s = seen.clone();
        bus.subscribe_sync(EventFilter::all(), 1, move |_: &mut EventEnvelope| {
            s.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let outcome = bus.publish(event(topics::PLUGIN, kinds::STARTED));
        assert_eq!(outcome.delivered, 3);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().listener_failures, 2);
    }

    #[tokio::test]
    async fn test_async_listener_does_not_block_publish() {
        let bus = EventBus::with_config(EventBusConfig {
            workers: 1,
            queue_capacity: 8,
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        bus.subscribe_async(EventFilter::all(), move |_: &mut EventEnvelope| {
            std::thread::sleep(Duration::from_millis(200));
            let _ = tx.send(());
            Ok(())
        });

        let started = std::time::Instant::now();
        let outcome = bus.publish(event(topics::PLUGIN, kinds::STARTED));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(outcome.queued, 1);

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_blocking_async_listener_leaves_runtime_free() {
        let bus = EventBus::with_config(EventBusConfig {
            workers: 1,
            queue_capacity: 8,
        });
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        bus.subscribe_async(EventFilter::all(), move |_: &mut EventEnvelope| {
            std::thread::sleep(Duration::from_millis(400));
            let _ = tx.send(());
            Ok(())
        });

        let started = std::time::Instant::now();
        bus.publish(event(topics::PLUGIN, kinds::STARTED));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(started.elapsed() < Duration::from_millis(200));

        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let bus = EventBus::with_config(EventBusConfig {
            workers: 1,
            queue_capacity: 1,
        });
        bus.subscribe_async(EventFilter::all(), |_| Ok(()));

        // The single-threaded test runtime does not run the worker until we
        // yield, so everything past the first delivery overflows.
        let mut dropped = 0;
        for _ in 0..10 {
            dropped += bus.publish(event(topics::PLUGIN, kinds::STARTED)).dropped;
        }
        assert_eq!(dropped, 9);
        assert_eq!(bus.stats().dropped, 9);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe_sync(EventFilter::all(), 0, |_: &mut EventEnvelope| Ok(()));
        bus.subscribe_sync(EventFilter::topic(topics::HEALTH), 0, |_: &mut EventEnvelope| {
            Ok(())
        });
        bus.subscribe_async(EventFilter::topic(topics::HEALTH), |_: &mut EventEnvelope| {
            Ok(())
        });

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        let removed = bus.unsubscribe_all(|s| s.filter.topics.contains(topics::HEALTH));
        assert_eq!(removed, 2);
        assert!(bus.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_publish_order_matches_call_order() {
        let bus = EventBus::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe_sync(EventFilter::all(), 0, move |e: &mut EventEnvelope| {
            s.lock().unwrap().push(e.event_type.clone());
            Ok(())
        });

        for kind in [kinds::LOADED, kinds::INITIALIZED, kinds::STARTED] {
            bus.publish(event(topics::PLUGIN, kind));
        }
        assert_eq!(
            *seen.lock().unwrap(),
            vec![kinds::LOADED, kinds::INITIALIZED, kinds::STARTED]
        );
    }
}
