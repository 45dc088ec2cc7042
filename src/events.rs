//! Priority-ordered asynchronous event bus.
//!
//! A single consumer loop ([`EventBus::run`]) drains a stable priority queue and
//! delivers each event to the handlers subscribed to its exact name, one
//! handler at a time, in subscription order. Handler failures and panics are
//! logged and never stop the loop.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{watch, Notify};

use crate::error::{Error, Result};

/// Event scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    /// Background work.
    Low = 0,
    /// Default priority.
    Normal = 1,
    /// Latency-sensitive.
    High = 2,
    /// Delivered before everything else that is still queued.
    Critical = 3,
}

impl Default for EventPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// An immutable published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Dot-namespaced name, e.g. `plugin.enabled`.
    pub name: String,
    /// Ordered payload.
    pub data: Map<String, Value>,
    /// Publish time.
    pub timestamp: DateTime<Utc>,
    /// Origin identifier.
    pub source: Option<String>,
    /// Scheduling priority.
    pub priority: EventPriority,
    /// Identifier shared by causally related events.
    pub correlation_id: Option<String>,
}

impl Event {
    /// Create an event at normal priority.
    pub fn new(name: impl Into<String>, data: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            data,
            timestamp: Utc::now(),
            source: None,
            priority: EventPriority::Normal,
            correlation_id: None,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the origin.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Attach a freshly generated correlation id.
    pub fn correlated(self) -> Self {
        let id = uuid::Uuid::new_v4().to_string();
        self.with_correlation_id(id)
    }

    /// Get a payload value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Get a payload string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

/// Receives events for the names it is subscribed to.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    async fn handle(&self, event: &Event) -> Result<()>;
}

struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for AsyncFnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self.0)(event.clone()).await
    }
}

struct SyncFnHandler<F>(F);

#[async_trait]
impl<F> EventHandler for SyncFnHandler<F>
where
    F: Fn(&Event) -> Result<()> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> Result<()> {
        (self.0)(event)
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn EventHandler>,
}

/// Configuration for the event bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// How long `shutdown` waits for queued events to drain.
    pub drain_timeout: Duration,
    /// Upper bound on a single handler invocation.
    pub handler_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
            handler_timeout: Duration::from_secs(30),
        }
    }
}

impl BusConfig {
    /// Create a new bus configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the drain timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the per-handler timeout.
    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }
}

/// Bus activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Events accepted by `publish`.
    pub published: u64,
    /// Successful handler invocations.
    pub delivered: u64,
    /// Handler invocations that failed, panicked, or timed out.
    pub handler_failures: u64,
    /// Events rejected after shutdown.
    pub rejected: u64,
    /// Events still queued when the drain deadline passed.
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    handler_failures: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

/// Queue entry ordered by priority, then by insertion sequence.
struct Queued {
    seq: u64,
    event: Event,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap: higher priority first, then lower seq first.
        self.event
            .priority
            .cmp(&other.event.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct BusInner {
    config: BusConfig,
    queue: Mutex<BinaryHeap<Queued>>,
    next_seq: AtomicU64,
    subscribers: RwLock<HashMap<String, Vec<Subscription>>>,
    next_subscription: AtomicU64,
    wakeup: Notify,
    closed: AtomicBool,
    running: AtomicBool,
    stopped: watch::Sender<bool>,
    counters: Counters,
}

/// Asynchronous publish/subscribe bus. Cloning shares the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a new bus.
    pub fn new(config: BusConfig) -> Self {
        let (stopped, _) = watch::channel(false);
        Self {
            inner: Arc::new(BusInner {
                config,
                queue: Mutex::new(BinaryHeap::new()),
                next_seq: AtomicU64::new(0),
                subscribers: RwLock::new(HashMap::new()),
                next_subscription: AtomicU64::new(1),
                wakeup: Notify::new(),
                closed: AtomicBool::new(false),
                running: AtomicBool::new(false),
                stopped,
                counters: Counters::default(),
            }),
        }
    }

    /// Create with default configuration.
    pub fn default_config() -> Self {
        Self::new(BusConfig::default())
    }

    /// Subscribe a handler to an exact event name.
    pub fn subscribe(&self, event_name: impl Into<String>, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let event_name = event_name.into();

        tracing::debug!(event = %event_name, subscription = id.0, "subscribed");
        self.inner
            .subscribers
            .write()
            .entry(event_name)
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    /// Subscribe an async closure.
    pub fn subscribe_async<F, Fut>(&self, event_name: impl Into<String>, f: F) -> SubscriptionId
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(event_name, Arc::new(AsyncFnHandler(f)))
    }

    /// Subscribe a synchronous closure.
    pub fn subscribe_fn<F>(&self, event_name: impl Into<String>, f: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.subscribe(event_name, Arc::new(SyncFnHandler(f)))
    }

    /// Remove a subscription. Returns true if it existed.
    pub fn unsubscribe(&self, event_name: &str, id: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let Some(subs) = subscribers.get_mut(event_name) else {
            return false;
        };

        let before = subs.len();
        subs.retain(|s| s.id != id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            subscribers.remove(event_name);
        }
        removed
    }

    /// Number of handlers subscribed to a name.
    pub fn subscriber_count(&self, event_name: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Enqueue an event built from name, data and priority.
    ///
    /// Returns once the event is queued; handlers run on the consumer loop.
    pub fn publish(
        &self,
        event_name: impl Into<String>,
        data: Map<String, Value>,
        priority: EventPriority,
    ) -> Result<()> {
        self.publish_event(Event::new(event_name, data).with_priority(priority))
    }

    /// Enqueue a fully built event.
    pub fn publish_event(&self, event: Event) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(event = %event.name, "event published after shutdown was rejected");
            return Err(Error::EventBusClosed(event.name));
        }

        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        self.inner.queue.lock().push(Queued { seq, event });
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        self.inner.wakeup.notify_one();
        Ok(())
    }

    /// Number of events waiting to be delivered.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Check whether the bus has been shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Check whether the consumer loop is running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Snapshot of the activity counters.
    pub fn stats(&self) -> BusStats {
        let c = &self.inner.counters;
        BusStats {
            published: c.published.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            handler_failures: c.handler_failures.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }

    /// Consume events until [`shutdown`](Self::shutdown) is called and the queue is drained.
    pub async fn run(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(Error::EventBusRunning);
        }

        tracing::debug!("event bus loop started");
        loop {
            let next = self.inner.queue.lock().pop();
            match next {
                Some(queued) => self.dispatch(&queued.event).await,
                None if self.is_closed() => break,
                None => self.inner.wakeup.notified().await,
            }
        }

        self.inner.running.store(false, Ordering::Release);
        self.inner.stopped.send_replace(true);
        tracing::debug!("event bus loop stopped");
        Ok(())
    }

    /// Process every queued event on the calling task, without waiting for new ones.
    ///
    /// Returns the number of events dispatched.
    pub async fn run_until_idle(&self) -> usize {
        let mut count = 0;
        loop {
            let next = self.inner.queue.lock().pop();
            match next {
                Some(queued) => {
                    self.dispatch(&queued.event).await;
                    count += 1;
                }
                None => return count,
            }
        }
    }

    /// Stop accepting events and wait up to the drain timeout for queued events.
    ///
    /// If no consumer loop is running the queue is drained on the calling task.
    /// Events still queued when the deadline passes are dropped and counted.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.wakeup.notify_one();

        let drain_timeout = self.inner.config.drain_timeout;
        let drained = if self.is_running() {
            let mut stopped = self.inner.stopped.subscribe();
            let finished = async move {
                let _ = stopped.wait_for(|done| *done).await;
            };
            tokio::time::timeout(drain_timeout, finished).await.is_ok()
        } else {
            tokio::time::timeout(drain_timeout, self.run_until_idle())
                .await
                .is_ok()
        };

        if !drained {
            tracing::warn!(
                timeout_ms = drain_timeout.as_millis() as u64,
                "event bus did not drain before the deadline"
            );
        }

        let leftover = std::mem::take(&mut *self.inner.queue.lock()).len() as u64;
        if leftover > 0 {
            self.inner.counters.dropped.fetch_add(leftover, Ordering::Relaxed);
            tracing::warn!(dropped = leftover, "dropped undelivered events at shutdown");
        }
        tracing::info!("event bus shut down");
    }

    async fn dispatch(&self, event: &Event) {
        let handlers: Vec<(SubscriptionId, Arc<dyn EventHandler>)> = self
            .inner
            .subscribers
            .read()
            .get(&event.name)
            .map(|subs| subs.iter().map(|s| (s.id, s.handler.clone())).collect())
            .unwrap_or_default();

        if handlers.is_empty() {
            tracing::trace!(event = %event.name, "no subscribers");
            return;
        }

        let counters = &self.inner.counters;
        for (id, handler) in handlers {
            let call = AssertUnwindSafe(handler.handle(event)).catch_unwind();
            match tokio::time::timeout(self.inner.config.handler_timeout, call).await {
                Ok(Ok(Ok(()))) => {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Ok(Err(e))) => {
                    counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(event = %event.name, subscription = id.0, error = %e, "event handler failed");
                }
                Ok(Err(_)) => {
                    counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(event = %event.name, subscription = id.0, "event handler panicked");
                }
                Err(_) => {
                    counters.handler_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(event = %event.name, subscription = id.0, "event handler timed out");
                }
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.inner.config)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Build an event payload from key/value pairs.
pub fn event_data<I, K>(pairs: I) -> Map<String, Value>
where
    I: IntoIterator<Item = (K, Value)>,
    K: Into<String>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Arc<dyn EventHandler>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |tag: &str| -> Arc<dyn EventHandler> {
                let log = log.clone();
                let tag = tag.to_string();
                Arc::new(SyncFnHandler(move |e: &Event| -> Result<()> {
                    log.lock().push(format!("{}:{}", tag, e.name));
                    Ok(())
                }))
            }
        };
        (log, make)
    }

    #[test]
    fn test_priority_ordering() {
        assert!(EventPriority::Critical > EventPriority::High);
        assert!(EventPriority::Low < EventPriority::Normal);
        assert_eq!(EventPriority::default(), EventPriority::Normal);
    }

    #[tokio::test]
    async fn test_handlers_run_in_subscription_order() {
        let bus = EventBus::default_config();
        let (log, make) = recorder();
        bus.subscribe("x", make("first"));
        bus.subscribe("x", make("second"));

        bus.publish("x", Map::new(), EventPriority::Normal).unwrap();
        assert_eq!(bus.run_until_idle().await, 1);

        assert_eq!(*log.lock(), vec!["first:x", "second:x"]);
        assert_eq!(bus.stats().delivered, 2);
    }

    #[tokio::test]
    async fn test_failing_handler_is_isolated() {
        let bus = EventBus::default_config();
        let (log, make) = recorder();
        bus.subscribe_fn("x", |_| Err(Error::Handler("boom".into())));
        bus.subscribe_fn("x", |_| panic!("handler panic"));
        bus.subscribe("x", make("survivor"));

        bus.publish("x", Map::new(), EventPriority::Normal).unwrap();
        bus.run_until_idle().await;

        assert_eq!(*log.lock(), vec!["survivor:x"]);
        let stats = bus.stats();
        assert_eq!(stats.handler_failures, 2);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn test_critical_jumps_queue() {
        let bus = EventBus::default_config();
        let (log, make) = recorder();
        bus.subscribe("x", make("h"));
        bus.subscribe("y", make("h"));
        bus.subscribe("z", make("h"));

        bus.publish("y", Map::new(), EventPriority::Low).unwrap();
        bus.publish("z", Map::new(), EventPriority::Low).unwrap();
        bus.publish("x", Map::new(), EventPriority::Critical).unwrap();
        bus.run_until_idle().await;

        assert_eq!(*log.lock(), vec!["h:x", "h:y", "h:z"]);
    }

    #[tokio::test]
    async fn test_unsubscribe() {
        let bus = EventBus::default_config();
        let (log, make) = recorder();
        let id = bus.subscribe("x", make("gone"));
        bus.subscribe("x", make("kept"));

        assert!(bus.unsubscribe("x", id));
        assert!(!bus.unsubscribe("x", id));
        assert_eq!(bus.subscriber_count("x"), 1);

        bus.publish("x", Map::new(), EventPriority::Normal).unwrap();
        bus.run_until_idle().await;
        assert_eq!(*log.lock(), vec!["kept:x"]);
    }

    #[tokio::test]
    async fn test_async_handler_awaited_before_next() {
        let bus = EventBus::default_config();
        let log = Arc::new(Mutex::new(Vec::new()));

        let slow_log = log.clone();
        bus.subscribe_async("x", move |_e| {
            let log = slow_log.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                log.lock().push("slow");
                Ok(())
            }
        });
        let fast_log = log.clone();
        bus.subscribe_fn("x", move |_| {
            fast_log.lock().push("fast");
            Ok(())
        });

        bus.publish("x", Map::new(), EventPriority::Normal).unwrap();
        bus.run_until_idle().await;
        assert_eq!(*log.lock(), vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn test_run_loop_and_shutdown() {
        let bus = EventBus::default_config();
        let (log, make) = recorder();
        bus.subscribe("tick", make("h"));

        let runner = bus.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        for _ in 0..3 {
            bus.publish_event(Event::new("tick", event_data([("n", json!(1))])).with_source("test"))
                .unwrap();
        }

        bus.shutdown().await;
        handle.await.unwrap().unwrap();

        assert_eq!(log.lock().len(), 3);
        assert!(!bus.is_running());

        let rejected = bus.publish("tick", Map::new(), EventPriority::High);
        assert!(matches!(rejected, Err(Error::EventBusClosed(_))));
        assert_eq!(bus.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_second_run_is_rejected() {
        let bus = EventBus::default_config();
        let runner = bus.clone();
        let handle = tokio::spawn(async move { runner.run().await });

        while !bus.is_running() {
            tokio::task::yield_now().await;
        }
        assert!(matches!(bus.run().await, Err(Error::EventBusRunning)));

        bus.shutdown().await;
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drops_events_past_deadline() {
        use std::sync::atomic::AtomicUsize;

        let bus = EventBus::new(BusConfig::new().with_drain_timeout(Duration::from_millis(50)));
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        bus.subscribe_async("tick", move |_| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let runner = bus.clone();
        let handle = tokio::spawn(async move { runner.run().await });
        while !bus.is_running() {
            tokio::task::yield_now().await;
        }

        for _ in 0..5 {
            bus.publish("tick", Map::new(), EventPriority::Normal).unwrap();
        }
        while bus.pending() != 4 {
            tokio::task::yield_now().await;
        }

        bus.shutdown().await;
        assert_eq!(handled.load(Ordering::SeqCst), 0);
        assert_eq!(bus.stats().dropped, 4);
        assert_eq!(bus.pending(), 0);

        handle.await.unwrap().unwrap();
        assert_eq!(handled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_event_builders() {
        let event = Event::new("entity.deleted", event_data([("id", json!("42"))]))
            .with_source("tasks")
            .correlated();

        assert_eq!(event.get_str("id"), Some("42"));
        assert_eq!(event.source.as_deref(), Some("tasks"));
        assert!(event.correlation_id.is_some());
    }
}
