// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
// Event Bus Implementation - In-process Pub/Sub for Fleet Events
//
// Topic-based publish/subscribe between agents on one node. Delivery is
// synchronous: `publish` invokes every matching handler in subscription
// order before returning, unless another thread is already delivering on
// the same topic lane, in which case that thread delivers it next.
//
// Events are never persisted and never replayed. Subscribers that need an
// async stream use `subscribe_channel`.

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::domain::events::{DomainEvent, Event};
use crate::domain::pattern::TopicPattern;

/// Topics hash onto a fixed number of delivery lanes; each lane delivers
/// one event at a time.
const TOPIC_LANES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler = Box<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

struct Subscriber {
    pattern: TopicPattern,
    handler: Handler,
    active: AtomicBool,
}

#[derive(Default)]
struct TopicLane {
    queue: VecDeque<Event>,
    draining: bool,
}

struct BusInner {
    subscribers: RwLock<BTreeMap<SubscriptionId, Arc<Subscriber>>>,
    next_id: AtomicU64,
    lanes: Vec<Mutex<TopicLane>>,
}

/// Event bus for publishing and subscribing to fleet events
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(BTreeMap::new()),
                next_id: AtomicU64::new(1),
                lanes: (0..TOPIC_LANES).map(|_| Mutex::new(TopicLane::default())).collect(),
            }),
        }
    }

    /// Register `handler` for every topic matching `pattern` (exact or glob).
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> Result<SubscriptionId, EventBusError>
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let pattern =
            TopicPattern::parse(pattern).map_err(|e| EventBusError::InvalidPattern(e.to_string()))?;
        Ok(self.inner.register(pattern, Box::new(handler)))
    }

    /// Bridge matching events into a bounded channel. Dropping the returned
    /// receiver unsubscribes it.
    pub fn subscribe_channel(
        &self,
        pattern: &str,
        capacity: usize,
    ) -> Result<EventReceiver, EventBusError> {
        let pattern =
            TopicPattern::parse(pattern).map_err(|e| EventBusError::InvalidPattern(e.to_string()))?;
        let (sender, receiver) = mpsc::channel(capacity.max(1));

        let handler: Handler = Box::new(move |event: &Event| {
            match sender.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    warn!(topic = %dropped.topic, "Event receiver full, dropping event");
                    metrics::counter!("fleet_events_dropped_total").increment(1);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
            Ok(())
        });
        let subscription = self.inner.register(pattern, handler);

        Ok(EventReceiver {
            receiver,
            subscription,
            bus: Arc::downgrade(&self.inner),
        })
    }

    /// Returns whether the subscription was still registered.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.inner.unregister(subscription)
    }

    /// Deliver `event` to every matching subscriber.
    ///
    /// Handler errors and panics are logged and never reach the publisher.
    ///
    /// Events on one topic lane are delivered by a single thread at a time.
    /// When another thread (or a handler further up this call stack) is
    /// already draining the lane, `event` is queued and `publish` returns
    /// at once; the draining thread delivers it after the events ahead of
    /// it. Delivery is therefore synchronous only for the publisher that
    /// found the lane idle.
    pub fn publish(&self, event: Event) {
        let lane = &self.inner.lanes[lane_for(&event.topic)];
        {
            let mut lane = lane.lock();
            lane.queue.push_back(event);
            if lane.draining {
                return;
            }
            lane.draining = true;
        }

        loop {
            let next = {
                let mut lane = lane.lock();
                match lane.queue.pop_front() {
                    Some(event) => event,
                    None => {
                        lane.draining = false;
                        return;
                    }
                }
            };
            self.inner.dispatch(&next);
        }
    }

    pub fn publish_domain<E: DomainEvent>(&self, event: E) {
        self.publish(event.into_event());
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }
}

impl BusInner {
    fn register(&self, pattern: TopicPattern, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let subscriber = Arc::new(Subscriber {
            pattern,
            handler,
            active: AtomicBool::new(true),
        });
        self.subscribers.write().insert(id, subscriber);
        debug!(subscription = id.0, "Subscriber registered");
        id
    }

    fn unregister(&self, id: SubscriptionId) -> bool {
        match self.subscribers.write().remove(&id) {
            Some(subscriber) => {
                subscriber.active.store(false, Ordering::Release);
                debug!(subscription = id.0, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, event: &Event) {
        let targets: Vec<(SubscriptionId, Arc<Subscriber>)> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, subscriber)| subscriber.pattern.matches(&event.topic))
            .map(|(id, subscriber)| (*id, Arc::clone(subscriber)))
            .collect();

        if targets.is_empty() {
            debug!(topic = %event.topic, "No subscribers listening to event");
            return;
        }

        for (id, subscriber) in targets {
            // Unsubscribed by an earlier handler in this same dispatch.
            if !subscriber.active.load(Ordering::Acquire) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(event))) {
                Ok(Ok(())) => {
                    metrics::counter!("fleet_events_delivered_total").increment(1);
                }
                Ok(Err(e)) => {
                    warn!(
                        topic = %event.topic,
                        subscription = id.0,
                        error = %e,
                        "Event handler failed"
                    );
                    metrics::counter!("fleet_event_handler_failures_total").increment(1);
                }
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    error!(
                        topic = %event.topic,
                        subscription = id.0,
                        panic = %message,
                        "Event handler panicked"
                    );
                    metrics::counter!("fleet_event_handler_failures_total").increment(1);
                }
            }
        }
    }
}

fn lane_for(topic: &str) -> usize {
    let mut hasher = DefaultHasher::new();
    topic.hash(&mut hasher);
    (hasher.finish() as usize) % TOPIC_LANES
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Async receiver for events matching one subscription pattern
pub struct EventReceiver {
    receiver: mpsc::Receiver<Event>,
    subscription: SubscriptionId,
    bus: Weak<BusInner>,
}

impl EventReceiver {
    /// Receive the next event (waits until one is available)
    pub async fn recv(&mut self) -> Result<Event, EventBusError> {
        self.receiver.recv().await.ok_or(EventBusError::Closed)
    }

    /// Try to receive an event without blocking
    pub fn try_recv(&mut self) -> Result<Event, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            mpsc::error::TryRecvError::Empty => EventBusError::Empty,
            mpsc::error::TryRecvError::Disconnected => EventBusError::Closed,
        })
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }
}

impl Drop for EventReceiver {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unregister(self.subscription);
        }
    }
}

/// Errors that can occur when subscribing or receiving events
#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Invalid topic pattern: {0}")]
    InvalidPattern(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{topics, TaskEvent};
    use crate::domain::task::TaskId;
    use chrono::Utc;
    use serde_json::json;

    fn recorder(bus: &EventBus, pattern: &str, label: &'static str, log: &Arc<Mutex<Vec<String>>>) {
        let log = Arc::clone(log);
        bus.subscribe(pattern, move |event| {
            log.lock().push(format!("{}:{}", label, event.topic));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delivery_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        recorder(&bus, "task.*", "first", &log);
        recorder(&bus, "task.assigned", "second", &log);
        recorder(&bus, "peer.*", "ignored", &log);

        bus.publish(Event::new(topics::TASK_ASSIGNED, json!({})));

        assert_eq!(
            *log.lock(),
            vec!["first:task.assigned", "second:task.assigned"]
        );
    }

    #[test]
    fn test_failing_handlers_are_isolated() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("t", |_| anyhow::bail!("handler error")).unwrap();
        bus.subscribe("t", |_| panic!("handler panic")).unwrap();
        recorder(&bus, "t", "survivor", &log);

        bus.publish(Event::new("t", json!(null)));
        bus.publish(Event::new("t", json!(null)));

        assert_eq!(log.lock().len(), 2);
    }

    #[test]
    fn test_unsubscribe_inside_callback() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicU64::new(0));
        let own_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let id = {
            let bus_handle = bus.clone();
            let calls = Arc::clone(&calls);
            let own_id = Arc::clone(&own_id);
            bus.subscribe("once", move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                if let Some(id) = *own_id.lock() {
                    bus_handle.unsubscribe(id);
                }
                Ok(())
            })
            .unwrap()
        };
        *own_id.lock() = Some(id);

        bus.publish(Event::new("once", json!(1)));
        bus.publish(Event::new("once", json!(2)));

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_unsubscribing_a_later_one_skips_it() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let victim: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        {
            let bus_handle = bus.clone();
            let victim = Arc::clone(&victim);
            bus.subscribe("t", move |_| {
                if let Some(id) = victim.lock().take() {
                    bus_handle.unsubscribe(id);
                }
                Ok(())
            })
            .unwrap();
        }
        let log_clone = Arc::clone(&log);
        let victim_id = bus
            .subscribe("t", move |_| {
                log_clone.lock().push("victim".to_string());
                Ok(())
            })
            .unwrap();
        *victim.lock() = Some(victim_id);

        bus.publish(Event::new("t", json!(null)));
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_subscribe_unsubscribe_cycles_do_not_grow() {
        let bus = EventBus::new();
        for _ in 0..10_000 {
            let id = bus.subscribe("agent.lifecycle.ready", |_| Ok(())).unwrap();
            assert!(bus.unsubscribe(id));
        }
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.inner.subscribers.read().is_empty());
    }

    #[test]
    fn test_reentrant_publish_keeps_topic_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        {
            let bus_handle = bus.clone();
            bus.subscribe("chain", move |event| {
                if event.payload == json!(1) {
                    bus_handle.publish(Event::new("chain", json!(2)));
                }
                Ok(())
            })
            .unwrap();
        }
        let log_clone = Arc::clone(&log);
        bus.subscribe("chain", move |event| {
            log_clone.lock().push(event.payload.clone());
            Ok(())
        })
        .unwrap();

        bus.publish(Event::new("chain", json!(1)));

        assert_eq!(*log.lock(), vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_publish_during_active_drain_is_delivered_by_drainer() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        {
            let log = Arc::clone(&log);
            bus.subscribe("slow", move |event| {
                log.lock()
                    .push((event.payload.clone(), std::thread::current().id()));
                if event.payload == json!(1) {
                    entered_tx.lock().send(()).unwrap();
                    release_rx.lock().recv().unwrap();
                }
                Ok(())
            })
            .unwrap();
        }

        let drainer = {
            let bus = bus.clone();
            std::thread::spawn(move || {
                bus.publish(Event::new("slow", json!(1)));
                std::thread::current().id()
            })
        };
        entered_rx.recv().unwrap();

        // Returns while the handler for the first event is still running.
        bus.publish(Event::new("slow", json!(2)));
        assert_eq!(log.lock().len(), 1);

        release_tx.send(()).unwrap();
        let drainer_id = drainer.join().unwrap();

        let log = log.lock();
        let payloads: Vec<_> = log.iter().map(|(payload, _)| payload.clone()).collect();
        assert_eq!(payloads, vec![json!(1), json!(2)]);
        assert_eq!(log[1].1, drainer_id);
    }

    #[test]
    fn test_concurrent_publishers_preserve_per_publisher_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::<(u64, u64)>::new()));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe("ordered", move |event| {
            let publisher = event.payload["publisher"].as_u64().unwrap_or_default();
            let seq = event.payload["seq"].as_u64().unwrap_or_default();
            seen_clone.lock().push((publisher, seq));
            Ok(())
        })
        .unwrap();

        let threads: Vec<_> = (0..4u64)
            .map(|publisher| {
                let bus = bus.clone();
                std::thread::spawn(move || {
                    for seq in 0..100u64 {
                        bus.publish(Event::new(
                            "ordered",
                            json!({ "publisher": publisher, "seq": seq }),
                        ));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        let seen = seen.lock();
        assert_eq!(seen.len(), 400);
        for publisher in 0..4u64 {
            let sequence: Vec<u64> = seen
                .iter()
                .filter(|(p, _)| *p == publisher)
                .map(|(_, s)| *s)
                .collect();
            assert_eq!(sequence, (0..100).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn test_channel_receiver() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe_channel("task.*", 8).unwrap();

        bus.publish_domain(TaskEvent::Queued {
            task_id: TaskId::new(),
            position: 1,
            queued_at: Utc::now(),
        });

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.topic, topics::TASK_QUEUED);
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));

        assert_eq!(bus.subscriber_count(), 1);
        drop(receiver);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_full_channel_drops_newest() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe_channel("burst", 2).unwrap();
        for i in 0..5 {
            bus.publish(Event::new("burst", json!(i)));
        }
        assert_eq!(receiver.recv().await.unwrap().payload, json!(0));
        assert_eq!(receiver.recv().await.unwrap().payload, json!(1));
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }
}
