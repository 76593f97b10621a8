//! Event Bus: bounded ring + live subscriber queues.
//!
//! One mutex guards both the ring and the subscriber set. Subscriber queues
//! are unbounded `tokio::sync::mpsc` channels, so enqueueing on the producer
//! path never blocks; the mutex is only ever held for the cheap ring-push +
//! fan-out loop, never across a subscriber's own read.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use nettrace_common::TracingEvent;
use tokio::sync::mpsc;

struct SubscriberEntry {
    id: u64,
    sender: mpsc::UnboundedSender<TracingEvent>,
}

struct Inner {
    ring: VecDeque<TracingEvent>,
    capacity: usize,
    subscribers: Vec<SubscriberEntry>,
}

/// Owned by a `TracingTask`; merges every probe's events into one bounded
/// replay ring and fans them out to any number of live subscribers.
pub struct EventBus {
    inner: Mutex<Inner>,
    next_subscriber_id: AtomicU64,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ring: VecDeque::with_capacity(capacity),
                capacity: capacity.max(1),
                subscribers: Vec::new(),
            }),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    /// Appends to the ring (evicting the oldest if full) and fans the event
    /// out to every live subscriber. A subscriber whose receiver has been
    /// dropped is pruned lazily on the next publish.
    pub fn publish(&self, event: TracingEvent) {
        let mut inner = self.inner.lock().unwrap();
        if inner.ring.len() >= inner.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(event.clone());
        inner.subscribers.retain(|sub| sub.sender.send(event.clone()).is_ok());
    }

    /// Atomically creates a subscriber queue, seeds it with a snapshot of
    /// the current ring contents in original order, and registers it for
    /// future broadcasts.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock().unwrap();
            for event in inner.ring.iter() {
                // The snapshot send always succeeds: `rx` is held by us.
                let _ = tx.send(event.clone());
            }
            inner.subscribers.push(SubscriberEntry { id, sender: tx });
        }
        Subscription {
            id,
            bus: Arc::clone(self),
            receiver: rx,
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.subscribers.retain(|sub| sub.id != id);
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscribers.len()
    }
}

/// A scoped handle on the bus for one consumer. Removes itself from the
/// subscriber set on drop, covering early return, client disconnect, and
/// panic unwinding alike.
pub struct Subscription {
    id: u64,
    bus: Arc<EventBus>,
    receiver: mpsc::UnboundedReceiver<TracingEvent>,
}

impl Subscription {
    /// Awaits the next event. Resolves to `None` only if the bus itself has
    /// been dropped.
    pub async fn next(&mut self) -> Option<TracingEvent> {
        self.receiver.recv().await
    }

    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(ts: u64) -> TracingEvent {
        TracingEvent {
            timestamp: ts,
            probe: "demo".into(),
            event: json!({"n": ts}),
        }
    }

    #[test]
    fn ring_holds_at_most_capacity() {
        let bus = EventBus::new(3);
        for i in 0..10 {
            bus.publish(event(i));
        }
        let inner = bus.inner.lock().unwrap();
        assert_eq!(inner.ring.len(), 3);
        let timestamps: Vec<_> = inner.ring.iter().map(|e| e.timestamp).collect();
        assert_eq!(timestamps, vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn subscriber_sees_ring_snapshot_then_live_events() {
        let bus = Arc::new(EventBus::new(5));
        for i in 0..3 {
            bus.publish(event(i));
        }
        let mut sub = bus.subscribe();
        bus.publish(event(3));

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(sub.next().await.unwrap().timestamp);
        }
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn two_subscribers_see_identical_suffix() {
        let bus = Arc::new(EventBus::new(5));
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        for i in 0..4 {
            bus.publish(event(i));
        }
        for i in 0..4 {
            assert_eq!(a.next().await.unwrap().timestamp, i);
            assert_eq!(b.next().await.unwrap().timestamp, i);
        }
    }

    #[tokio::test]
    async fn closing_subscription_removes_it_from_the_set() {
        let bus = Arc::new(EventBus::new(5));
        let sub = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);
        sub.close();
        assert_eq!(bus.subscriber_count(), 0);
    }
}
