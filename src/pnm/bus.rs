//! Event Bus
//!
//! Fan-out of pipeline events to any number of subscribers. Every event gets
//! a global sequence number under one lock, so all subscribers observe the
//! same order. Each subscriber has its own bounded queue; a stalled consumer
//! costs at most `queue_capacity` events of memory and never blocks the
//! pipeline longer than `publish_timeout`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::config::{BusConfig, OverflowPolicy};
use super::error::{PnmError, PnmResult};
use super::metrics::PnmMetrics;
use crate::models::{EventEnvelope, PnmEvent};

struct SubscriberQueue {
    name: String,
    capacity: usize,
    items: Mutex<VecDeque<Arc<EventEnvelope>>>,
    item_ready: Notify,
    space_ready: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl SubscriberQueue {
    /// Push, evicting the oldest entry when full. Returns true if something
    /// was evicted.
    fn push_evicting(&self, envelope: Arc<EventEnvelope>) -> bool {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity {
                items.pop_front().is_some()
            } else {
                false
            };
            items.push_back(envelope);
            evicted
        };
        self.item_ready.notify_one();
        evicted
    }

    /// Push only if there is room
    fn try_push(&self, envelope: &Arc<EventEnvelope>) -> bool {
        let pushed = {
            let mut items = self.items.lock();
            if items.len() < self.capacity {
                items.push_back(envelope.clone());
                true
            } else {
                false
            }
        };
        if pushed {
            self.item_ready.notify_one();
        }
        pushed
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.item_ready.notify_one();
        self.space_ready.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct BusState {
    next_seq: u64,
    subscribers: Vec<Arc<SubscriberQueue>>,
}

pub struct EventBus {
    config: BusConfig,
    metrics: Arc<PnmMetrics>,
    // tokio mutex: held across the backpressure wait so publish order holds
    state: tokio::sync::Mutex<BusState>,
    closed: AtomicBool,
}

impl EventBus {
    pub fn new(config: BusConfig, metrics: Arc<PnmMetrics>) -> Self {
        Self {
            config,
            metrics,
            state: tokio::sync::Mutex::new(BusState {
                next_seq: 0,
                subscribers: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Register a consumer. It sees events published after this call.
    pub async fn subscribe(&self, name: impl Into<String>) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            name: name.into(),
            capacity: self.config.queue_capacity.max(1),
            items: Mutex::new(VecDeque::new()),
            item_ready: Notify::new(),
            space_ready: Notify::new(),
            closed: AtomicBool::new(self.closed.load(Ordering::Acquire)),
            dropped: AtomicU64::new(0),
        });

        let mut state = self.state.lock().await;
        state.subscribers.push(queue.clone());
        info!(subscriber = %queue.name, total = state.subscribers.len(), "Subscriber registered");

        Subscription { queue }
    }

    /// Stamp and deliver an event to every live subscriber
    pub async fn publish(&self, event: PnmEvent) -> PnmResult<Arc<EventEnvelope>> {
        let mut state = self.state.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(PnmError::PipelineClosed);
        }

        let envelope = Arc::new(EventEnvelope {
            seq: state.next_seq,
            published_at: Utc::now(),
            event,
        });
        state.next_seq += 1;

        state.subscribers.retain(|q| {
            let live = !q.is_closed();
            if !live {
                debug!(subscriber = %q.name, "Removing closed subscriber");
            }
            live
        });

        for queue in &state.subscribers {
            match self.config.overflow {
                OverflowPolicy::DropOldest => {
                    if queue.push_evicting(envelope.clone()) {
                        self.note_drop(queue, envelope.seq);
                    }
                }
                OverflowPolicy::Backpressure => {
                    if !self.push_waiting(queue, &envelope).await {
                        self.note_drop(queue, envelope.seq);
                    }
                }
            }
        }

        debug!(
            seq = envelope.seq,
            kind = envelope.event.kind(),
            subscribers = state.subscribers.len(),
            "Event published"
        );

        Ok(envelope)
    }

    /// Wait for room until `publish_timeout`; false if the event was dropped
    async fn push_waiting(&self, queue: &SubscriberQueue, envelope: &Arc<EventEnvelope>) -> bool {
        let deadline = tokio::time::Instant::now() + self.config.publish_timeout;
        loop {
            if queue.is_closed() {
                return true;
            }
            if queue.try_push(envelope) {
                return true;
            }
            if tokio::time::timeout_at(deadline, queue.space_ready.notified())
                .await
                .is_err()
            {
                return false;
            }
        }
    }

    fn note_drop(&self, queue: &SubscriberQueue, seq: u64) {
        let total = queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.record_bus_drop();
        // First drop, then every 100th
        if total == 1 || total % 100 == 0 {
            warn!(
                subscriber = %queue.name,
                seq,
                dropped_total = total,
                policy = ?self.config.overflow,
                "Subscriber queue full, dropping event"
            );
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        let state = self.state.lock().await;
        state.subscribers.iter().filter(|q| !q.is_closed()).count()
    }

    /// Refuse further publishes and end every subscription once drained
    pub async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let state = self.state.lock().await;
        for queue in &state.subscribers {
            queue.close();
        }
        info!("Event bus closed");
    }
}

/// Receiving end for one consumer. Dropping it unsubscribes.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Next event in publish order; `None` once the bus is closed and drained
    pub async fn recv(&mut self) -> Option<Arc<EventEnvelope>> {
        loop {
            if let Some(envelope) = self.try_recv() {
                return Some(envelope);
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.item_ready.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<EventEnvelope>> {
        let envelope = self.queue.items.lock().pop_front();
        if envelope.is_some() {
            self.queue.space_ready.notify_one();
        }
        envelope
    }

    pub fn name(&self) -> &str {
        &self.queue.name
    }

    /// Events this subscriber lost to overflow
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.items.lock().len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.queue.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceClass;
    use std::time::Duration;
    use uuid::Uuid;

    fn event(n: u128) -> PnmEvent {
        PnmEvent::UnresolvedFault {
            fault_hypothesis_id: Uuid::from_u128(n),
            suspected_node_id: format!("node-{}", n),
            node_class: DeviceClass::Tap,
            dominant_metric: None,
            reason: "test".into(),
        }
    }

    fn bus(capacity: usize, overflow: OverflowPolicy) -> EventBus {
        EventBus::new(
            BusConfig {
                queue_capacity: capacity,
                overflow,
                publish_timeout: Duration::from_millis(20),
            },
            Arc::new(PnmMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_all_subscribers_see_same_order() {
        let bus = bus(16, OverflowPolicy::DropOldest);
        let mut a = bus.subscribe("a").await;
        let mut b = bus.subscribe("b").await;

        for i in 0..5 {
            bus.publish(event(i)).await.unwrap();
        }

        for sub in [&mut a, &mut b] {
            let seqs: Vec<u64> = (0..5).map(|_| sub.try_recv().unwrap().seq).collect();
            assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_bounds_queue() {
        let bus = bus(3, OverflowPolicy::DropOldest);
        let mut sub = bus.subscribe("slow").await;
        for i in 0..10 {
            bus.publish(event(i)).await.unwrap();
        }
        assert_eq!(sub.pending(), 3);
        assert_eq!(sub.dropped(), 7);
        assert_eq!(sub.try_recv().unwrap().seq, 7);
        assert_eq!(bus.metrics.snapshot().bus_dropped, 7);
    }

    #[tokio::test]
    async fn test_backpressure_times_out_then_drops_new() {
        let bus = bus(2, OverflowPolicy::Backpressure);
        let mut sub = bus.subscribe("stalled").await;
        for i in 0..3 {
            bus.publish(event(i)).await.unwrap();
        }
        // The third event could not fit; the first two survive
        assert_eq!(sub.dropped(), 1);
        assert_eq!(sub.try_recv().unwrap().seq, 0);
        assert_eq!(sub.try_recv().unwrap().seq, 1);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_backpressure_waits_for_consumer() {
        let bus = Arc::new(bus(1, OverflowPolicy::Backpressure));
        let mut sub = bus.subscribe("live").await;

        let consumer = tokio::spawn(async move {
            let mut seqs = Vec::new();
            while let Some(envelope) = sub.recv().await {
                seqs.push(envelope.seq);
                if seqs.len() == 4 {
                    break;
                }
            }
            seqs
        });

        for i in 0..4 {
            bus.publish(event(i)).await.unwrap();
        }
        let seqs = tokio::time::timeout(Duration::from_secs(5), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seqs.first(), Some(&0));
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_dropped_subscription_is_removed() {
        let bus = bus(4, OverflowPolicy::Backpressure);
        let sub = bus.subscribe("gone").await;
        drop(sub);
        bus.publish(event(1)).await.unwrap();
        assert_eq!(bus.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let bus = bus(4, OverflowPolicy::DropOldest);
        let mut sub = bus.subscribe("reader").await;
        bus.publish(event(1)).await.unwrap();
        bus.close().await;

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_none());
        assert_eq!(bus.publish(event(2)).await.unwrap_err(), PnmError::PipelineClosed);
    }
}
