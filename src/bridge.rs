//! Event bridge between the driver's threads and the single consumer.
//!
//! Any number of [`EventPublisher`] clones push [`MeshEvent`]s from any thread; exactly one
//! [`EventConsumer`] pulls them, in publish order, on the presentation thread. The queue is
//! bounded with a drop policy tuned for mesh traffic:
//!
//! * connection, channel, message and ack events are never dropped (the queue grows past
//!   capacity rather than lose them);
//! * a node update is first coalesced with a queued update for the same node (field-level
//!   merge in place: the merged update keeps the queue position of the older one, so its
//!   newer fields may reach the consumer ahead of events published in between);
//! * otherwise the oldest droppable event (node update or diagnostic) makes room, and a
//!   droppable event that finds nothing to evict is dropped itself.
//!
//! After [`EventPublisher::shutdown`] new events are discarded and counted, while anything
//! already queued can still be drained.

use crate::model::{AckStatus, ChannelInfo, ConnectionStatus, Message, MessageId, NodeEntry};
use chrono::{DateTime, Utc};
use log::{debug, trace};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Something the adapter could not translate, surfaced for display instead of crashing.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    /// Which notification kind failed (`node_info`, `channel`, `text`, `ack`, `link`).
    pub source: &'static str,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl Diagnostic {
    pub fn new(source: &'static str, detail: impl Into<String>) -> Self {
        Diagnostic {
            source,
            detail: detail.into(),
            at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Node(NodeEntry),
    Channel(ChannelInfo),
    Message(Message),
    Ack { id: MessageId, status: AckStatus },
    Connection(ConnectionStatus),
    Diagnostic(Diagnostic),
}

impl MeshEvent {
    /// Node updates and diagnostics may be shed under pressure; the rest may not.
    pub fn is_droppable(&self) -> bool {
        matches!(self, MeshEvent::Node(_) | MeshEvent::Diagnostic(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            MeshEvent::Node(_) => "node",
            MeshEvent::Channel(_) => "channel",
            MeshEvent::Message(_) => "message",
            MeshEvent::Ack { .. } => "ack",
            MeshEvent::Connection(_) => "connection",
            MeshEvent::Diagnostic(_) => "diagnostic",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub published: u64,
    pub delivered: u64,
    pub coalesced: u64,
    pub dropped_overflow: u64,
    pub discarded_after_shutdown: u64,
    pub high_water: usize,
}

enum Admission {
    Push(MeshEvent),
    /// Folded into an update already queued.
    Merged,
    Shed,
}

struct Queue {
    events: VecDeque<MeshEvent>,
    closed: bool,
    stats: BridgeStats,
}

impl Queue {
    /// Apply the overflow policy to an incoming event.
    fn admit(&mut self, event: MeshEvent, capacity: usize) -> Admission {
        if self.events.len() < capacity {
            return Admission::Push(event);
        }
        if let MeshEvent::Node(update) = &event {
            let queued = self.events.iter_mut().find_map(|e| match e {
                MeshEvent::Node(n) if n.id == update.id => Some(n),
                _ => None,
            });
            if let Some(queued) = queued {
                queued.merge_from(update);
                self.stats.coalesced += 1;
                return Admission::Merged;
            }
        }
        if let Some(pos) = self.events.iter().position(MeshEvent::is_droppable) {
            if let Some(victim) = self.events.remove(pos) {
                trace!("bridge full: dropped queued {} event", victim.kind());
            }
            self.stats.dropped_overflow += 1;
            return Admission::Push(event);
        }
        if event.is_droppable() {
            trace!("bridge full: dropped incoming {} event", event.kind());
            self.stats.dropped_overflow += 1;
            return Admission::Shed;
        }
        Admission::Push(event)
    }
}

struct Inner {
    queue: Mutex<Queue>,
    available: Condvar,
    notify: Notify,
    capacity: usize,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a bridge holding at most `capacity` droppable events.
pub fn channel(capacity: usize) -> (EventPublisher, EventConsumer) {
    let inner = Arc::new(Inner {
        queue: Mutex::new(Queue {
            events: VecDeque::with_capacity(capacity.min(1024)),
            closed: false,
            stats: BridgeStats::default(),
        }),
        available: Condvar::new(),
        notify: Notify::new(),
        capacity: capacity.max(1),
    });
    (
        EventPublisher {
            inner: inner.clone(),
        },
        EventConsumer { inner },
    )
}

/// Producer side. Cheap to clone and safe to use from any thread.
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<Inner>,
}

impl EventPublisher {
    /// Enqueue an event. Never blocks beyond the queue mutex and never fails; after
    /// shutdown the event is silently discarded.
    pub fn publish(&self, event: MeshEvent) {
        {
            let mut q = self.inner.lock();
            if q.closed {
                q.stats.discarded_after_shutdown += 1;
                trace!("bridge closed: discarded {} event", event.kind());
                return;
            }
            q.stats.published += 1;
            let capacity = self.inner.capacity;
            let Admission::Push(event) = q.admit(event, capacity) else {
                return;
            };
            q.events.push_back(event);
            q.stats.high_water = q.stats.high_water.max(q.events.len());
        }
        self.inner.available.notify_one();
        self.inner.notify.notify_one();
    }

    /// Stop accepting events and wake any waiting consumer. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut q = self.inner.lock();
            if q.closed {
                return;
            }
            q.closed = true;
            debug!(
                "bridge shutdown: published={} delivered={} coalesced={} dropped={} queued={} high_water={}",
                q.stats.published,
                q.stats.delivered,
                q.stats.coalesced,
                q.stats.dropped_overflow,
                q.events.len(),
                q.stats.high_water
            );
        }
        self.inner.available.notify_all();
        self.inner.notify.notify_one();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.lock().closed
    }

    pub fn stats(&self) -> BridgeStats {
        self.inner.lock().stats
    }
}

/// The unique consumer side. Not `Clone`: there is exactly one reader per bridge.
pub struct EventConsumer {
    inner: Arc<Inner>,
}

impl EventConsumer {
    /// Pop up to `max_batch` events in publish order. Lazy: events are removed only as the
    /// iterator is advanced; whatever is not pulled stays queued.
    pub fn drain(&mut self, max_batch: usize) -> Drain<'_> {
        Drain {
            inner: &self.inner,
            remaining: max_batch,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shut down and fully drained: nothing more will ever arrive.
    pub fn is_finished(&self) -> bool {
        let q = self.inner.lock();
        q.closed && q.events.is_empty()
    }

    /// Block the calling thread until an event is queued, the bridge shuts down, or `timeout`
    /// passes. Returns whether events are available.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let q = self.inner.lock();
        let (q, _) = self
            .inner
            .available
            .wait_timeout_while(q, timeout, |q| q.events.is_empty() && !q.closed)
            .unwrap_or_else(PoisonError::into_inner);
        !q.events.is_empty()
    }

    /// Async counterpart of [`wait_timeout`](Self::wait_timeout); yields to the runtime while
    /// waiting.
    pub async fn ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let q = self.inner.lock();
                if !q.events.is_empty() {
                    return true;
                }
                if q.closed {
                    return false;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if tokio::time::timeout(remaining, self.inner.notify.notified())
                .await
                .is_err()
            {
                return !self.is_empty();
            }
        }
    }

    pub fn stats(&self) -> BridgeStats {
        self.inner.lock().stats
    }
}

pub struct Drain<'a> {
    inner: &'a Inner,
    remaining: usize,
}

impl Iterator for Drain<'_> {
    type Item = MeshEvent;

    fn next(&mut self) -> Option<MeshEvent> {
        if self.remaining == 0 {
            return None;
        }
        let mut q = self.inner.lock();
        let event = q.events.pop_front()?;
        q.stats.delivered += 1;
        self.remaining -= 1;
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Battery, ConnectionState, NodeId};

    fn node(id: &str) -> NodeEntry {
        NodeEntry::new(NodeId::new(id))
    }

    fn status(state: ConnectionState) -> MeshEvent {
        MeshEvent::Connection(ConnectionStatus::new(state))
    }

    #[test]
    fn drains_in_publish_order_and_respects_batch() {
        let (tx, mut rx) = channel(16);
        tx.publish(status(ConnectionState::Connecting));
        tx.publish(MeshEvent::Node(node("!00000001")));
        tx.publish(status(ConnectionState::Connected));

        let first: Vec<_> = rx.drain(2).collect();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0], status(ConnectionState::Connecting));
        assert!(matches!(first[1], MeshEvent::Node(_)));
        assert_eq!(rx.len(), 1);
        assert_eq!(rx.drain(10).next(), Some(status(ConnectionState::Connected)));
        assert!(rx.drain(10).next().is_none());
    }

    #[test]
    fn full_queue_coalesces_updates_for_same_node() {
        let (tx, mut rx) = channel(2);
        let mut a = node("!0000000a");
        a.battery = Some(Battery::Level(80));
        tx.publish(MeshEvent::Node(a));
        tx.publish(MeshEvent::Node(node("!0000000b")));
        let mut a2 = node("!0000000a");
        a2.snr = Some(4.2);
        tx.publish(MeshEvent::Node(a2));

        let events: Vec<_> = rx.drain(10).collect();
        assert_eq!(events.len(), 2);
        // Merged where the first update was queued.
        match &events[0] {
            MeshEvent::Node(n) => {
                assert_eq!(n.id.as_str(), "!0000000a");
                assert_eq!(n.battery, Some(Battery::Level(80)));
                assert_eq!(n.snr, Some(4.2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rx.stats().coalesced, 1);
    }

    #[test]
    fn critical_events_are_never_dropped() {
        let (tx, mut rx) = channel(2);
        tx.publish(MeshEvent::Diagnostic(Diagnostic::new("text", "bad utf-8")));
        for i in 0..4 {
            tx.publish(MeshEvent::Ack {
                id: MessageId::new(format!("m{}", i)),
                status: AckStatus::Acknowledged,
            });
        }
        // Nothing droppable left: an incoming node update is shed instead.
        tx.publish(MeshEvent::Node(node("!00000001")));

        let events: Vec<_> = rx.drain(100).collect();
        assert_eq!(events.len(), 4);
        assert!(events.iter().all(|e| matches!(e, MeshEvent::Ack { .. })));
        let stats = rx.stats();
        assert_eq!(stats.dropped_overflow, 2);
        assert_eq!(stats.high_water, 4);
    }

    #[test]
    fn shutdown_keeps_queued_and_discards_new() {
        let (tx, mut rx) = channel(8);
        tx.publish(status(ConnectionState::Connected));
        tx.shutdown();
        tx.publish(status(ConnectionState::Disconnected));
        assert!(!rx.is_finished());
        let events: Vec<_> = rx.drain(8).collect();
        assert_eq!(events, vec![status(ConnectionState::Connected)]);
        assert!(rx.is_finished());
        assert_eq!(rx.stats().discarded_after_shutdown, 1);
    }

    #[test]
    fn wait_timeout_wakes_on_publish_from_other_thread() {
        let (tx, rx) = channel(8);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.publish(status(ConnectionState::Connecting));
        });
        assert!(rx.wait_timeout(Duration::from_secs(5)));
        t.join().unwrap();
    }

    #[test]
    fn wait_timeout_returns_false_when_idle() {
        let (_tx, rx) = channel(8);
        assert!(!rx.wait_timeout(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn ready_resolves_after_publish() {
        let (tx, rx) = channel(8);
        let handle = tokio::task::spawn_blocking(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.publish(status(ConnectionState::Connected));
        });
        assert!(rx.ready(Duration::from_secs(5)).await);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn ready_returns_false_after_shutdown_when_empty() {
        let (tx, rx) = channel(8);
        tx.shutdown();
        assert!(!rx.ready(Duration::from_secs(5)).await);
    }
}
