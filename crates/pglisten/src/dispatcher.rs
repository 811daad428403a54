//! Notification dispatcher
//!
//! Sits between a session's event stream and the consumer callbacks:
//!
//! ```text
//! EventStream --feed()--> decode + sequence --> DeliveryQueue --delivery task--> callbacks
//! ```
//!
//! `feed()` runs on the read loop and never waits on consumers: pushing into
//! the bounded queue is synchronous, and a full queue sheds load according to
//! the [`OverflowPolicy`]. A single delivery task pops events and invokes the
//! callbacks in registration order, so every callback sees events in arrival
//! order. Errors found on the read loop (malformed events, overflow) travel
//! through the same queue and reach `on_error` from the delivery task; drops
//! are coalesced into one report per delivery pass. The dispatcher outlives
//! individual sessions; sequence numbers keep counting across reconnections.

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{OverflowPolicy, PayloadFormat, QueueConfig};
use crate::error::Error;
use crate::hooks::Hooks;
use crate::notification::{decode, Notification, RawEvent};
use crate::session::EventStream;

/// Error reports held for the delivery task before the oldest is discarded
pub const ERROR_BACKLOG: usize = 64;

/// What happened to a pushed notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Queued without loss
    Queued,
    /// Queued; the oldest queued event was discarded
    DroppedOldest,
    /// Discarded because the queue was full
    DroppedNewest,
    /// Discarded because the queue is closed
    Closed,
    /// Rejected by validation before reaching the queue
    Rejected,
}

/// Next item for the delivery task
#[derive(Debug)]
pub enum Delivery {
    /// Hand to the notification callbacks
    Notification(Notification),
    /// Hand to the error callbacks
    Error(Error),
}

struct QueueInner {
    items: VecDeque<Notification>,
    errors: VecDeque<Error>,
    unreported_drops: u64,
    closed: bool,
}

/// Bounded FIFO between the read loop and the delivery task
pub struct DeliveryQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
    dropped: AtomicU64,
}

impl DeliveryQueue {
    /// Create a queue holding at most `capacity` events
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::with_capacity(capacity.min(4096)),
                errors: VecDeque::new(),
                unreported_drops: 0,
                closed: false,
            }),
            capacity,
            policy,
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue without waiting
    pub fn push(&self, notification: Notification) -> PushOutcome {
        let outcome = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return PushOutcome::Closed;
            }
            let outcome = if inner.items.len() < self.capacity {
                inner.items.push_back(notification);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        inner.items.pop_front();
                        inner.items.push_back(notification);
                        PushOutcome::DroppedOldest
                    }
                    OverflowPolicy::DropNewest => PushOutcome::DroppedNewest,
                }
            };
            if outcome != PushOutcome::Queued {
                inner.unreported_drops += 1;
            }
            outcome
        };

        if outcome != PushOutcome::Queued {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        outcome
    }

    /// Queue an error report for the delivery task
    ///
    /// Returns `false` if the queue is closed. When the backlog is full the
    /// oldest report is discarded.
    pub fn push_error(&self, err: Error) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.closed {
                return false;
            }
            if inner.errors.len() >= ERROR_BACKLOG {
                if let Some(lost) = inner.errors.pop_front() {
                    debug!(error = %lost, "error backlog full; discarding oldest report");
                }
            }
            inner.errors.push_back(err);
        }
        self.notify.notify_one();
        true
    }

    /// Wait for the next item; `None` once the queue is closed
    ///
    /// Pending drops are reported first as a single
    /// [`Error::QueueOverflow`], then queued errors, then notifications.
    pub async fn next(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.closed {
                    return None;
                }
                if inner.unreported_drops > 0 {
                    let dropped = std::mem::take(&mut inner.unreported_drops);
                    return Some(Delivery::Error(Error::QueueOverflow { dropped }));
                }
                if let Some(err) = inner.errors.pop_front() {
                    return Some(Delivery::Error(err));
                }
                if let Some(item) = inner.items.pop_front() {
                    return Some(Delivery::Notification(item));
                }
            }

            notified.await;
        }
    }

    /// Stop accepting events and discard what is queued; returns the discarded count
    pub fn close(&self) -> usize {
        let discarded = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            let n = inner.items.len();
            inner.items.clear();
            inner.errors.clear();
            inner.unreported_drops = 0;
            n
        };
        self.notify.notify_waiters();
        discarded
    }

    /// Whether `close()` was called
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Notifications currently queued
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    /// Whether no notification is queued
    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Events dropped by the overflow policy
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Maximum queued events
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Dispatcher counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    /// Raw events read from sessions
    pub received: u64,
    /// Notifications handed to callbacks
    pub delivered: u64,
    /// Notifications dropped by the overflow policy
    pub dropped: u64,
    /// Raw events rejected by validation
    pub malformed: u64,
    /// Last assigned sequence number
    pub last_sequence: u64,
    /// Notifications waiting for delivery
    pub queued: usize,
}

/// Decodes, sequences and delivers notifications
pub struct NotificationDispatcher {
    queue: Arc<DeliveryQueue>,
    hooks: Arc<Hooks>,
    format: PayloadFormat,
    sequence: AtomicU64,
    received: AtomicU64,
    malformed: AtomicU64,
    delivered: Arc<AtomicU64>,
    delivery_started: AtomicBool,
}

impl NotificationDispatcher {
    /// Create a dispatcher bound to `hooks`
    pub fn new(queue: &QueueConfig, format: PayloadFormat, hooks: Arc<Hooks>) -> Self {
        Self {
            queue: Arc::new(DeliveryQueue::new(queue.capacity, queue.overflow)),
            hooks,
            format,
            sequence: AtomicU64::new(0),
            received: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            delivered: Arc::new(AtomicU64::new(0)),
            delivery_started: AtomicBool::new(false),
        }
    }

    /// Consume a session's event stream until it terminates
    ///
    /// Returns the reason the stream ended. Malformed events are reported and
    /// skipped; they never end the stream.
    pub async fn feed(&self, mut events: EventStream) -> Error {
        while let Some(item) = events.next().await {
            match item {
                Ok(raw) => {
                    self.dispatch(raw);
                }
                Err(e) if e.is_connection_lost() => return e,
                Err(e) => {
                    warn!(error = %e, "event stream reported an error");
                    self.queue.push_error(e);
                }
            }
        }
        Error::stream_terminated("event stream ended")
    }

    /// Decode one raw event and queue it for delivery
    pub fn dispatch(&self, raw: RawEvent) -> PushOutcome {
        self.received.fetch_add(1, Ordering::Relaxed);

        // Only the read loop assigns sequence numbers, so load/store is enough.
        let sequence = self.sequence.load(Ordering::Relaxed) + 1;
        let notification = match decode(raw, self.format, sequence) {
            Ok(n) => n,
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "skipping malformed notification");
                self.queue.push_error(e);
                return PushOutcome::Rejected;
            }
        };
        self.sequence.store(sequence, Ordering::Relaxed);

        let outcome = self.queue.push(notification);
        match outcome {
            PushOutcome::DroppedOldest | PushOutcome::DroppedNewest => {
                let total = self.queue.dropped();
                if total == 1 || total % 1000 == 0 {
                    warn!(dropped_total = total, policy = ?outcome, "delivery queue full");
                }
            }
            PushOutcome::Closed => {
                debug!(sequence, "notification discarded after shutdown");
            }
            PushOutcome::Queued | PushOutcome::Rejected => {}
        }
        outcome
    }

    /// Start the delivery task
    ///
    /// Returns `None` if delivery is already running.
    pub fn spawn_delivery(&self) -> Option<JoinHandle<()>> {
        if self.delivery_started.swap(true, Ordering::SeqCst) {
            return None;
        }

        let queue = self.queue.clone();
        let hooks = self.hooks.clone();
        let delivered = self.delivered.clone();
        Some(tokio::spawn(async move {
            while let Some(item) = queue.next().await {
                match item {
                    Delivery::Notification(notification) => {
                        hooks.emit_notification(&notification);
                        delivered.fetch_add(1, Ordering::Relaxed);
                    }
                    Delivery::Error(err) => hooks.emit_error(&err),
                }
                // Let the read loop run between consecutive callbacks.
                tokio::task::yield_now().await;
            }
            debug!("notification delivery stopped");
        }))
    }

    /// Stop accepting events and discard undelivered ones
    ///
    /// A callback already running is allowed to finish.
    pub fn close(&self) {
        let discarded = self.queue.close();
        if discarded > 0 {
            info!(discarded, "discarded undelivered notifications on shutdown");
        }
    }

    /// Snapshot counters
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            received: self.received.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.queue.dropped(),
            malformed: self.malformed.load(Ordering::Relaxed),
            last_sequence: self.sequence.load(Ordering::Relaxed),
            queued: self.queue.len(),
        }
    }

    /// The delivery queue
    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn notification(seq: u64) -> Notification {
        decode(RawEvent::new("a", format!("{}", seq)), PayloadFormat::Text, seq).unwrap()
    }

    #[test]
    fn test_queue_drop_oldest() {
        let queue = DeliveryQueue::new(2, OverflowPolicy::DropOldest);
        assert_eq!(queue.push(notification(1)), PushOutcome::Queued);
        assert_eq!(queue.push(notification(2)), PushOutcome::Queued);
        assert_eq!(queue.push(notification(3)), PushOutcome::DroppedOldest);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn test_queue_drop_newest() {
        let queue = DeliveryQueue::new(1, OverflowPolicy::DropNewest);
        assert_eq!(queue.push(notification(1)), PushOutcome::Queued);
        assert_eq!(queue.push(notification(2)), PushOutcome::DroppedNewest);
        assert_eq!(queue.dropped(), 1);
    }

    async fn next_notification(queue: &DeliveryQueue) -> Notification {
        match queue.next().await {
            Some(Delivery::Notification(n)) => n,
            other => panic!("expected a notification, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_queue_order_and_close() {
        let queue = DeliveryQueue::new(4, OverflowPolicy::DropOldest);
        queue.push(notification(1));
        queue.push(notification(2));

        assert_eq!(next_notification(&queue).await.sequence, 1);
        assert_eq!(next_notification(&queue).await.sequence, 2);

        queue.push(notification(3));
        assert_eq!(queue.close(), 1);
        assert!(queue.next().await.is_none());
        assert_eq!(queue.push(notification(4)), PushOutcome::Closed);
        assert!(!queue.push_error(Error::decode("a", "late")));
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let queue = Arc::new(DeliveryQueue::new(4, OverflowPolicy::DropOldest));
        let q = queue.clone();
        let waiter = tokio::spawn(async move { next_notification(&q).await.sequence });

        tokio::task::yield_now().await;
        queue.push(notification(9));
        assert_eq!(waiter.await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_drops_coalesce_into_one_report() {
        let queue = DeliveryQueue::new(2, OverflowPolicy::DropOldest);
        for seq in 1..=5 {
            queue.push(notification(seq));
        }
        assert_eq!(queue.dropped(), 3);

        match queue.next().await {
            Some(Delivery::Error(Error::QueueOverflow { dropped })) => assert_eq!(dropped, 3),
            other => panic!("expected an overflow report, got {:?}", other),
        }
        assert_eq!(next_notification(&queue).await.sequence, 4);
        assert_eq!(next_notification(&queue).await.sequence, 5);
    }

    #[test]
    fn test_error_backlog_is_bounded() {
        let queue = DeliveryQueue::new(1, OverflowPolicy::DropOldest);
        for i in 0..ERROR_BACKLOG + 10 {
            assert!(queue.push_error(Error::decode("a", format!("bad {}", i))));
        }
        assert_eq!(queue.inner.lock().errors.len(), ERROR_BACKLOG);
        let oldest = queue.inner.lock().errors.front().map(|e| e.to_string());
        assert!(oldest.unwrap().contains("bad 10"));
    }

    #[tokio::test]
    async fn test_feed_assigns_sequence_and_skips_malformed() {
        let hooks = Arc::new(Hooks::new());
        let errors = Arc::new(AtomicU64::new(0));
        let e = errors.clone();
        hooks.on_error(Arc::new(move |_: &Error| {
            e.fetch_add(1, Ordering::SeqCst);
        }));

        let dispatcher = NotificationDispatcher::new(
            &QueueConfig::default(),
            PayloadFormat::Text,
            hooks,
        );
        let events: EventStream = Box::pin(stream::iter(vec![
            Ok(RawEvent::new("a", "one")),
            Ok(RawEvent::new("", "no channel")),
            Ok(RawEvent::new("a", "two")),
            Err(Error::stream_terminated("eof")),
            Ok(RawEvent::new("a", "never read")),
        ]));

        let reason = dispatcher.feed(events).await;
        assert!(matches!(reason, Error::StreamTerminated { .. }));

        let stats = dispatcher.stats();
        assert_eq!(stats.received, 3);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.last_sequence, 2);
        assert_eq!(stats.queued, 2);
        // Reported by the delivery task, not by the read loop.
        assert_eq!(errors.load(Ordering::SeqCst), 0);

        match dispatcher.queue().next().await {
            Some(Delivery::Error(Error::Decode { .. })) => {}
            other => panic!("expected a decode report, got {:?}", other),
        }
        let first = next_notification(dispatcher.queue()).await;
        assert_eq!(first.payload_str(), Some("one"));
        assert_eq!(next_notification(dispatcher.queue()).await.sequence, 2);
    }

    #[tokio::test]
    async fn test_spawn_delivery_once() {
        let dispatcher = NotificationDispatcher::new(
            &QueueConfig::default(),
            PayloadFormat::Text,
            Arc::new(Hooks::new()),
        );
        let handle = dispatcher.spawn_delivery().unwrap();
        assert!(dispatcher.spawn_delivery().is_none());

        dispatcher.close();
        handle.await.unwrap();
    }
}
