//! Broadcaster fanning published records out to live subscriptions.

use crate::config::FeedConfig;
use crate::types::Record;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::types::{FeedMessage, Subscription, SubscriptionId};

/// Default per-subscriber queue capacity.
const DEFAULT_CAPACITY: usize = 256;

/// Registry-side state of one subscription.
struct Slot {
    sender: Sender<FeedMessage>,
    /// Second handle on the queue, used to evict the oldest message.
    evict: Receiver<FeedMessage>,
    dropped: Arc<AtomicU64>,
}

impl Slot {
    /// Enqueue without blocking, evicting the oldest message if full.
    /// Returns the number of messages evicted.
    fn deliver(&self, message: FeedMessage) -> u64 {
        let mut message = message;
        let mut evicted = 0;
        loop {
            match self.sender.try_send(message) {
                Ok(()) => break,
                Err(TrySendError::Full(m)) => {
                    // The subscriber may have drained concurrently; only count
                    // what we actually removed.
                    if self.evict.try_recv().is_ok() {
                        evicted += 1;
                    }
                    message = m;
                }
                // Unreachable while `evict` is alive.
                Err(TrySendError::Disconnected(_)) => break,
            }
        }
        if evicted > 0 {
            self.dropped.fetch_add(evicted, Ordering::Relaxed);
        }
        evicted
    }
}

/// Shared subscription registry.
pub(crate) struct Registry {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, Slot>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Default queue capacity for new subscriptions.
    capacity: usize,
    /// Serializes publishes so every subscriber sees the same order.
    publish_lock: Mutex<()>,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl Registry {
    pub(crate) fn remove(&self, id: SubscriptionId) -> bool {
        let removed = self.subscriptions.write().remove(&id).is_some();
        if removed {
            tracing::debug!(subscription = %id, "Subscriber removed");
        }
        removed
    }
}

/// Fan-out point for created records.
///
/// Every subscription owns a bounded queue. `publish` never blocks: when a
/// queue is full its oldest undelivered message is dropped, so a stalled
/// subscriber only loses its own backlog. Subscribers see records in publish
/// order and only those published after they subscribed.
///
/// Clones share the same registry.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<Registry>,
}

impl Broadcaster {
    /// Create a broadcaster whose subscriptions queue up to `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                subscriptions: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                publish_lock: Mutex::new(()),
                published: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &FeedConfig) -> Self {
        Self::new(config.subscriber_capacity)
    }

    /// Register a new subscription with the default capacity.
    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(self.registry.capacity)
    }

    /// Register a new subscription with its own queue capacity.
    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let id = SubscriptionId(self.registry.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(capacity.max(1));
        let dropped = Arc::new(AtomicU64::new(0));

        let slot = Slot {
            sender,
            evict: receiver.clone(),
            dropped: Arc::clone(&dropped),
        };

        let count = {
            let mut subs = self.registry.subscriptions.write();
            subs.insert(id, slot);
            subs.len()
        };

        tracing::debug!(subscription = %id, subscribers = count, "Subscriber added");

        Subscription {
            id,
            receiver,
            dropped,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.remove(id)
    }

    /// Deliver a record to every current subscription.
    pub fn publish(&self, record: Record) {
        let _order = self.registry.publish_lock.lock();
        let message = FeedMessage::RecordCreated { record };

        let mut evicted = 0;
        let receivers = {
            let subs = self.registry.subscriptions.read();
            for (id, slot) in subs.iter() {
                let n = slot.deliver(message.clone());
                if n > 0 {
                    tracing::debug!(
                        subscription = %id,
                        dropped = n,
                        "Subscriber queue full, dropped oldest"
                    );
                    evicted += n;
                }
            }
            subs.len()
        };

        self.registry.published.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.registry.dropped.fetch_add(evicted, Ordering::Relaxed);
        }

        tracing::trace!(receivers = receivers, "Record published");
    }

    /// Get subscription count.
    pub fn subscriber_count(&self) -> usize {
        self.registry.subscriptions.read().len()
    }

    /// Records published so far.
    pub fn published_count(&self) -> u64 {
        self.registry.published.load(Ordering::Relaxed)
    }

    /// Messages dropped across all subscribers for lagging.
    pub fn dropped_count(&self) -> u64 {
        self.registry.dropped.load(Ordering::Relaxed)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NewRecord, Sequence};
    use std::thread;
    use std::time::Duration;

    fn make_test_record(n: u64) -> Record {
        NewRecord::new("Admin", format!("post {}", n))
            .with_id(n.to_string())
            .with_content("body")
            .into_record(Sequence(n))
            .unwrap()
    }

    fn titles(subscription: &Subscription) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(message) = subscription.try_recv() {
            out.push(message.record().title.clone());
        }
        out
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let broadcaster = Broadcaster::default();

        let subscription = broadcaster.subscribe();
        assert_eq!(broadcaster.subscriber_count(), 1);

        assert!(broadcaster.unsubscribe(subscription.id()));
        assert_eq!(broadcaster.subscriber_count(), 0);

        // Idempotent
        assert!(!broadcaster.unsubscribe(subscription.id()));
        subscription.unsubscribe();
    }

    #[test]
    fn test_drop_unsubscribes() {
        let broadcaster = Broadcaster::default();
        let subscription = broadcaster.subscribe();
        drop(subscription);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_publish_reaches_every_subscriber_in_order() {
        let broadcaster = Broadcaster::default();
        let a = broadcaster.subscribe();
        let b = broadcaster.subscribe();

        for n in 1..=5 {
            broadcaster.publish(make_test_record(n));
        }

        let expected: Vec<_> = (1..=5).map(|n| format!("post {}", n)).collect();
        assert_eq!(titles(&a), expected);
        assert_eq!(titles(&b), expected);
        assert_eq!(broadcaster.published_count(), 5);
    }

    #[test]
    fn test_no_backfill_for_late_subscriber() {
        let broadcaster = Broadcaster::default();
        broadcaster.publish(make_test_record(1));
        broadcaster.publish(make_test_record(2));

        let late = broadcaster.subscribe();
        assert!(late.try_recv().is_err());

        broadcaster.publish(make_test_record(3));
        assert_eq!(titles(&late), vec!["post 3".to_string()]);
    }

    #[test]
    fn test_full_queue_drops_oldest() {
        let broadcaster = Broadcaster::new(3);
        let slow = broadcaster.subscribe();

        for n in 1..=10 {
            broadcaster.publish(make_test_record(n));
        }

        // Still registered, holding the newest three.
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(titles(&slow), vec!["post 8", "post 9", "post 10"]);
        assert_eq!(slow.dropped(), 7);
        assert_eq!(broadcaster.dropped_count(), 7);
    }

    #[test]
    fn test_slow_subscriber_isolated() {
        let broadcaster = Broadcaster::new(100);
        let stalled = broadcaster.subscribe_with_capacity(1);
        let healthy = broadcaster.subscribe();

        for n in 1..=50 {
            broadcaster.publish(make_test_record(n));
        }

        assert_eq!(titles(&healthy).len(), 50);
        assert_eq!(healthy.dropped(), 0);
        assert_eq!(stalled.dropped(), 49);
    }

    #[test]
    fn test_unsubscribed_receiver_drains_then_disconnects() {
        let broadcaster = Broadcaster::default();
        let subscription = broadcaster.subscribe();
        broadcaster.publish(make_test_record(1));
        subscription.unsubscribe();
        broadcaster.publish(make_test_record(2));

        assert_eq!(subscription.recv().unwrap().record().title, "post 1");
        assert!(subscription.recv().is_err());
    }

    #[test]
    fn test_concurrent_subscribe_during_publish() {
        let broadcaster = Broadcaster::new(1024);
        let watcher = broadcaster.subscribe();

        let publisher = {
            let broadcaster = broadcaster.clone();
            thread::spawn(move || {
                for n in 1..=200 {
                    broadcaster.publish(make_test_record(n));
                }
            })
        };

        let churn = {
            let broadcaster = broadcaster.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let s = broadcaster.subscribe();
                    thread::sleep(Duration::from_micros(50));
                    drop(s);
                }
            })
        };

        publisher.join().unwrap();
        churn.join().unwrap();

        let expected: Vec<_> = (1..=200).map(|n| format!("post {}", n)).collect();
        assert_eq!(titles(&watcher), expected);
        assert_eq!(broadcaster.subscriber_count(), 1);
    }
}
