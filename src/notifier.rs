//! Fan-out bus for ledger changes and price ticks. Each subscriber gets its
//! own bounded queue; publishing never blocks the writer path, and a
//! subscriber that stops draining is evicted instead of backpressuring the
//! rest.

use crate::types::OutboundEvent;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

pub struct ChangeNotifier {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<OutboundEvent>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Receiver half of one subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    pub rx: mpsc::Receiver<OutboundEvent>,
    notifier: Weak<ChangeNotifier>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<OutboundEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(notifier) = self.notifier.upgrade() {
            notifier.unsubscribe(self.id);
        }
    }
}

impl ChangeNotifier {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity,
        })
    }

    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("subscriber map poisoned")
            .insert(id, tx);
        debug!("[Notifier] Subscriber {} connected", id);
        Subscription {
            id,
            rx,
            notifier: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("subscriber map poisoned")
            .remove(&id);
        debug!("[Notifier] Subscriber {} disconnected", id);
    }

    /// Enqueue for every live subscriber. Never awaits: a full queue means
    /// the subscriber is too slow and it is evicted on the spot.
    pub fn publish(&self, event: OutboundEvent) {
        let mut subs = self.subscribers.lock().expect("subscriber map poisoned");
        subs.retain(|id, tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("[Notifier] Evicting slow subscriber {}", id);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("subscriber map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TickerAggregate;

    fn mention_event(ticker: &str) -> OutboundEvent {
        OutboundEvent::TickerMentionUpdate {
            ticker: ticker.into(),
            aggregate: TickerAggregate {
                ticker: ticker.into(),
                mention_count: 1,
                unique_author_count: 1,
                first_mention: None,
                last_mention_at: None,
            },
            confidence: 0.9,
            correction: false,
        }
    }

    fn tick(symbol: &str) -> OutboundEvent {
        OutboundEvent::PriceTick {
            symbol: symbol.into(),
            price: 123.45,
            timestamp: 1,
        }
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let notifier = ChangeNotifier::new(DEFAULT_SUBSCRIBER_CAPACITY);
        let mut a = notifier.subscribe();
        let mut b = notifier.subscribe();

        notifier.publish(mention_event("TSLA"));
        notifier.publish(tick("TSLA"));

        for sub in [&mut a, &mut b] {
            assert!(matches!(
                sub.recv().await,
                Some(OutboundEvent::TickerMentionUpdate { .. })
            ));
            assert!(matches!(sub.recv().await, Some(OutboundEvent::PriceTick { .. })));
        }
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_without_hurting_others() {
        let notifier = ChangeNotifier::new(1);
        let _slow = notifier.subscribe(); // never drained
        let mut live = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 2);

        notifier.publish(tick("AAPL"));
        assert!(matches!(live.recv().await, Some(OutboundEvent::PriceTick { .. })));

        notifier.publish(tick("AAPL")); // overflows the slow queue
        assert_eq!(notifier.subscriber_count(), 1);
        assert!(matches!(live.recv().await, Some(OutboundEvent::PriceTick { .. })));
    }

    #[tokio::test]
    async fn dropping_a_subscription_unsubscribes() {
        let notifier = ChangeNotifier::new(DEFAULT_SUBSCRIBER_CAPACITY);
        let sub = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);
        drop(sub);
        assert_eq!(notifier.subscriber_count(), 0);
    }
}
