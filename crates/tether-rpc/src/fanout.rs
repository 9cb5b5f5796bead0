//! Inbound multicast point.
//!
//! The connection's decoded stream is read once and published here. Each
//! subscriber owns a bounded queue (its own cursor) and an optional filter;
//! a full queue applies back-pressure to the publisher instead of losing
//! messages, and a subscriber whose receiver is gone is dropped.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

type Filter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    tx: mpsc::Sender<T>,
    filter: Option<Filter<T>>,
}

impl<T> Clone for Subscriber<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            tx: self.tx.clone(),
            filter: self.filter.clone(),
        }
    }
}

struct State<T> {
    next_id: u64,
    subscribers: Vec<Subscriber<T>>,
}

/// Publishes every item to every interested subscriber.
pub struct InboundFanout<T> {
    state: Mutex<State<T>>,
}

impl<T: Clone + Send + 'static> InboundFanout<T> {
    /// Fan-out with no subscribers.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_id: 0,
                subscribers: Vec::new(),
            }),
        }
    }

    /// Receive every item.
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<T> {
        self.add(capacity, None)
    }

    /// Receive the items `filter` accepts.
    pub fn subscribe_filtered<F>(&self, capacity: usize, filter: F) -> mpsc::Receiver<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.add(capacity, Some(Arc::new(filter)))
    }

    fn add(&self, capacity: usize, filter: Option<Filter<T>>) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.subscribers.push(Subscriber { id, tx, filter });
        rx
    }

    /// Deliver `item` to each matching subscriber, waiting for queue space.
    /// Returns how many subscribers received it.
    pub async fn publish(&self, item: T) -> usize {
        let subscribers = self.state.lock().subscribers.clone();
        let mut delivered = 0;
        let mut gone = Vec::new();
        for sub in &subscribers {
            if sub.filter.as_ref().is_some_and(|accept| !accept(&item)) {
                continue;
            }
            if sub.tx.send(item.clone()).await.is_ok() {
                delivered += 1;
            } else {
                gone.push(sub.id);
            }
        }
        if !gone.is_empty() {
            debug!(count = gone.len(), "dropping closed fan-out subscribers");
            self.state.lock().subscribers.retain(|s| !gone.contains(&s.id));
        }
        delivered
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.len()
    }

    /// Drop every subscriber, ending their streams.
    pub fn close(&self) {
        self.state.lock().subscribers.clear();
    }
}

impl<T: Clone + Send + 'static> Default for InboundFanout<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn every_subscriber_gets_every_item() {
        let fan = InboundFanout::new();
        let mut a = fan.subscribe(4);
        let mut b = fan.subscribe(4);
        assert_eq!(fan.publish(1).await, 2);
        assert_eq!(fan.publish(2).await, 2);
        assert_eq!((a.recv().await, a.recv().await), (Some(1), Some(2)));
        assert_eq!((b.recv().await, b.recv().await), (Some(1), Some(2)));
    }

    #[tokio::test]
    async fn filters_split_the_stream() {
        let fan = InboundFanout::new();
        let mut even = fan.subscribe_filtered(4, |n: &i32| n % 2 == 0);
        let mut odd = fan.subscribe_filtered(4, |n: &i32| n % 2 != 0);
        for n in 1..=4 {
            assert_eq!(fan.publish(n).await, 1);
        }
        assert_eq!(even.recv().await, Some(2));
        assert_eq!(even.recv().await, Some(4));
        assert_eq!(odd.recv().await, Some(1));
        assert_eq!(odd.recv().await, Some(3));
    }

    #[tokio::test]
    async fn closed_subscriber_removed() {
        let fan = InboundFanout::new();
        let keep = fan.subscribe(4);
        drop(fan.subscribe(4));
        assert_eq!(fan.publish("x").await, 1);
        assert_eq!(fan.subscriber_count(), 1);
        drop(keep);
    }

    #[tokio::test]
    async fn full_queue_applies_back_pressure() {
        let fan = Arc::new(InboundFanout::new());
        let mut rx = fan.subscribe(1);
        assert_eq!(fan.publish(1).await, 1);

        let fan2 = Arc::clone(&fan);
        let pending = tokio::spawn(async move { fan2.publish(2).await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(pending.await.unwrap(), 1);
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn close_ends_receivers() {
        let fan = InboundFanout::<u8>::new();
        let mut rx = fan.subscribe(1);
        fan.close();
        assert!(rx.recv().await.is_none());
    }
}
