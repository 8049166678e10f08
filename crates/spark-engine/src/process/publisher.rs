use std::sync::{
    atomic::{AtomicU64, Ordering},
    Mutex,
};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// One listener's view of a publisher. Dropping it (or calling
/// [`EventPublisher::unsubscribe`]) detaches the listener.
#[derive(Debug)]
pub struct Subscription<E> {
    id: SubscriptionId,
    rx: UnboundedReceiver<E>,
}

impl<E> Subscription<E> {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<E> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<E> {
        self.rx.try_recv().ok()
    }
}

/// Fan-out of events to any number of listeners. Every listener sees every
/// event emitted after it subscribed, in emission order.
#[derive(Debug)]
pub struct EventPublisher<E> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, UnboundedSender<E>)>>,
}

impl<E> Default for EventPublisher<E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<E: Clone> EventPublisher<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Subscription<E> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push((id, tx));
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.lock();
        let before = subs.len();
        subs.retain(|(sid, _)| *sid != id);
        subs.len() != before
    }

    /// Returns the number of listeners reached. Listeners whose receiving end
    /// is gone are pruned.
    pub fn emit(&self, event: E) -> usize {
        let mut subs = self.lock();
        subs.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        subs.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(SubscriptionId, UnboundedSender<E>)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_events_in_order() {
        let p = EventPublisher::new();
        let mut a = p.subscribe();
        let mut b = p.subscribe();
        assert_eq!(p.emit(1), 2);
        assert_eq!(p.emit(2), 2);
        assert_eq!((a.try_recv(), a.try_recv()), (Some(1), Some(2)));
        assert_eq!((b.try_recv(), b.try_recv()), (Some(1), Some(2)));
    }

    #[test]
    fn unsubscribed_and_dropped_listeners_stop_receiving() {
        let p = EventPublisher::new();
        let mut a = p.subscribe();
        let b = p.subscribe();
        assert!(p.unsubscribe(a.id()));
        assert!(!p.unsubscribe(a.id()));
        drop(b);
        assert_eq!(p.emit("x"), 0);
        assert_eq!(p.subscriber_count(), 0);
        assert_eq!(a.try_recv(), None);
    }
}
