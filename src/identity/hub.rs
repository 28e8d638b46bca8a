//! Push-notification plumbing for identity changes.
//!
//! ARCHITECTURE
//! ============
//! Each subscriber owns an unbounded mpsc receiver; the hub keeps the
//! matching senders keyed by subscription id. Session changes are rare and
//! must never be dropped, so the channels are unbounded.
//!
//! A [`Subscription`] removes its sender from the hub when unsubscribed or
//! dropped, whichever happens first. Removal happens once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tokio::sync::mpsc;
use tracing::debug;

use super::Identity;

/// A session change: the new identity, or `None` after sign-out.
pub type IdentityEvent = Option<Arc<Identity>>;

#[derive(Default)]
struct HubInner {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::UnboundedSender<IdentityEvent>>,
}

/// Fan-out of identity events to live subscriptions.
#[derive(Clone, Default)]
pub struct SubscriberHub {
    inner: Arc<Mutex<HubInner>>,
}

impl SubscriberHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber and deliver `current` to it immediately.
    #[must_use]
    pub fn subscribe(&self, current: IdentityEvent) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(current).is_err() {
            debug!("initial identity event not delivered");
        }

        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.insert(id, tx);
        debug!(subscription = id, live = inner.subscribers.len(), "identity subscription opened");

        Subscription { id, events: rx, hub: Arc::downgrade(&self.inner), released: false }
    }

    /// Deliver `event` to every live subscriber, pruning closed ones.
    pub fn publish(&self, event: &IdentityEvent) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner
            .subscribers
            .retain(|_, tx| tx.send(event.clone()).is_ok());
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .subscribers
            .len()
    }
}

/// Receiving end of a hub registration.
pub struct Subscription {
    id: u64,
    events: mpsc::UnboundedReceiver<IdentityEvent>,
    hub: Weak<Mutex<HubInner>>,
    released: bool,
}

impl Subscription {
    /// Wait for the next session change. `None` once the source is gone.
    pub async fn next(&mut self) -> Option<IdentityEvent> {
        self.events.recv().await
    }

    /// Stop receiving events and release the hub registration.
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.events.close();
        if let Some(hub) = self.hub.upgrade() {
            let mut inner = hub.lock().unwrap_or_else(PoisonError::into_inner);
            inner.subscribers.remove(&self.id);
            debug!(subscription = self.id, live = inner.subscribers.len(), "identity subscription released");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
#[path = "hub_test.rs"]
mod tests;
