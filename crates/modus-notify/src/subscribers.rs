use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Default capacity of a subscriber queue.
///
/// Events published to a full queue are dropped and the subscription is
/// marked lagged, see [`Subscription::take_lagged`].
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Token identifying a subscription, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct Subscription<E> {
    id: SubscriptionId,
    events: mpsc::Receiver<E>,
    lagged: Arc<AtomicBool>,
}

impl<E> Subscription<E> {
    /// Returns the token to pass to `unsubscribe`.
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Waits for the next event. Returns `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<E> {
        self.events.recv().await
    }

    /// Returns the next queued event without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        self.events.try_recv().ok()
    }

    /// Returns whether events were dropped since the last call because the
    /// queue was full, and clears the flag.
    ///
    /// A subscriber that sees `true` has missed changes and must re-read the
    /// state it mirrors.
    pub fn take_lagged(&mut self) -> bool {
        self.lagged.swap(false, Ordering::AcqRel)
    }

    /// Returns every queued event without waiting.
    pub fn drain(&mut self) -> Vec<E> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

#[derive(Debug)]
pub(crate) struct Subscribers<E> {
    topic: &'static str,
    capacity: usize,
    next_id: u64,
    senders: Vec<Subscriber<E>>,
}

#[derive(Debug)]
struct Subscriber<E> {
    id: SubscriptionId,
    sender: mpsc::Sender<E>,
    lagged: Arc<AtomicBool>,
}

impl<E: Clone + std::fmt::Debug> Subscribers<E> {
    pub(crate) fn new(topic: &'static str, capacity: usize) -> Self {
        Self {
            topic,
            capacity: capacity.max(1),
            next_id: 1,
            senders: Vec::new(),
        }
    }

    pub(crate) fn subscribe(&mut self) -> Subscription<E> {
        let id = SubscriptionId(self.next_id);
        self.next_id = self.next_id.saturating_add(1);

        let (sender, events) = mpsc::channel(self.capacity);
        let lagged = Arc::new(AtomicBool::new(false));
        self.senders.push(Subscriber {
            id,
            sender,
            lagged: Arc::clone(&lagged),
        });
        debug!(topic = self.topic, subscription = id.0, "subscriber added");

        Subscription { id, events, lagged }
    }

    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.senders.len();
        self.senders.retain(|subscriber| subscriber.id != id);
        before != self.senders.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.senders.len()
    }

    pub(crate) fn publish(&mut self, event: E) {
        debug!(topic = self.topic, ?event, "publishing event");
        let topic = self.topic;
        self.senders
            .retain(|subscriber| match subscriber.sender.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        topic,
                        subscription = subscriber.id.0,
                        "subscriber queue full; dropping event"
                    );
                    subscriber.lagged.store(true, Ordering::Release);
                    true
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(topic, subscription = subscriber.id.0, "subscriber dropped");
                    false
                }
            });
    }
}
