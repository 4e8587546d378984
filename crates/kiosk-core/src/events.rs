//! Event fan-out to observers.
//!
//! The broadcaster wraps a bounded [`tokio::sync::broadcast`] channel.
//! Publishing never blocks: a subscriber that falls behind loses the oldest
//! events and is told how many it missed the next time it receives. There is
//! no replay; a new subscriber only sees events published after it joined.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use kiosk_types::KioskEvent;

/// Sender for kiosk events.
pub type EventSender = broadcast::Sender<KioskEvent>;

/// Raw receiver for kiosk events.
pub type EventReceiver = broadcast::Receiver<KioskEvent>;

/// Default channel capacity.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Fan-out of [`KioskEvent`]s to any number of subscribers.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: EventSender,
}

impl EventBroadcaster {
    /// Create a new broadcaster with the given per-subscriber buffer.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            missed: 0,
        }
    }

    /// Publish an event to every current subscriber.
    pub fn publish(&self, event: KioskEvent) {
        let kind = event.event_type();
        match self.sender.send(event) {
            Ok(n) => debug!("Published {} to {} subscriber(s)", kind, n),
            // No receivers; nothing to do
            Err(_) => debug!("Published {} with no subscribers", kind),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get the sender for direct use.
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

/// One subscriber's view of the event stream.
#[derive(Debug)]
pub struct Subscription {
    receiver: EventReceiver,
    missed: u64,
}

impl Subscription {
    /// Wait for the next event.
    ///
    /// Lag is absorbed: when the subscriber fell behind, the skipped count is
    /// added to [`Subscription::missed`] and the oldest retained event is
    /// returned. `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<KioskEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("Event subscriber lagged, {} event(s) dropped", n);
                    self.missed += n;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Take the next event without waiting.
    pub fn try_recv(&mut self) -> Option<KioskEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(n)) => self.missed += n,
                Err(_) => return None,
            }
        }
    }

    /// Total number of events this subscriber has missed through lag.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    /// Unwrap into the raw broadcast receiver.
    pub fn into_inner(self) -> EventReceiver {
        self.receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiosk_types::IdentityEvent;

    fn tap(token: &str) -> KioskEvent {
        KioskEvent::identity(IdentityEvent::rejected_unknown(token))
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let events = EventBroadcaster::new(4);
        events.publish(tap("A"));
        assert_eq!(events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_every_subscriber_receives() {
        let events = EventBroadcaster::new(4);
        let mut a = events.subscribe();
        let mut b = events.subscribe();
        assert_eq!(events.subscriber_count(), 2);

        events.publish(tap("A"));

        assert_eq!(a.recv().await.unwrap().event_type(), "identity_event");
        assert_eq!(b.recv().await.unwrap().event_type(), "identity_event");
    }

    #[tokio::test]
    async fn test_lagging_subscriber_drops_oldest() {
        let events = EventBroadcaster::new(2);
        let mut slow = events.subscribe();

        for token in ["A", "B", "C", "D"] {
            events.publish(tap(token));
        }

        let first = slow.recv().await.unwrap();
        match first {
            KioskEvent::Identity { payload, .. } => assert_eq!(payload.token_id, "C"),
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(slow.missed(), 2);
    }

    #[tokio::test]
    async fn test_dropped_subscriber_disappears() {
        let events = EventBroadcaster::new(2);
        let sub = events.subscribe();
        assert_eq!(events.subscriber_count(), 1);
        drop(sub);
        assert_eq!(events.subscriber_count(), 0);
        events.publish(tap("A"));
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscriber() {
        let events = EventBroadcaster::new(4);
        let _early = events.subscribe();
        events.publish(tap("A"));

        let mut late = events.subscribe();
        assert!(late.try_recv().is_none());
    }
}
