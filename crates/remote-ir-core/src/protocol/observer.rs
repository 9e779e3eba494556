//! Connection state broadcast
//!
//! Any number of components can follow connect/disconnect transitions here
//! without touching the session's single listener slot.

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, warn};

/// Default number of undelivered notifications kept per subscriber
pub const DEFAULT_OBSERVER_BUFFER: usize = 16;

/// Broadcasts the device connection state to every subscriber
#[derive(Debug, Clone)]
pub struct ConnectionObservable {
    tx: broadcast::Sender<bool>,
}

impl ConnectionObservable {
    /// Create an observable keeping up to `buffer` notifications per subscriber
    pub fn new(buffer: usize) -> Self {
        let (tx, _) = broadcast::channel(buffer.max(1));
        Self { tx }
    }

    /// Start following connection transitions.
    ///
    /// Only notifications sent after this call are observed.
    pub fn subscribe(&self) -> ConnectionSubscription {
        debug!(
            subscribers = self.tx.receiver_count() + 1,
            "Added connection observer"
        );
        ConnectionSubscription {
            rx: self.tx.subscribe(),
        }
    }

    /// Send `connected` to every subscriber; returns how many were reached
    pub fn notify(&self, connected: bool) -> usize {
        self.tx.send(connected).unwrap_or(0)
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ConnectionObservable {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_BUFFER)
    }
}

/// One subscriber's view of the connection state
#[derive(Debug)]
pub struct ConnectionSubscription {
    rx: broadcast::Receiver<bool>,
}

impl ConnectionSubscription {
    /// Wait for the next notification. `None` once the observable is gone.
    ///
    /// A subscriber that falls behind skips the oldest notifications.
    pub async fn changed(&mut self) -> Option<bool> {
        loop {
            match self.rx.recv().await {
                Ok(connected) => return Some(connected),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Connection observer lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Blocking variant of [`changed`](Self::changed) for plain threads.
    ///
    /// Must not be called from within an async runtime.
    pub fn blocking_changed(&mut self) -> Option<bool> {
        loop {
            match self.rx.blocking_recv() {
                Ok(connected) => return Some(connected),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Connection observer lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next pending notification, if any, without waiting
    pub fn try_changed(&mut self) -> Option<bool> {
        loop {
            match self.rx.try_recv() {
                Ok(connected) => return Some(connected),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Connection observer lagged");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_reaches_every_subscriber() {
        let observable = ConnectionObservable::default();
        let mut a = observable.subscribe();
        let mut b = observable.subscribe();
        assert_eq!(observable.subscriber_count(), 2);

        assert_eq!(observable.notify(true), 2);
        assert_eq!(a.try_changed(), Some(true));
        assert_eq!(b.try_changed(), Some(true));
        assert_eq!(a.try_changed(), None);
    }

    #[test]
    fn test_no_deduplication() {
        let observable = ConnectionObservable::default();
        let mut sub = observable.subscribe();
        observable.notify(false);
        observable.notify(false);

        assert_eq!(sub.try_changed(), Some(false));
        assert_eq!(sub.try_changed(), Some(false));
    }

    #[test]
    fn test_notify_without_subscribers() {
        let observable = ConnectionObservable::default();
        assert_eq!(observable.notify(true), 0);
    }

    #[test]
    fn test_lagging_subscriber_keeps_latest() {
        let observable = ConnectionObservable::new(2);
        let mut sub = observable.subscribe();
        for connected in [true, false, true, false] {
            observable.notify(connected);
        }

        assert_eq!(sub.try_changed(), Some(true));
        assert_eq!(sub.try_changed(), Some(false));
        assert_eq!(sub.try_changed(), None);
    }

    #[tokio::test]
    async fn test_changed_ends_when_observable_dropped() {
        let observable = ConnectionObservable::default();
        let mut sub = observable.subscribe();
        observable.notify(true);
        drop(observable);

        assert_eq!(sub.changed().await, Some(true));
        assert_eq!(sub.changed().await, None);
    }
}
