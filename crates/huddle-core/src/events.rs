//! Client event fan-out.
//!
//! Every subscriber gets its own unbounded receiver and sees every event
//! exactly once, in the order events were raised.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::ClientError;
use crate::peer::Peer;

/// Notifications raised by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A session was established.
    Connected,

    /// The session ended.
    Disconnected {
        /// `true` when the hub closed the link rather than the caller.
        abnormal: bool,
        /// Close reason reported by the hub, if any.
        reason: Option<String>,
    },

    /// A peer was seen for the first time.
    NewPeer(Peer),

    /// A known peer's status changed.
    PeerStatusChanged(Peer),

    /// An application message from a known peer.
    Message {
        /// Full user id of the sender.
        sender_id: String,
        /// Application message type.
        message_type: String,
        /// Payload as sent.
        payload: String,
    },

    /// A background operation failed.
    RequestFailed(Arc<ClientError>),
}

type Subscribers = Vec<mpsc::UnboundedSender<ClientEvent>>;

/// Broadcasts [`ClientEvent`]s to all subscribers.
#[derive(Debug, Clone, Default)]
pub struct EventHub {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl EventHub {
    /// Create an event hub without subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to all future events.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Raise an event. Subscribers that dropped their receiver are removed.
    pub fn emit(&self, event: ClientEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Report a background failure.
    ///
    /// Cancellation is expected during teardown and is not reported.
    pub fn report(&self, error: ClientError) {
        if error.is_cancelled() {
            return;
        }
        warn!(error = %error, "Request failed");
        self.emit(ClientEvent::RequestFailed(Arc::new(error)));
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Subscribers> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_subscriber_sees_every_event() {
        let hub = EventHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.emit(ClientEvent::Connected);
        hub.emit(ClientEvent::Disconnected {
            abnormal: false,
            reason: None,
        });

        for rx in [&mut first, &mut second] {
            assert!(matches!(rx.try_recv(), Ok(ClientEvent::Connected)));
            assert!(matches!(
                rx.try_recv(),
                Ok(ClientEvent::Disconnected { abnormal: false, .. })
            ));
            assert!(rx.try_recv().is_err());
        }
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let hub = EventHub::new();
        let rx = hub.subscribe();
        let _kept = hub.subscribe();
        drop(rx);

        hub.emit(ClientEvent::Connected);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[test]
    fn test_cancellation_is_not_reported() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();

        hub.report(ClientError::Cancelled);
        assert!(rx.try_recv().is_err());

        hub.report(ClientError::NotConnected);
        assert!(matches!(rx.try_recv(), Ok(ClientEvent::RequestFailed(_))));
    }
}
