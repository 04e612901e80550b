//! Peer presence state.

use huddle_protocol::{PeerStatus, ProtocolError, UserId};
use std::time::Duration;
use tokio::time::Instant;

/// Presence snapshot of one remote (or the local) identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Full user id as sent on the wire.
    pub user_id: String,
    /// Parsed identity parts.
    pub id: UserId,
    /// Current status.
    pub status: PeerStatus,
    /// How long the status holds without a heartbeat.
    pub status_timeout: Duration,
    /// When the status was last confirmed.
    pub last_status_time: Instant,
    /// When the last application message arrived.
    pub last_data_message_time: Option<Instant>,
}

impl Peer {
    /// Create a peer from its full user id.
    ///
    /// # Errors
    ///
    /// Returns an error if `user_id` is not a full user id.
    pub fn new(
        user_id: &str,
        status: PeerStatus,
        status_timeout: Duration,
        now: Instant,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            user_id: user_id.to_string(),
            id: UserId::parse(user_id)?,
            status,
            status_timeout,
            last_status_time: now,
            last_data_message_time: None,
        })
    }

    /// When the current status lapses; `None` if that is beyond the clock's
    /// range.
    #[must_use]
    pub fn status_expiration(&self) -> Option<Instant> {
        self.last_status_time.checked_add(self.status_timeout)
    }

    /// Whether the peer went silent past its timeout and is not yet Offline.
    #[must_use]
    pub fn is_expired(&self, now: Instant) -> bool {
        self.status != PeerStatus::Offline
            && self
                .status_expiration()
                .is_some_and(|expiration| now > expiration)
    }

    /// Confirm `status` at `now`.
    pub fn touch(&mut self, status: PeerStatus, now: Instant) {
        self.status = status;
        self.last_status_time = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_expiry() {
        let now = Instant::now();
        let mut peer = Peer::new(
            "mac1|alice+svc/acme/eng",
            PeerStatus::Online,
            Duration::from_secs(15),
            now,
        )
        .unwrap();

        assert_eq!(peer.id.user_name, "alice");
        assert!(!peer.is_expired(now + Duration::from_secs(15)));
        assert!(peer.is_expired(now + Duration::from_secs(16)));

        peer.touch(PeerStatus::Offline, now);
        assert!(!peer.is_expired(now + Duration::from_secs(60)));
    }

    #[test]
    fn test_unreachable_expiration_never_expires() {
        let now = Instant::now();
        let peer = Peer::new(
            "mac1|alice+svc/acme/eng",
            PeerStatus::Online,
            Duration::from_secs(u64::MAX),
            now,
        )
        .unwrap();

        assert_eq!(peer.status_expiration(), None);
        assert!(!peer.is_expired(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_peer_requires_full_id() {
        assert!(Peer::new(
            "alice+svc/acme/eng",
            PeerStatus::Online,
            Duration::from_secs(15),
            Instant::now()
        )
        .is_err());
    }
}
