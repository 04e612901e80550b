//! Peer presence protocol.
//!
//! Peers discover each other by broadcasting `I_AM_HERE` to their team
//! group; everyone who hears it answers with a direct `HELLO` carrying their
//! own status. Each peer then keeps its status alive with `STILL_HERE`
//! heartbeats and says `I_AM_OUTTA_HERE` on the way out. A peer that stays
//! silent past its announced timeout is marked Offline by the sweep.

use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use huddle_protocol::signal::{self, PeerStatus, SignalKind};
use huddle_protocol::Envelope;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::SELF_STATUS_MARGIN;
use crate::error::ClientError;
use crate::events::{ClientEvent, EventHub};
use crate::message::{send_important, MessageSink, OutboundMessage};
use crate::metrics;
use crate::peer::Peer;

/// Presence registry and protocol handler for one session.
pub struct PresenceTracker {
    me: RwLock<Peer>,
    peers: DashMap<String, Peer>,
    /// Unknown peers whose handshake `HELLO` is still being sent.
    handshakes: DashSet<String>,
    sink: Arc<dyn MessageSink>,
    events: EventHub,
    important_tries: u32,
    cancel: CancellationToken,
}

impl PresenceTracker {
    /// Create a tracker for the local peer `me`.
    #[must_use]
    pub fn new(
        me: Peer,
        sink: Arc<dyn MessageSink>,
        events: EventHub,
        important_tries: u32,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            me: RwLock::new(me),
            peers: DashMap::new(),
            handshakes: DashSet::new(),
            sink,
            events,
            important_tries,
            cancel,
        }
    }

    /// Snapshot of the local peer.
    #[must_use]
    pub fn me(&self) -> Peer {
        self.me.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// The team group every peer of this session belongs to.
    #[must_use]
    pub fn everyone(&self) -> String {
        self.me
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .id
            .team_group_id()
    }

    /// Snapshots of all known peers.
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.iter().map(|peer| peer.value().clone()).collect()
    }

    /// Snapshot of one peer.
    #[must_use]
    pub fn peer(&self, user_id: &str) -> Option<Peer> {
        self.peers.get(user_id).map(|peer| peer.value().clone())
    }

    /// Number of handshakes in flight.
    #[must_use]
    pub fn pending_handshakes(&self) -> usize {
        self.handshakes.len()
    }

    /// Forget all peers.
    pub fn clear(&self) {
        self.peers.clear();
        self.handshakes.clear();
        metrics::set_peers_known(0);
    }

    /// Process one inbound envelope received at `now`.
    pub fn handle(self: &Arc<Self>, envelope: &Envelope, now: Instant) {
        if self.cancel.is_cancelled() {
            return;
        }

        let me = self.me();
        if envelope.sender_id == me.user_id {
            trace!("Ignoring own message");
            return;
        }

        match SignalKind::from_message_type(&envelope.message_type) {
            Some(SignalKind::IAmHere) => self.on_i_am_here(envelope, &me, now),
            Some(SignalKind::Hello) => self.on_hello(envelope, now),
            Some(SignalKind::IAmOuttaHere) => self.on_outta_here(envelope),
            Some(SignalKind::StillHere) => self.on_still_here(envelope, now),
            None => self.on_data(envelope, now),
        }
    }

    fn on_i_am_here(self: &Arc<Self>, envelope: &Envelope, me: &Peer, now: Instant) {
        let timeout = match signal::parse_i_am_here(&envelope.payload) {
            Ok(secs) => Duration::from_secs(secs),
            Err(e) => return self.events.report(e.into()),
        };
        let sender = &envelope.sender_id;

        let resurrected = self.peers.get_mut(sender).map(|mut peer| {
            peer.touch(PeerStatus::Online, now);
            peer.status_timeout = timeout;
            peer.value().clone()
        });

        if let Some(peer) = resurrected {
            debug!(peer = %sender, "Known peer announced itself");
            self.events.emit(ClientEvent::PeerStatusChanged(peer));
            self.spawn_hello(sender.clone(), me, None);
            return;
        }

        if !self.handshakes.insert(sender.clone()) {
            debug!(peer = %sender, "Handshake already in flight");
            return;
        }

        match Peer::new(sender, PeerStatus::Online, timeout, now) {
            Ok(peer) => self.spawn_hello(sender.clone(), me, Some(peer)),
            Err(e) => {
                self.handshakes.remove(sender);
                self.events.report(e.into());
            }
        }
    }

    /// Reply `HELLO` to `recipient`, then register `peer` if given.
    fn spawn_hello(self: &Arc<Self>, recipient: String, me: &Peer, peer: Option<Peer>) {
        let hello = OutboundMessage::to_user(
            recipient.as_str(),
            SignalKind::Hello.as_str(),
            signal::encode_hello(me.status_timeout.as_secs(), me.status),
        )
        .json();
        let tracker = self.clone();

        tokio::spawn(async move {
            if let Err(e) = send_important(tracker.sink.as_ref(), &hello, tracker.important_tries).await
            {
                tracker.events.report(e);
            }

            if let Some(peer) = peer {
                if !tracker.cancel.is_cancelled() {
                    tracker.register(peer);
                }
                tracker.handshakes.remove(&recipient);
            }
        });
    }

    fn on_hello(&self, envelope: &Envelope, now: Instant) {
        let (secs, status) = match signal::parse_hello(&envelope.payload) {
            Ok(hello) => hello,
            Err(e) => return self.events.report(e.into()),
        };
        let timeout = Duration::from_secs(secs);
        let sender = &envelope.sender_id;

        let updated = self.peers.get_mut(sender).map(|mut peer| {
            peer.touch(status, now);
            peer.status_timeout = timeout;
            peer.value().clone()
        });

        match updated {
            Some(peer) => self.events.emit(ClientEvent::PeerStatusChanged(peer)),
            None => match Peer::new(sender, status, timeout, now) {
                Ok(peer) => self.register(peer),
                Err(e) => self.events.report(e.into()),
            },
        }
    }

    fn on_outta_here(&self, envelope: &Envelope) {
        let updated = self.peers.get_mut(&envelope.sender_id).map(|mut peer| {
            peer.status = PeerStatus::Offline;
            peer.value().clone()
        });

        if let Some(peer) = updated {
            info!(peer = %peer.user_id, "Peer left");
            self.events.emit(ClientEvent::PeerStatusChanged(peer));
        }
    }

    fn on_still_here(&self, envelope: &Envelope, now: Instant) {
        if !self.peers.contains_key(&envelope.sender_id) {
            trace!(peer = %envelope.sender_id, "Heartbeat from unknown peer");
            return;
        }

        let status = match signal::parse_still_here(&envelope.payload) {
            Ok(status) => status,
            Err(e) => return self.events.report(e.into()),
        };

        let changed = self
            .peers
            .get_mut(&envelope.sender_id)
            .and_then(|mut peer| {
                let previous = peer.status;
                peer.touch(status, now);
                peer.last_data_message_time = Some(now);
                (previous != status).then(|| peer.value().clone())
            });

        if let Some(peer) = changed {
            self.events.emit(ClientEvent::PeerStatusChanged(peer));
        }
    }

    fn on_data(&self, envelope: &Envelope, now: Instant) {
        let known = self
            .peers
            .get_mut(&envelope.sender_id)
            .map(|mut peer| {
                peer.last_data_message_time = Some(now);
                peer.last_status_time = now;
            })
            .is_some();

        if !known {
            debug!(
                peer = %envelope.sender_id,
                message_type = %envelope.message_type,
                "Dropping message from unknown peer"
            );
            return;
        }

        self.events.emit(ClientEvent::Message {
            sender_id: envelope.sender_id.clone(),
            message_type: envelope.message_type.clone(),
            payload: envelope.payload.clone(),
        });
    }

    fn register(&self, peer: Peer) {
        let inserted = match self.peers.entry(peer.user_id.clone()) {
            Entry::Vacant(entry) => {
                entry.insert(peer.clone());
                true
            }
            Entry::Occupied(_) => false,
        };

        if inserted {
            metrics::set_peers_known(self.peers.len());
            info!(peer = %peer.user_id, status = %peer.status, "New peer");
            self.events.emit(ClientEvent::NewPeer(peer));
        }
    }

    /// Broadcast `I_AM_HERE` to the team.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error.
    pub async fn announce(&self) -> Result<(), ClientError> {
        let me = self.me();
        let message = OutboundMessage::to_group(
            me.id.team_group_id(),
            SignalKind::IAmHere.as_str(),
            signal::encode_i_am_here(me.status_timeout.as_secs()),
        )
        .json();
        send_important(self.sink.as_ref(), &message, self.important_tries).await
    }

    /// Broadcast `I_AM_OUTTA_HERE` to the team.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error.
    pub async fn quit(&self) -> Result<(), ClientError> {
        let message =
            OutboundMessage::to_group(self.everyone(), SignalKind::IAmOuttaHere.as_str(), "")
                .json();
        send_important(self.sink.as_ref(), &message, self.important_tries).await
    }

    /// Change the local status and broadcast it.
    ///
    /// # Errors
    ///
    /// Returns the send error; the local status is updated regardless.
    pub async fn set_status(&self, status: PeerStatus, now: Instant) -> Result<(), ClientError> {
        self.me
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .touch(status, now);
        self.sink.deliver(&self.still_here(status)).await
    }

    /// Expire silent peers and keep the local status alive.
    pub async fn sweep(&self, now: Instant) {
        for peer in self.expire(now) {
            info!(peer = %peer.user_id, "Peer timed out");
            self.events.emit(ClientEvent::PeerStatusChanged(peer));
        }

        if let Some(status) = self.heartbeat_due(now) {
            trace!(status = %status, "Sending heartbeat");
            if let Err(e) = self.sink.deliver(&self.still_here(status)).await {
                self.events.report(e);
            }
        }
    }

    fn expire(&self, now: Instant) -> Vec<Peer> {
        let mut expired = Vec::new();
        for mut peer in self.peers.iter_mut() {
            if peer.is_expired(now) {
                peer.status = PeerStatus::Offline;
                expired.push(peer.value().clone());
            }
        }
        expired
    }

    /// Claims the heartbeat if `me` is within the margin of its expiration.
    fn heartbeat_due(&self, now: Instant) -> Option<PeerStatus> {
        let mut me = self.me.write().unwrap_or_else(PoisonError::into_inner);
        let due = match (now.checked_add(SELF_STATUS_MARGIN), me.status_expiration()) {
            (Some(deadline), Some(expiration)) => deadline >= expiration,
            _ => false,
        };
        if due {
            me.last_status_time = now;
            Some(me.status)
        } else {
            None
        }
    }

    fn still_here(&self, status: PeerStatus) -> OutboundMessage {
        OutboundMessage::to_group(
            self.everyone(),
            SignalKind::StillHere.as_str(),
            status.as_str(),
        )
        .json()
    }
}
