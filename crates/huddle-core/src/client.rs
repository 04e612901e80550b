//! Session lifecycle.
//!
//! A [`SignalClient`] owns at most one session at a time. A session bundles
//! everything that lives exactly as long as one hub link: the transport pool,
//! the token manager, the presence registry and the elastic queue, all tied
//! to one cancellation token. Tearing the session down trips the token and
//! drops the whole bundle.

use arc_swap::ArcSwapOption;
use huddle_protocol::identity::{can_send_message, is_valid_component};
use huddle_protocol::negotiate::{headers, paths};
use huddle_protocol::{HubMessage, NegotiateResponse, PeerStatus};
use huddle_transport::{
    BackendFactory, HttpRequest, HubConnector, HubLink, ReqwestFactory, TransportPool,
    WebSocketHubConnector,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::action::MessageAction;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::events::{ClientEvent, EventHub};
use crate::message::{send_important, MessageSink, OutboundMessage};
use crate::messenger::HttpMessenger;
use crate::peer::Peer;
use crate::presence::PresenceTracker;
use crate::queue::ElasticQueue;
use crate::token::{now_millis, TokenManager};

/// Credentials presented to the negotiation endpoint.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    /// User name within the team.
    pub user_name: String,
    /// Device id, usually a MAC address.
    pub device_id: String,
    /// Company name or tenant id.
    pub company_name: String,
    /// Team name or id.
    pub team_name: String,
    /// Token issued by the authentication service.
    pub auth_service_token: String,
    /// Authentication service name, e.g. `github.com`.
    pub auth_service_name: String,
}

impl Credentials {
    fn validate(&self) -> Result<(), ClientError> {
        let components = [
            ("user name", &self.user_name),
            ("device id", &self.device_id),
            ("company name", &self.company_name),
            ("team name", &self.team_name),
            ("auth service name", &self.auth_service_name),
        ];

        for (name, value) in components {
            if !is_valid_component(value) {
                return Err(ClientError::InvalidCredentials(format!(
                    "{name} '{value}' contains a reserved character"
                )));
            }
        }
        Ok(())
    }
}

/// Everything bound to one hub link.
struct Session {
    user_id: String,
    turn_authorization: Option<String>,
    pool: TransportPool,
    tokens: Arc<TokenManager>,
    messenger: Arc<HttpMessenger>,
    presence: Arc<PresenceTracker>,
    queue: ElasticQueue,
    cancel: CancellationToken,
    closing: AtomicBool,
}

struct ClientInner {
    config: ClientConfig,
    factory: Arc<dyn BackendFactory>,
    connector: Arc<dyn HubConnector>,
    events: EventHub,
    /// Serializes connect, disconnect and link-loss handling.
    lifecycle: Mutex<()>,
    current: ArcSwapOption<Session>,
}

/// Signaling client.
///
/// Cheap to clone; clones share the same session.
#[derive(Clone)]
pub struct SignalClient {
    inner: Arc<ClientInner>,
}

impl SignalClient {
    /// Create a client using HTTPS and WebSocket transports.
    #[must_use]
    pub fn new(config: ClientConfig) -> Self {
        Self::with_transport(
            config,
            Arc::new(ReqwestFactory::new()),
            Arc::new(WebSocketHubConnector::new()),
        )
    }

    /// Create a client over custom transports.
    #[must_use]
    pub fn with_transport(
        config: ClientConfig,
        factory: Arc<dyn BackendFactory>,
        connector: Arc<dyn HubConnector>,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                config: config.normalized(),
                factory,
                connector,
                events: EventHub::new(),
                lifecycle: Mutex::new(()),
                current: ArcSwapOption::empty(),
            }),
        }
    }

    /// Subscribe to client events.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    /// Establish a session, replacing the current one.
    ///
    /// Negotiates, opens the hub link, fetches the first message token and
    /// announces this client to the team. A failed announcement is reported
    /// as an event and does not fail the connect.
    ///
    /// # Errors
    ///
    /// Returns an error if the credentials are invalid or any setup step
    /// fails. Nothing of the half-built session is left behind.
    pub async fn connect(&self, credentials: &Credentials) -> Result<(), ClientError> {
        credentials.validate()?;

        let _lifecycle = self.inner.lifecycle.lock().await;
        if let Some(session) = self.inner.current.load_full() {
            info!("Replacing current session");
            self.inner.teardown(&session, false, None).await;
        }

        let (session, link) = self.inner.establish(credentials).await?;
        self.inner.current.store(Some(session.clone()));

        tokio::spawn(read_hub(
            Arc::downgrade(&self.inner),
            session.clone(),
            link,
        ));
        tokio::spawn(sweep(
            self.inner.events.clone(),
            session.clone(),
            self.inner.config.presence_interval,
        ));
        session.pool.start();

        info!(user = %session.user_id, server = %self.inner.config.server, "Connected");
        self.inner.events.emit(ClientEvent::Connected);

        if let Err(e) = session.presence.announce().await {
            self.inner.events.report(e);
        }
        Ok(())
    }

    /// Close the session, if any.
    ///
    /// Says goodbye to the team within the configured quit timeout, then
    /// cancels everything bound to the session.
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if let Some(session) = self.inner.current.load_full() {
            self.inner.teardown(&session, false, None).await;
        }
    }

    fn session(&self) -> Result<Arc<Session>, ClientError> {
        self.inner.current.load_full().ok_or(ClientError::NotConnected)
    }

    fn addressable(&self, message: &OutboundMessage) -> Result<Arc<Session>, ClientError> {
        let session = self.session()?;
        if can_send_message(&session.user_id, &message.recipient) {
            Ok(session)
        } else {
            Err(ClientError::InvalidRecipient(message.recipient.clone()))
        }
    }

    /// Send a message with a single attempt.
    ///
    /// # Errors
    ///
    /// Returns an error if disconnected, if the recipient is outside the
    /// team, or if the attempt fails.
    pub async fn send_message(&self, message: OutboundMessage) -> Result<(), ClientError> {
        let session = self.addressable(&message)?;
        session.messenger.deliver(&message).await
    }

    /// Send a message to the whole team with a single attempt.
    ///
    /// # Errors
    ///
    /// See [`SignalClient::send_message`].
    pub async fn send_message_to_all(
        &self,
        message_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Result<(), ClientError> {
        let session = self.session()?;
        let message =
            OutboundMessage::to_group(session.presence.everyone(), message_type, payload);
        session.messenger.deliver(&message).await
    }

    /// Send a message, retrying up to the configured number of attempts.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error.
    pub async fn send_important_message(&self, message: OutboundMessage) -> Result<(), ClientError> {
        let session = self.addressable(&message)?;
        send_important(
            session.messenger.as_ref(),
            &message,
            self.inner.config.important_message_tries,
        )
        .await
    }

    /// Queue a message on the elastic queue.
    ///
    /// # Errors
    ///
    /// Returns an error if disconnected or the recipient is outside the
    /// team. Delivery failures are reported as events.
    pub fn send_elastic_message(
        &self,
        message: OutboundMessage,
    ) -> Result<Arc<MessageAction>, ClientError> {
        let session = self.addressable(&message)?;
        Ok(session.queue.submit(message))
    }

    /// Change the local status and broadcast it to the team.
    ///
    /// # Errors
    ///
    /// Returns an error if disconnected or the broadcast fails.
    pub async fn set_my_status(&self, status: PeerStatus) -> Result<(), ClientError> {
        let session = self.session()?;
        session.presence.set_status(status, Instant::now()).await
    }

    /// Return a valid message token, refreshing it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if disconnected or the refresh fails.
    pub async fn ensure_message_token(&self) -> Result<String, ClientError> {
        let session = self.session()?;
        session.tokens.ensure().await
    }

    /// Whether a session is established.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.current.load().is_some()
    }

    /// Full user id assigned by the server.
    #[must_use]
    pub fn user_id(&self) -> Option<String> {
        self.session().ok().map(|s| s.user_id.clone())
    }

    /// The local peer.
    #[must_use]
    pub fn me(&self) -> Option<Peer> {
        self.session().ok().map(|s| s.presence.me())
    }

    /// All known peers.
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.session()
            .map(|s| s.presence.peers())
            .unwrap_or_default()
    }

    /// One known peer.
    #[must_use]
    pub fn peer(&self, user_id: &str) -> Option<Peer> {
        self.session().ok().and_then(|s| s.presence.peer(user_id))
    }

    /// Team group addressing every peer; empty when disconnected.
    #[must_use]
    pub fn everyone_recipient(&self) -> String {
        self.session()
            .map(|s| s.presence.everyone())
            .unwrap_or_default()
    }

    /// TURN server authorization handed out at negotiation.
    #[must_use]
    pub fn turn_servers_authorization(&self) -> Option<String> {
        self.session().ok().and_then(|s| s.turn_authorization.clone())
    }

    /// The cached message token.
    #[must_use]
    pub fn message_token(&self) -> Option<String> {
        self.session().ok().and_then(|s| s.tokens.token())
    }

    /// Cancellation token of the current session.
    #[must_use]
    pub fn connection_token(&self) -> Option<CancellationToken> {
        self.session().ok().map(|s| s.cancel.clone())
    }

    /// Normalized server address.
    #[must_use]
    pub fn server_address(&self) -> &str {
        &self.inner.config.server
    }

    /// Status timeout announced to peers.
    #[must_use]
    pub fn status_timeout(&self) -> Duration {
        self.inner.config.status_timeout
    }
}

impl ClientInner {
    async fn establish(
        &self,
        credentials: &Credentials,
    ) -> Result<(Arc<Session>, Box<dyn HubLink>), ClientError> {
        let pool = TransportPool::new(
            self.config.server.clone(),
            self.factory.clone(),
            self.config.pool.clone(),
        )?;

        match self.open_session(pool.clone(), credentials).await {
            Ok(opened) => Ok(opened),
            Err(e) => {
                pool.shutdown();
                Err(e)
            }
        }
    }

    async fn open_session(
        &self,
        pool: TransportPool,
        credentials: &Credentials,
    ) -> Result<(Arc<Session>, Box<dyn HubLink>), ClientError> {
        let request = HttpRequest::post(paths::NEGOTIATE)
            .header(headers::USER_NAME, credentials.user_name.as_str())
            .header(headers::DEVICE_ID, credentials.device_id.as_str())
            .header(headers::COMPANY_NAME, credentials.company_name.as_str())
            .header(headers::TEAM_NAME, credentials.team_name.as_str())
            .header(headers::AUTH_SERVICE_TOKEN, credentials.auth_service_token.as_str())
            .header(headers::AUTH_SERVICE_NAME, credentials.auth_service_name.as_str());

        let response = pool
            .send(request)
            .await
            .map_err(|e| ClientError::Negotiation(e.to_string()))?;
        let negotiated = NegotiateResponse::parse(&response.body)
            .map_err(|e| ClientError::Negotiation(format!("Invalid response: {e}")))?;

        let skew_ms = negotiated
            .server_time_secs
            .checked_mul(1000)
            .and_then(|server_ms| now_millis().checked_sub(server_ms))
            .ok_or_else(|| {
                ClientError::Negotiation(format!(
                    "Server time out of range: {}",
                    negotiated.server_time_secs
                ))
            })?;
        debug!(user = %negotiated.user_id, skew_ms, "Negotiated");

        let me = Peer::new(
            &negotiated.user_id,
            PeerStatus::Online,
            self.config.status_timeout,
            Instant::now(),
        )?;

        let mut link = self
            .connector
            .connect(
                &negotiated.client_url,
                &negotiated.client_token,
                self.config.hub_protocol,
            )
            .await?;

        let cancel = CancellationToken::new();
        let tokens = Arc::new(TokenManager::new(
            pool.clone(),
            negotiated.client_token.as_str(),
            skew_ms,
            cancel.clone(),
        ));

        if let Err(e) = tokens.ensure().await {
            if let Err(close) = link.close().await {
                debug!(error = %close, "Failed to close hub link");
            }
            return Err(e);
        }

        let messenger = Arc::new(HttpMessenger::new(
            pool.clone(),
            tokens.clone(),
            self.events.clone(),
            cancel.clone(),
        ));
        let presence = Arc::new(PresenceTracker::new(
            me,
            messenger.clone(),
            self.events.clone(),
            self.config.important_message_tries,
            cancel.clone(),
        ));
        let queue = ElasticQueue::new(
            messenger.clone(),
            self.events.clone(),
            self.config.max_concurrent_sends,
            cancel.clone(),
        );

        let session = Session {
            user_id: negotiated.user_id,
            turn_authorization: negotiated.turn_authorization,
            pool,
            tokens,
            messenger,
            presence,
            queue,
            cancel,
            closing: AtomicBool::new(false),
        };
        Ok((Arc::new(session), link))
    }

    /// Called by the reader when the hub link ends on its own.
    async fn link_lost(&self, session: &Arc<Session>, reason: Option<String>) {
        let _lifecycle = self.lifecycle.lock().await;
        let current = self
            .current
            .load_full()
            .is_some_and(|current| Arc::ptr_eq(&current, session));

        if current {
            warn!(reason = ?reason, "Hub closed the connection");
            self.teardown(session, true, reason).await;
        }
    }

    /// Must be called with the lifecycle lock held.
    async fn teardown(&self, session: &Arc<Session>, abnormal: bool, reason: Option<String>) {
        if session.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        match tokio::time::timeout(self.config.quit_timeout, session.presence.quit()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => self.events.report(e),
            Err(_) => debug!("Goodbye timed out"),
        }

        session.cancel.cancel();
        session.pool.shutdown();
        session.presence.clear();
        self.current.store(None);

        info!(user = %session.user_id, abnormal, "Disconnected");
        self.events
            .emit(ClientEvent::Disconnected { abnormal, reason });
    }
}

/// Feeds inbound envelopes to presence until the link ends or the session
/// is cancelled.
async fn read_hub(client: Weak<ClientInner>, session: Arc<Session>, mut link: Box<dyn HubLink>) {
    let reason = loop {
        let received = tokio::select! {
            () = session.cancel.cancelled() => {
                close_link(link.as_mut()).await;
                return;
            }
            received = link.recv() => received,
        };

        match received {
            Ok(Some(HubMessage::Close { error, .. })) => break error,
            Ok(Some(message)) => match message.as_signal() {
                Some(envelope) => session.presence.handle(&envelope, Instant::now()),
                None => trace!(message_type = message.type_id(), "Ignoring hub message"),
            },
            Ok(None) => break None,
            Err(e) => {
                warn!(error = %e, "Hub link failed");
                break Some(e.to_string());
            }
        }
    };

    close_link(link.as_mut()).await;
    if let Some(client) = client.upgrade() {
        client.link_lost(&session, reason).await;
    }
}

async fn close_link(link: &mut dyn HubLink) {
    if let Err(e) = link.close().await {
        debug!(error = %e, "Failed to close hub link");
    }
}

/// Periodic token refresh and presence sweep.
async fn sweep(events: EventHub, session: Arc<Session>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = session.cancel.cancelled() => break,
            _ = interval.tick() => {
                if let Err(e) = session.tokens.ensure().await {
                    events.report(e);
                }
                session.presence.sweep(Instant::now()).await;
            }
        }
    }
    trace!("Presence sweep stopped");
}
