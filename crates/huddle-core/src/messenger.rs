//! Message delivery through the send endpoint.

use async_trait::async_trait;
use huddle_protocol::negotiate::{headers, paths};
use huddle_transport::{HttpRequest, TransportPool};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::ClientError;
use crate::events::EventHub;
use crate::message::{MessageSink, OutboundMessage};
use crate::metrics;
use crate::token::TokenManager;

/// Posts messages to `/api/Message` through the session's transport pool.
pub struct HttpMessenger {
    pool: TransportPool,
    tokens: Arc<TokenManager>,
    events: EventHub,
    cancel: CancellationToken,
}

impl HttpMessenger {
    /// Create a messenger for one session.
    #[must_use]
    pub fn new(
        pool: TransportPool,
        tokens: Arc<TokenManager>,
        events: EventHub,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            tokens,
            events,
            cancel,
        }
    }

    /// A fresh token if one can be had, otherwise the previous one.
    ///
    /// A failed refresh is reported even when the previous token is used.
    async fn send_token(&self) -> Result<String, ClientError> {
        match self.tokens.ensure().await {
            Ok(token) => Ok(token),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => match self.tokens.token() {
                Some(previous) => {
                    self.events.report(e);
                    Ok(previous)
                }
                None => Err(e),
            },
        }
    }
}

#[async_trait]
impl MessageSink for HttpMessenger {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), ClientError> {
        let token = self.send_token().await?;

        let request = HttpRequest::post(paths::MESSAGE)
            .header(headers::AUTH_TOKEN, token)
            .header(headers::SEND_TO, message.recipient.to_lowercase())
            .header(
                headers::USER_OR_GROUP,
                if message.group { "group" } else { "user" },
            )
            .header(headers::MESSAGE_TYPE, message.message_type.as_str())
            .json_body(message.body());

        trace!(
            recipient = %message.recipient,
            message_type = %message.message_type,
            "Sending message"
        );

        let result = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
            result = self.pool.send(request) => result,
        };

        match result {
            Ok(_) => {
                metrics::record_message_sent(&message.message_type);
                Ok(())
            }
            Err(e) => {
                metrics::record_send_failure();
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ClientEvent;
    use crate::testing::{jwt, MockServer};
    use huddle_transport::{HttpResponse, PoolConfig, TransportError};

    fn messenger(server: &MockServer, cancel: CancellationToken) -> (HttpMessenger, EventHub) {
        let pool = TransportPool::new(
            "https://signal.test",
            Arc::new(server.clone()),
            PoolConfig::default(),
        )
        .unwrap();
        let tokens = Arc::new(TokenManager::new(pool.clone(), "client", 0, cancel.clone()));
        let events = EventHub::new();
        (
            HttpMessenger::new(pool, tokens, events.clone(), cancel),
            events,
        )
    }

    fn ok_server(exp: i64) -> MockServer {
        MockServer::new(move |request| match request.path.as_str() {
            paths::MESSAGE_TOKEN => Ok(HttpResponse::new(200, jwt(exp))),
            paths::MESSAGE => Ok(HttpResponse::new(202, "")),
            _ => Ok(HttpResponse::new(404, "")),
        })
    }

    #[tokio::test]
    async fn test_deliver_request_shape() {
        let server = ok_server(i64::MAX / 2000);
        let (messenger, _events) = messenger(&server, CancellationToken::new());

        let message = OutboundMessage::to_user("Mac2|Bob+Svc/Acme/Eng", "CHAT", "hi");
        messenger.deliver(&message).await.unwrap();

        let requests = server.requests();
        let send = requests.iter().find(|r| r.path == paths::MESSAGE).unwrap();
        assert_eq!(send.header_value(headers::SEND_TO), Some("mac2|bob+svc/acme/eng"));
        assert_eq!(send.header_value(headers::USER_OR_GROUP), Some("user"));
        assert_eq!(send.header_value(headers::MESSAGE_TYPE), Some("CHAT"));
        assert_eq!(
            send.header_value(headers::AUTH_TOKEN),
            Some(jwt(i64::MAX / 2000).as_str())
        );
        assert_eq!(send.body.as_deref(), Some("\"hi\""));
    }

    #[tokio::test]
    async fn test_failed_refresh_falls_back_to_previous_token() {
        // Already expired: every send attempts a refresh.
        let server = ok_server(0);
        let (messenger, events) = messenger(&server, CancellationToken::new());
        let mut rx = events.subscribe();

        let message = OutboundMessage::to_group("svc/acme/eng", "CHAT", "hi");
        messenger.deliver(&message).await.unwrap();

        server.respond_with(|request| match request.path.as_str() {
            paths::MESSAGE_TOKEN => Err(TransportError::Request("down".into())),
            _ => Ok(HttpResponse::new(200, "")),
        });
        messenger.deliver(&message).await.unwrap();

        assert!(matches!(rx.try_recv(), Ok(ClientEvent::RequestFailed(e)) if matches!(*e, ClientError::Token(_))));
        assert_eq!(server.count(paths::MESSAGE), 2);
    }

    #[tokio::test]
    async fn test_send_failure_carries_status() {
        let server = ok_server(i64::MAX / 2000);
        let (messenger, _events) = messenger(&server, CancellationToken::new());
        server.respond_with(|request| match request.path.as_str() {
            paths::MESSAGE_TOKEN => Ok(HttpResponse::new(200, jwt(i64::MAX / 2000))),
            _ => Ok(HttpResponse::new(403, "not in team")),
        });

        let err = messenger
            .deliver(&OutboundMessage::to_user("u", "CHAT", "x"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Transport error: HTTP request failed with 403. not in team"
        );
    }
}
