//! Message token management.
//!
//! The send endpoint is authorized by a short-lived JWT. The manager caches
//! the current token together with the local instant it should be replaced
//! at, and fetches a new one on demand.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use huddle_protocol::negotiate::{headers, paths};
use huddle_transport::{HttpRequest, TransportPool};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::TOKEN_REFRESH_MARGIN;
use crate::error::ClientError;
use crate::metrics;

/// A cached message token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageToken {
    /// The signed token.
    pub value: String,
    /// Local time to refresh at, in milliseconds since the Unix epoch.
    pub valid_to_ms: i64,
}

impl MessageToken {
    /// Whether the token may still be used at `now_ms`.
    #[must_use]
    pub fn is_valid_at(&self, now_ms: i64) -> bool {
        now_ms < self.valid_to_ms
    }
}

/// Fetches and caches message tokens for one session.
pub struct TokenManager {
    pool: TransportPool,
    client_token: String,
    /// Local clock minus server clock.
    skew_ms: i64,
    current: RwLock<Option<MessageToken>>,
    refresh: Mutex<()>,
    cancel: CancellationToken,
}

impl TokenManager {
    /// Create a manager. The first request is authorized by `client_token`.
    #[must_use]
    pub fn new(
        pool: TransportPool,
        client_token: impl Into<String>,
        skew_ms: i64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            client_token: client_token.into(),
            skew_ms,
            current: RwLock::new(None),
            refresh: Mutex::new(()),
            cancel,
        }
    }

    /// The cached token, valid or not.
    #[must_use]
    pub fn current(&self) -> Option<MessageToken> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The cached token value.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.current().map(|token| token.value)
    }

    /// Measured clock skew (local minus server), in milliseconds.
    #[must_use]
    pub fn skew_ms(&self) -> i64 {
        self.skew_ms
    }

    /// Return a valid token, fetching a new one if needed.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Token`] if the request fails or the response
    /// is not a JWT, and [`ClientError::Cancelled`] on teardown. The cached
    /// token is left untouched on failure.
    pub async fn ensure(&self) -> Result<String, ClientError> {
        self.ensure_at(now_millis()).await
    }

    /// [`TokenManager::ensure`] with an explicit clock.
    ///
    /// # Errors
    ///
    /// See [`TokenManager::ensure`].
    pub async fn ensure_at(&self, now_ms: i64) -> Result<String, ClientError> {
        if let Some(value) = self.valid_at(now_ms) {
            return Ok(value);
        }

        // Concurrent callers wait here and reuse the winner's token.
        let _refresh = self.refresh.lock().await;
        if let Some(value) = self.valid_at(now_ms) {
            return Ok(value);
        }

        let auth = self.token().unwrap_or_else(|| self.client_token.clone());
        let request = HttpRequest::post(paths::MESSAGE_TOKEN).header(headers::AUTH_TOKEN, auth);

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return Err(ClientError::Cancelled),
            response = self.pool.send(request) => {
                response.map_err(|e| ClientError::Token(e.to_string()))?
            }
        };

        let value = response.body.trim().trim_matches('"').to_string();
        let exp = jwt_expiry(&value)?;
        let valid_to_ms = exp
            .checked_mul(1000)
            .and_then(|ms| ms.checked_sub(TOKEN_REFRESH_MARGIN.as_millis() as i64))
            .and_then(|ms| ms.checked_sub(self.skew_ms))
            .ok_or_else(|| ClientError::Token(format!("message token expiry out of range: {exp}")))?;

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(MessageToken {
            value: value.clone(),
            valid_to_ms,
        });
        metrics::record_token_refresh();
        info!(exp, valid_to_ms, "Message token refreshed");

        Ok(value)
    }

    fn valid_at(&self, now_ms: i64) -> Option<String> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        match current.as_ref() {
            Some(token) if token.is_valid_at(now_ms) => Some(token.value.clone()),
            Some(token) => {
                debug!(valid_to_ms = token.valid_to_ms, now_ms, "Message token expired");
                None
            }
            None => None,
        }
    }
}

/// Read the `exp` claim (seconds since the Unix epoch) of a JWT.
///
/// The signature is not verified.
///
/// # Errors
///
/// Returns [`ClientError::Token`] if the token is not a JWT with a numeric
/// `exp` claim.
pub fn jwt_expiry(token: &str) -> Result<i64, ClientError> {
    let malformed = |reason: &str| ClientError::Token(format!("malformed message token: {reason}"));

    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| malformed("missing payload"))?;
    let decoded = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| malformed(&e.to_string()))?;
    let claims: serde_json::Value =
        serde_json::from_slice(&decoded).map_err(|e| malformed(&e.to_string()))?;

    match &claims["exp"] {
        serde_json::Value::Number(exp) => exp
            .as_i64()
            .or_else(|| {
                exp.as_f64()
                    .filter(|exp| (i64::MIN as f64..i64::MAX as f64).contains(exp))
                    .map(|exp| exp as i64)
            })
            .ok_or_else(|| malformed("invalid exp")),
        _ => Err(malformed("missing exp")),
    }
}

/// Local wall clock in milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{jwt, MockServer};
    use huddle_transport::{HttpResponse, PoolConfig, TransportError};
    use std::sync::Arc;

    const EXP: i64 = 1_700_000_000;

    fn manager(server: &MockServer, skew_ms: i64) -> TokenManager {
        let pool = TransportPool::new(
            "https://signal.test",
            Arc::new(server.clone()),
            PoolConfig::default(),
        )
        .unwrap();
        TokenManager::new(pool, "client-token", skew_ms, CancellationToken::new())
    }

    fn token_server() -> MockServer {
        MockServer::new(|request| match request.path.as_str() {
            paths::MESSAGE_TOKEN => Ok(HttpResponse::new(200, jwt(EXP))),
            _ => Ok(HttpResponse::new(404, "")),
        })
    }

    #[test]
    fn test_jwt_expiry() {
        assert_eq!(jwt_expiry(&jwt(EXP)).unwrap(), EXP);
        assert!(jwt_expiry("not-a-jwt").is_err());
        assert!(jwt_expiry("a.!!!.c").is_err());

        let no_exp = format!("h.{}.s", URL_SAFE_NO_PAD.encode(br#"{"sub":"x"}"#));
        assert!(jwt_expiry(&no_exp).is_err());

        let fractional = format!("h.{}.s", URL_SAFE_NO_PAD.encode(br#"{"exp":1700000000.5}"#));
        assert_eq!(jwt_expiry(&fractional).unwrap(), EXP);
        let huge = format!("h.{}.s", URL_SAFE_NO_PAD.encode(br#"{"exp":1e300}"#));
        assert!(jwt_expiry(&huge).is_err());
    }

    #[tokio::test]
    async fn test_out_of_range_expiry_rejected() {
        let server = MockServer::new(|_| Ok(HttpResponse::new(200, jwt(i64::MAX))));
        let tokens = manager(&server, 0);

        assert!(matches!(
            tokens.ensure_at(0).await,
            Err(ClientError::Token(ref m)) if m.contains("out of range")
        ));
        assert!(tokens.token().is_none());
    }

    #[tokio::test]
    async fn test_refresh_only_when_expired() {
        let server = token_server();
        // Local clock runs 2 s ahead of the server.
        let tokens = manager(&server, 2_000);
        let valid_to = EXP * 1000 - 60_000 - 2_000;

        tokens.ensure_at(0).await.unwrap();
        assert_eq!(server.count(paths::MESSAGE_TOKEN), 1);
        assert_eq!(tokens.current().unwrap().valid_to_ms, valid_to);

        // First request is authorized by the client token, later ones by
        // the current message token.
        assert_eq!(
            server.requests()[0].header_value(headers::AUTH_TOKEN),
            Some("client-token")
        );

        for now in [1, valid_to / 2, valid_to - 1] {
            tokens.ensure_at(now).await.unwrap();
        }
        assert_eq!(server.count(paths::MESSAGE_TOKEN), 1);

        tokens.ensure_at(valid_to).await.unwrap();
        assert_eq!(server.count(paths::MESSAGE_TOKEN), 2);
        assert_eq!(
            server.requests()[1].header_value(headers::AUTH_TOKEN),
            Some(jwt(EXP).as_str())
        );
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_refresh() {
        let server = token_server();
        let tokens = Arc::new(manager(&server, 0));

        let callers: Vec<_> = (0..8)
            .map(|_| {
                let tokens = tokens.clone();
                tokio::spawn(async move { tokens.ensure_at(0).await })
            })
            .collect();
        for caller in callers {
            caller.await.unwrap().unwrap();
        }

        assert_eq!(server.count(paths::MESSAGE_TOKEN), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_previous_token() {
        let server = token_server();
        let tokens = manager(&server, 0);
        tokens.ensure_at(0).await.unwrap();

        server.respond_with(|_| Err(TransportError::Request("unreachable".into())));
        let (err, cached) = match tokens.ensure_at(i64::MAX).await {
            Ok(_) => panic!("refresh should fail"),
            Err(e) => (e, tokens.token()),
        };
        assert!(matches!(err, ClientError::Token(_)));
        assert_eq!(cached, Some(jwt(EXP)));

        server.respond_with(|_| Ok(HttpResponse::new(200, "garbage")));
        assert!(matches!(
            tokens.ensure_at(i64::MAX).await,
            Err(ClientError::Token(_))
        ));
        assert_eq!(tokens.token(), Some(jwt(EXP)));
    }

    #[tokio::test]
    async fn test_cancelled_refresh() {
        let server = MockServer::pending();
        let cancel = CancellationToken::new();
        let pool = TransportPool::new(
            "https://signal.test",
            Arc::new(server.clone()),
            PoolConfig::default(),
        )
        .unwrap();
        let tokens = TokenManager::new(pool, "client-token", 0, cancel.clone());

        cancel.cancel();
        assert!(matches!(tokens.ensure().await, Err(ClientError::Cancelled)));
    }
}
