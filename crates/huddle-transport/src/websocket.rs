//! WebSocket hub link.
//!
//! This module opens the hub link using tokio-tungstenite:
//!
//! 1. POST `{clientUrl}/negotiate?negotiateVersion=1` with the client token
//!    as a bearer token, following one redirect.
//! 2. Open the socket at the client url (`ws`/`wss`) with `id` and
//!    `access_token` query parameters.
//! 3. Exchange the protocol handshake, then stream hub messages.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use huddle_protocol::{codec, HubCodec, HubMessage, HubProtocol, LinkNegotiation};
use reqwest::Url;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, error, info, trace, warn};

use crate::traits::{HubConnector, HubLink, TransportError};

/// Interval between client keepalive pings.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(15);

/// Negotiate redirects followed before giving up.
const MAX_REDIRECTS: usize = 1;

type HubStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Resolved socket endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
struct LinkTarget {
    url: String,
    access_token: String,
    link_id: Option<String>,
}

/// Opens hub links over WebSocket.
pub struct WebSocketHubConnector {
    http: reqwest::Client,
    ping_interval: Duration,
    skip_negotiation: bool,
}

impl Default for WebSocketHubConnector {
    fn default() -> Self {
        Self {
            http: reqwest::Client::new(),
            ping_interval: DEFAULT_PING_INTERVAL,
            skip_negotiation: false,
        }
    }
}

impl WebSocketHubConnector {
    /// Create a connector with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the keepalive ping interval.
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Connect the socket directly, without the negotiate step.
    #[must_use]
    pub fn skip_negotiation(mut self) -> Self {
        self.skip_negotiation = true;
        self
    }

    async fn negotiate(
        &self,
        client_url: &str,
        access_token: &str,
    ) -> Result<LinkTarget, TransportError> {
        let mut url = client_url.to_string();
        let mut token = access_token.to_string();

        for _ in 0..=MAX_REDIRECTS {
            let endpoint = negotiate_url(&url)?;
            debug!(url = %endpoint, "Negotiating hub link");

            let resp = self
                .http
                .post(endpoint)
                .bearer_auth(&token)
                .send()
                .await
                .map_err(|e| TransportError::Request(e.to_string()))?;
            let status = resp.status();
            let body = resp
                .text()
                .await
                .map_err(|e| TransportError::Request(e.to_string()))?;

            if !status.is_success() {
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body: if body.is_empty() {
                        status.canonical_reason().unwrap_or_default().to_string()
                    } else {
                        body
                    },
                });
            }

            let negotiation = LinkNegotiation::parse(&body)?;
            match negotiation.url {
                Some(redirect) => {
                    debug!(url = %redirect, "Hub negotiation redirected");
                    url = redirect;
                    if let Some(redirect_token) = negotiation.access_token {
                        token = redirect_token;
                    }
                }
                None => {
                    return Ok(LinkTarget {
                        url,
                        access_token: token,
                        link_id: negotiation.link_id().map(str::to_string),
                    });
                }
            }
        }

        Err(TransportError::Handshake(
            "too many hub negotiation redirects".into(),
        ))
    }
}

#[async_trait]
impl HubConnector for WebSocketHubConnector {
    async fn connect(
        &self,
        client_url: &str,
        access_token: &str,
        protocol: HubProtocol,
    ) -> Result<Box<dyn HubLink>, TransportError> {
        let target = if self.skip_negotiation {
            LinkTarget {
                url: client_url.to_string(),
                access_token: access_token.to_string(),
                link_id: None,
            }
        } else {
            self.negotiate(client_url, access_token).await?
        };

        let url = socket_url(&target.url, target.link_id.as_deref(), &target.access_token)?;
        let (mut stream, _) = connect_async(url.as_str()).await.map_err(|e| {
            error!("Hub socket connection failed: {}", e);
            TransportError::Handshake(format!("WebSocket connection failed: {e}"))
        })?;

        let handshake = codec::encode_handshake(protocol);
        stream
            .send(Message::Text(
                String::from_utf8_lossy(&handshake).into_owned(),
            ))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        let read_buffer = read_handshake(&mut stream).await?;
        info!(protocol = %protocol, "Hub link established");

        Ok(Box::new(WebSocketHubLink::new(
            stream,
            protocol,
            read_buffer,
            self.ping_interval,
        )))
    }
}

/// Read until the handshake response; returns the bytes that follow it.
async fn read_handshake(stream: &mut HubStream) -> Result<BytesMut, TransportError> {
    let mut buf = BytesMut::new();

    loop {
        if codec::decode_handshake(&mut buf)
            .map_err(|e| TransportError::Handshake(e.to_string()))?
            .is_some()
        {
            return Ok(buf);
        }

        match stream.next().await {
            Some(Ok(Message::Text(text))) => buf.extend_from_slice(text.as_bytes()),
            Some(Ok(Message::Binary(data))) => buf.extend_from_slice(&data),
            Some(Ok(Message::Close(_))) | None => {
                return Err(TransportError::Handshake(
                    "link closed during handshake".into(),
                ));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(TransportError::Handshake(e.to_string())),
        }
    }
}

/// A hub link over WebSocket.
pub struct WebSocketHubLink {
    stream: HubStream,
    codec: HubCodec,
    read_buffer: BytesMut,
    ping: Interval,
    is_open: bool,
}

impl WebSocketHubLink {
    fn new(
        stream: HubStream,
        protocol: HubProtocol,
        read_buffer: BytesMut,
        ping_interval: Duration,
    ) -> Self {
        let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

        Self {
            stream,
            codec: HubCodec::new(protocol),
            read_buffer,
            ping,
            is_open: true,
        }
    }
}

#[async_trait]
impl HubLink for WebSocketHubLink {
    async fn recv(&mut self) -> Result<Option<HubMessage>, TransportError> {
        loop {
            // Drain already-buffered messages first
            while let Some(message) = self.codec.decode_from(&mut self.read_buffer)? {
                if message == HubMessage::Ping {
                    trace!("Hub ping");
                    continue;
                }
                return Ok(Some(message));
            }

            if !self.is_open {
                return Ok(None);
            }

            let next = tokio::select! {
                _ = self.ping.tick() => None,
                next = self.stream.next() => Some(next),
            };

            let Some(next) = next else {
                self.send(HubMessage::ping()).await?;
                continue;
            };

            match next {
                Some(Ok(Message::Text(text))) => {
                    self.read_buffer.extend_from_slice(text.as_bytes());
                }
                Some(Ok(Message::Binary(data))) => {
                    self.read_buffer.extend_from_slice(&data);
                }
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = self.stream.send(Message::Pong(data)).await {
                        warn!("Failed to send pong: {}", e);
                    }
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    debug!("Received close frame");
                    self.is_open = false;
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    debug!("Hub socket ended");
                    self.is_open = false;
                }
                Some(Err(e)) => {
                    error!("Hub socket error: {}", e);
                    self.is_open = false;
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }

    async fn send(&mut self, message: HubMessage) -> Result<(), TransportError> {
        if !self.is_open {
            return Err(TransportError::ConnectionClosed);
        }

        let data = self.codec.encode(&message)?;
        let frame = if self.codec.protocol().is_binary() {
            Message::Binary(data.to_vec())
        } else {
            Message::Text(String::from_utf8_lossy(&data).into_owned())
        };

        self.stream
            .send(frame)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.is_open, false) {
            return Ok(()); // Already closed
        }

        self.stream
            .close(None)
            .await
            .map_err(|e| TransportError::Other(format!("Failed to close: {}", e)))
    }

    fn is_open(&self) -> bool {
        self.is_open
    }
}

/// `{clientUrl}/negotiate?{query}&negotiateVersion=1`.
fn negotiate_url(client_url: &str) -> Result<String, TransportError> {
    let mut url = parse_url(client_url)?;
    url.path_segments_mut()
        .map_err(|()| TransportError::Handshake(format!("invalid client url '{client_url}'")))?
        .pop_if_empty()
        .push("negotiate");
    url.query_pairs_mut().append_pair("negotiateVersion", "1");
    Ok(url.into())
}

/// Socket url: `http(s)` becomes `ws(s)`, plus `id` and `access_token`.
fn socket_url(
    client_url: &str,
    link_id: Option<&str>,
    access_token: &str,
) -> Result<String, TransportError> {
    let mut url = parse_url(client_url)?;
    let scheme = match url.scheme() {
        "https" => "wss",
        "http" => "ws",
        other => other,
    }
    .to_string();
    url.set_scheme(&scheme)
        .map_err(|()| TransportError::Handshake(format!("invalid client url '{client_url}'")))?;

    {
        let mut query = url.query_pairs_mut();
        if let Some(id) = link_id {
            query.append_pair("id", id);
        }
        query.append_pair("access_token", access_token);
    }
    Ok(url.into())
}

fn parse_url(url: &str) -> Result<Url, TransportError> {
    Url::parse(url).map_err(|e| TransportError::Handshake(format!("invalid client url '{url}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_protocol::Envelope;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[test]
    fn test_negotiate_url() {
        assert_eq!(
            negotiate_url("https://hub.example.net/client/?hub=chat").unwrap(),
            "https://hub.example.net/client/negotiate?hub=chat&negotiateVersion=1"
        );
        assert_eq!(
            negotiate_url("http://localhost:7071/client").unwrap(),
            "http://localhost:7071/client/negotiate?negotiateVersion=1"
        );
        assert!(negotiate_url("not a url").is_err());
    }

    #[test]
    fn test_socket_url() {
        assert_eq!(
            socket_url("https://hub.example.net/client/?hub=chat", Some("abc"), "tok").unwrap(),
            "wss://hub.example.net/client/?hub=chat&id=abc&access_token=tok"
        );
        assert_eq!(
            socket_url("http://localhost:7071/client/", None, "tok").unwrap(),
            "ws://localhost:7071/client/?access_token=tok"
        );
    }

    #[tokio::test]
    async fn test_negotiate_follows_redirect() {
        use axum::http::HeaderMap;
        use axum::routing::post;
        use axum::Router;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = format!("http://{}", listener.local_addr().unwrap());

        let redirect = format!(r#"{{"url":"{server}/other/?hub=chat","accessToken":"tok2"}}"#);
        let app = Router::new()
            .route(
                "/client/negotiate",
                post(move |headers: HeaderMap| async move {
                    assert_eq!(headers["authorization"], "Bearer tok1");
                    redirect
                }),
            )
            .route(
                "/other/negotiate",
                post(|headers: HeaderMap| async move {
                    assert_eq!(headers["authorization"], "Bearer tok2");
                    r#"{"connectionId":"c1","connectionToken":"ct1"}"#
                }),
            );
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let target = WebSocketHubConnector::new()
            .negotiate(&format!("{server}/client/?hub=chat"), "tok1")
            .await
            .unwrap();

        assert_eq!(target.url, format!("{server}/other/?hub=chat"));
        assert_eq!(target.access_token, "tok2");
        assert_eq!(target.link_id.as_deref(), Some("ct1"));
    }

    fn json_text(messages: &[HubMessage]) -> Message {
        let mut buf = BytesMut::new();
        for message in messages {
            codec::encode_into(message, HubProtocol::Json, &mut buf).unwrap();
        }
        Message::Text(String::from_utf8(buf.to_vec()).unwrap())
    }

    async fn hub_listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/client/?hub=chat", listener.local_addr().unwrap());
        (listener, url)
    }

    #[tokio::test]
    async fn test_json_link_delivers_messages() {
        let (listener, url) = hub_listener().await;
        let signal = HubMessage::signal(&Envelope::new("mac2|bob+svc/acme/eng", "CHAT", "hi"));
        let expected = signal.clone();

        let hub = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            let handshake = ws.next().await.unwrap().unwrap().into_text().unwrap();
            assert_eq!(handshake, "{\"protocol\":\"json\",\"version\":1}\u{1e}");

            // Handshake response and the first messages share one frame.
            let mut frame = String::from("{}\u{1e}");
            frame.push_str(&json_text(&[signal, HubMessage::ping()]).into_text().unwrap());
            ws.send(Message::Text(frame)).await.unwrap();
            ws.send(json_text(&[HubMessage::close(Some("bye".into()))]))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        });

        let mut link = WebSocketHubConnector::new()
            .skip_negotiation()
            .connect(&url, "tok", HubProtocol::Json)
            .await
            .unwrap();

        assert_eq!(link.recv().await.unwrap(), Some(expected));
        assert_eq!(
            link.recv().await.unwrap(),
            Some(HubMessage::close(Some("bye".into())))
        );
        assert_eq!(link.recv().await.unwrap(), None);
        assert!(!link.is_open());

        hub.await.unwrap();
    }

    #[tokio::test]
    async fn test_messagepack_link_and_keepalive() {
        let (listener, url) = hub_listener().await;
        let signal = HubMessage::signal(&Envelope::new("mac2|bob+svc/acme/eng", "HELLO", "[]"));
        let expected = signal.clone();

        let hub = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();

            let handshake = ws.next().await.unwrap().unwrap().into_text().unwrap();
            assert!(handshake.contains("\"messagepack\""));
            ws.send(Message::Text("{}\u{1e}".into())).await.unwrap();

            // The client pings while idle.
            let ping = ws.next().await.unwrap().unwrap();
            let mut buf = BytesMut::from(&ping.into_data()[..]);
            assert_eq!(
                codec::decode_from(&mut buf, HubProtocol::MessagePack).unwrap(),
                Some(HubMessage::Ping)
            );

            let data = codec::encode(&signal, HubProtocol::MessagePack).unwrap();
            ws.send(Message::Binary(data.to_vec())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let mut link = WebSocketHubConnector::new()
            .skip_negotiation()
            .with_ping_interval(Duration::from_millis(50))
            .connect(&url, "tok", HubProtocol::MessagePack)
            .await
            .unwrap();

        assert_eq!(link.recv().await.unwrap(), Some(expected));
        assert_eq!(link.recv().await.unwrap(), None);
        hub.await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_rejected() {
        let (listener, url) = hub_listener().await;

        let hub = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
            ws.send(Message::Text(
                "{\"error\":\"Requested protocol is not available.\"}\u{1e}".into(),
            ))
            .await
            .unwrap();
            let _ = ws.next().await;
        });

        let result = WebSocketHubConnector::new()
            .skip_negotiation()
            .connect(&url, "tok", HubProtocol::MessagePack)
            .await;
        assert!(matches!(result, Err(TransportError::Handshake(_))));

        hub.abort();
    }
}
