//! Transport abstraction traits for Huddle.
//!
//! The runtime talks to the outside world through two seams: an
//! [`HttpBackend`] executing request/response calls, and a [`HubLink`]
//! delivering hub messages. Concrete implementations live in the `http` and
//! `websocket` modules; tests substitute in-process doubles.

use async_trait::async_trait;
use huddle_protocol::{HubMessage, HubProtocol, ProtocolError};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The pool was shut down.
    #[error("Transport closed")]
    Closed,

    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection timed out.
    #[error("Connection timed out")]
    Timeout,

    /// The server answered with a non-success status.
    #[error("HTTP request failed with {status}. {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, or the status reason when the body is empty.
        body: String,
    },

    /// The request could not be completed.
    #[error("Request failed: {0}")]
    Request(String),

    /// Hub link setup failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// HTTP status of a [`TransportError::Status`] failure.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Post => f.write_str("POST"),
        }
    }
}

/// An outbound HTTP request, relative to the server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Path, starting with `/`.
    pub path: String,
    /// Request headers in insertion order.
    pub headers: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<String>,
}

impl HttpRequest {
    /// Create a GET request.
    #[must_use]
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    /// Create a POST request.
    #[must_use]
    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Add a header.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set a JSON body.
    #[must_use]
    pub fn json_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Look up a header value, ignoring case.
    #[must_use]
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Canonical reason phrase for the status, if known.
    pub reason: Option<String>,
    /// Response body as text.
    pub body: String,
}

impl HttpResponse {
    /// Create a response.
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            reason: None,
            body: body.into(),
        }
    }

    /// Whether the status is 2xx.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Executes HTTP requests. One instance backs one pool generation.
#[async_trait]
pub trait HttpBackend: Send + Sync {
    /// Execute `request` against the absolute `url`.
    ///
    /// Non-success statuses are returned as responses, not errors.
    async fn execute(&self, url: &str, request: &HttpRequest)
        -> Result<HttpResponse, TransportError>;
}

/// Builds fresh backends for new pool generations.
pub trait BackendFactory: Send + Sync {
    /// Build a new backend instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying client cannot be constructed.
    fn build(&self) -> Result<Arc<dyn HttpBackend>, TransportError>;
}

/// Opens hub links.
#[async_trait]
pub trait HubConnector: Send + Sync {
    /// Open a link to the hub client endpoint `client_url`, authorized by
    /// `access_token`, speaking `protocol`.
    ///
    /// Returns once the handshake has been accepted.
    async fn connect(
        &self,
        client_url: &str,
        access_token: &str,
        protocol: HubProtocol,
    ) -> Result<Box<dyn HubLink>, TransportError>;
}

/// An open hub link.
#[async_trait]
pub trait HubLink: Send {
    /// Receive the next hub message.
    ///
    /// Returns `None` if the link is closed cleanly.
    async fn recv(&mut self) -> Result<Option<HubMessage>, TransportError>;

    /// Send a message to the hub.
    async fn send(&mut self, message: HubMessage) -> Result<(), TransportError>;

    /// Close the link gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Check if the link is still open.
    fn is_open(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = HttpRequest::post("/api/Message")
            .header("authtoken", "t")
            .header("messagetype", "CHAT")
            .json_body("\"hi\"");

        assert_eq!(request.method, Method::Post);
        assert_eq!(request.header_value("AuthToken"), Some("t"));
        assert_eq!(request.header_value("missing"), None);
        assert_eq!(request.body.as_deref(), Some("\"hi\""));
    }

    #[test]
    fn test_status_error_message() {
        let err = TransportError::Status {
            status: 401,
            body: "Unauthorized".into(),
        };
        assert_eq!(err.to_string(), "HTTP request failed with 401. Unauthorized");
        assert_eq!(err.status(), Some(401));
        assert_eq!(TransportError::Closed.status(), None);
    }

    #[test]
    fn test_response_success_range() {
        assert!(HttpResponse::new(200, "").is_success());
        assert!(HttpResponse::new(204, "").is_success());
        assert!(!HttpResponse::new(302, "").is_success());
        assert!(!HttpResponse::new(500, "").is_success());
    }
}
