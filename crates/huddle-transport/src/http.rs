//! HTTP backend built on `reqwest`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::traits::{BackendFactory, HttpBackend, HttpRequest, HttpResponse, Method, TransportError};

/// One `reqwest` client. Each pool generation owns its own.
pub struct ReqwestBackend {
    http: reqwest::Client,
}

impl ReqwestBackend {
    /// Wrap an existing client.
    #[must_use]
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HttpBackend for ReqwestBackend {
    async fn execute(
        &self,
        url: &str,
        request: &HttpRequest,
    ) -> Result<HttpResponse, TransportError> {
        let mut builder = match request.method {
            Method::Get => self.http.get(url),
            Method::Post => self.http.post(url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        if let Some(body) = &request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let resp = builder.send().await.map_err(request_error)?;
        let status = resp.status();
        let body = resp.text().await.map_err(request_error)?;

        Ok(HttpResponse {
            status: status.as_u16(),
            reason: status.canonical_reason().map(str::to_string),
            body,
        })
    }
}

/// Builds a fresh `reqwest` client per generation.
#[derive(Debug, Clone, Default)]
pub struct ReqwestFactory {
    connect_timeout: Option<Duration>,
}

impl ReqwestFactory {
    /// Create a factory with default client settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the time spent establishing connections.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }
}

impl BackendFactory for ReqwestFactory {
    fn build(&self) -> Result<Arc<dyn HttpBackend>, TransportError> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }

        let http = builder
            .build()
            .map_err(|e| TransportError::Other(format!("Failed to build HTTP client: {e}")))?;
        Ok(Arc::new(ReqwestBackend::new(http)))
    }
}

fn request_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Request(e.to_string())
    }
}
