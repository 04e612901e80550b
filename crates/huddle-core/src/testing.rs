//! In-process transport doubles shared by the unit tests.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use huddle_protocol::{HubMessage, HubProtocol};
use huddle_transport::{
    BackendFactory, HttpBackend, HttpRequest, HttpResponse, HubConnector, HubLink, TransportError,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Semaphore};

use crate::error::ClientError;
use crate::message::{MessageSink, OutboundMessage};

type Handler = dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync;

/// Build an unsigned JWT carrying `exp`.
pub(crate) fn jwt(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp},"aud":"hub"}}"#));
    format!("{header}.{claims}.sig")
}

struct ServerState {
    handler: Mutex<Arc<Handler>>,
    requests: Mutex<Vec<HttpRequest>>,
    pending: bool,
    hanging: Mutex<Vec<String>>,
}

/// HTTP backend answering from a closure and recording every request.
#[derive(Clone)]
pub(crate) struct MockServer {
    state: Arc<ServerState>,
}

impl MockServer {
    pub(crate) fn new(
        handler: impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self::with_handler(handler, false)
    }

    /// A server that never answers.
    pub(crate) fn pending() -> Self {
        Self::with_handler(|_| Ok(HttpResponse::new(200, "")), true)
    }

    fn with_handler(
        handler: impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
        pending: bool,
    ) -> Self {
        let handler: Arc<Handler> = Arc::new(handler);
        Self {
            state: Arc::new(ServerState {
                handler: Mutex::new(handler),
                requests: Mutex::new(Vec::new()),
                pending,
                hanging: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn respond_with(
        &self,
        handler: impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    ) {
        let handler: Arc<Handler> = Arc::new(handler);
        *self.state.handler.lock().unwrap() = handler;
    }

    /// Stop answering requests to `path`.
    pub(crate) fn hang(&self, path: &str) {
        self.state.hanging.lock().unwrap().push(path.to_string());
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.state.requests.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, path: &str) -> usize {
        self.requests().iter().filter(|r| r.path == path).count()
    }
}

#[async_trait]
impl HttpBackend for MockServer {
    async fn execute(
        &self,
        _url: &str,
        request: &HttpRequest,
    ) -> Result<HttpResponse, TransportError> {
        self.state.requests.lock().unwrap().push(request.clone());
        let hanging = self.state.hanging.lock().unwrap().contains(&request.path);
        if self.state.pending || hanging {
            std::future::pending::<()>().await;
        }
        let handler = self.state.handler.lock().unwrap().clone();
        handler(request)
    }
}

impl BackendFactory for MockServer {
    fn build(&self) -> Result<Arc<dyn HttpBackend>, TransportError> {
        Ok(Arc::new(self.clone()))
    }
}

/// Hub connector handing out channel-backed links.
#[derive(Default)]
pub(crate) struct MockConnector {
    hubs: Mutex<Vec<mpsc::UnboundedSender<HubMessage>>>,
    closed: Arc<AtomicUsize>,
    refuse: AtomicBool,
}

impl MockConnector {
    /// Sender feeding the most recently opened link.
    pub(crate) fn hub(&self) -> mpsc::UnboundedSender<HubMessage> {
        self.hubs.lock().unwrap().last().unwrap().clone()
    }

    /// Drop the hub side of every link, ending them.
    pub(crate) fn drop_links(&self) {
        self.hubs.lock().unwrap().clear();
    }

    pub(crate) fn connections(&self) -> usize {
        self.hubs.lock().unwrap().len()
    }

    pub(crate) fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn refuse(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl HubConnector for MockConnector {
    async fn connect(
        &self,
        _client_url: &str,
        _access_token: &str,
        _protocol: HubProtocol,
    ) -> Result<Box<dyn HubLink>, TransportError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Handshake("hub unavailable".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.hubs.lock().unwrap().push(tx);
        Ok(Box::new(MockLink {
            rx,
            open: true,
            closed: self.closed.clone(),
        }))
    }
}

struct MockLink {
    rx: mpsc::UnboundedReceiver<HubMessage>,
    open: bool,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl HubLink for MockLink {
    async fn recv(&mut self) -> Result<Option<HubMessage>, TransportError> {
        let message = self.rx.recv().await;
        if message.is_none() {
            self.open = false;
        }
        Ok(message)
    }

    async fn send(&mut self, _message: HubMessage) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if std::mem::replace(&mut self.open, false) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

/// Sink recording deliveries, optionally gated and tracking concurrency.
#[derive(Default)]
pub(crate) struct RecordingSink {
    pub(crate) delivered: Mutex<Vec<OutboundMessage>>,
    pub(crate) gate: Option<Semaphore>,
    pub(crate) fail: AtomicBool,
    active: AtomicUsize,
    pub(crate) max_active: AtomicUsize,
}

impl RecordingSink {
    pub(crate) fn gated() -> Self {
        Self {
            gate: Some(Semaphore::new(0)),
            ..Default::default()
        }
    }

    pub(crate) fn release(&self, permits: usize) {
        if let Some(gate) = &self.gate {
            gate.add_permits(permits);
        }
    }

    pub(crate) fn delivered(&self) -> Vec<OutboundMessage> {
        self.delivered.lock().unwrap().clone()
    }

    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), ClientError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        struct Leave<'a>(&'a AtomicUsize);
        impl Drop for Leave<'_> {
            fn drop(&mut self) {
                self.0.fetch_sub(1, Ordering::SeqCst);
            }
        }
        let _leave = Leave(&self.active);

        if let Some(gate) = &self.gate {
            gate.acquire().await.unwrap().forget();
        }

        self.delivered.lock().unwrap().push(message.clone());
        if self.fail.load(Ordering::SeqCst) {
            Err(ClientError::Transport(TransportError::Status {
                status: 500,
                body: "boom".into(),
            }))
        } else {
            Ok(())
        }
    }
}

/// Let spawned tasks run to their next suspension point.
pub(crate) async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}
