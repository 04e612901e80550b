//! Self-recycling HTTP transport pool.
//!
//! The pool keeps exactly one active *generation*: a backend instance plus
//! request counters and a creation time. A background sweep replaces the
//! generation once it has served too many requests or lived too long, so
//! long-running sessions never pin a stale connection pool or DNS result.
//!
//! Requests keep the generation that was active when they were dispatched
//! until they complete. A retired generation is dropped once its in-flight
//! counter drains to zero.

use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::traits::{BackendFactory, HttpBackend, HttpRequest, HttpResponse, TransportError};

/// Counter of completed generation swaps.
pub const RECYCLES_METRIC: &str = "huddle_transport_recycles_total";

/// Transport pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How often the recycle sweep runs.
    pub recycle_interval: Duration,
    /// Recycle once a generation has served this many requests.
    pub max_requests: u64,
    /// Recycle once a generation that has served requests is this old.
    pub max_age: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            recycle_interval: Duration::from_secs(10),
            max_requests: 3000,
            max_age: Duration::from_secs(60),
        }
    }
}

struct Generation {
    id: u64,
    backend: Arc<dyn HttpBackend>,
    created: Instant,
    total: AtomicU64,
    active: AtomicU64,
    drained: Notify,
}

impl Generation {
    fn new(id: u64, backend: Arc<dyn HttpBackend>) -> Self {
        Self {
            id,
            backend,
            created: Instant::now(),
            total: AtomicU64::new(0),
            active: AtomicU64::new(0),
            drained: Notify::new(),
        }
    }

    fn is_due(&self, config: &PoolConfig, now: Instant) -> bool {
        let total = self.total.load(Ordering::SeqCst);
        total >= config.max_requests
            || (total > 0 && now.duration_since(self.created) >= config.max_age)
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Holds a generation for the duration of one request.
struct InFlight {
    generation: Arc<Generation>,
}

impl InFlight {
    fn begin(generation: Arc<Generation>) -> Self {
        generation.total.fetch_add(1, Ordering::SeqCst);
        generation.active.fetch_add(1, Ordering::SeqCst);
        Self { generation }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.generation.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.generation.drained.notify_waiters();
        }
    }
}

struct PoolInner {
    server: String,
    factory: Arc<dyn BackendFactory>,
    config: PoolConfig,
    /// `None` once the pool is shut down.
    current: ArcSwapOption<Generation>,
    recycling: Mutex<()>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

/// HTTP transport pool with periodic generation recycling.
///
/// Cloning is cheap; clones share the same generation.
#[derive(Clone)]
pub struct TransportPool {
    inner: Arc<PoolInner>,
}

impl TransportPool {
    /// Create a pool for `server` with an initial generation.
    ///
    /// The recycle sweep is not running until [`TransportPool::start`] is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the factory cannot build the first backend.
    pub fn new(
        server: impl Into<String>,
        factory: Arc<dyn BackendFactory>,
        config: PoolConfig,
    ) -> Result<Self, TransportError> {
        let server = server.into();
        let backend = factory.build()?;

        info!(server = %server, "Transport pool created");

        Ok(Self {
            inner: Arc::new(PoolInner {
                server,
                factory,
                config,
                current: ArcSwapOption::from_pointee(Generation::new(0, backend)),
                recycling: Mutex::new(()),
                next_id: AtomicU64::new(1),
                cancel: CancellationToken::new(),
            }),
        })
    }

    /// Start the background recycle sweep.
    ///
    /// The sweep stops on [`TransportPool::shutdown`].
    pub fn start(&self) -> JoinHandle<()> {
        let pool = self.clone();
        let period = self.inner.config.recycle_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = pool.inner.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        pool.recycle_if_due().await;
                    }
                }
            }

            debug!("Transport recycle sweep stopped");
        })
    }

    /// Server address every request path is appended to.
    #[must_use]
    pub fn server(&self) -> &str {
        &self.inner.server
    }

    /// Id of the active generation, or `None` after shutdown.
    #[must_use]
    pub fn generation_id(&self) -> Option<u64> {
        self.inner.current.load_full().map(|generation| generation.id)
    }

    /// Requests served by the active generation.
    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.inner
            .current
            .load_full()
            .map_or(0, |generation| generation.total.load(Ordering::SeqCst))
    }

    /// Requests currently in flight on the active generation.
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.inner
            .current
            .load_full()
            .map_or(0, |generation| generation.active.load(Ordering::SeqCst))
    }

    /// Whether [`TransportPool::shutdown`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.current.load().is_none()
    }

    /// Send a request through the active generation.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Closed`] after shutdown,
    /// [`TransportError::Status`] for non-2xx responses, or the backend's
    /// error if the request could not be completed.
    pub async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let Some(generation) = self.inner.current.load_full() else {
            return Err(TransportError::Closed);
        };
        let in_flight = InFlight::begin(generation);

        let request = request.header("Cache-Control", "no-cache");
        let url = format!("{}{}", self.inner.server, request.path);
        trace!(
            generation = in_flight.generation.id,
            method = %request.method,
            url = %url,
            "Sending request"
        );

        let response = in_flight.generation.backend.execute(&url, &request).await?;
        if response.is_success() {
            return Ok(response);
        }

        let body = if response.body.trim().is_empty() {
            response.reason.unwrap_or_default()
        } else {
            response.body
        };
        Err(TransportError::Status {
            status: response.status,
            body,
        })
    }

    /// Replace the active generation if it is due.
    ///
    /// Returns `true` if a new generation was swapped in. Returns `false`
    /// without waiting if another recycle is already in progress.
    pub async fn recycle_if_due(&self) -> bool {
        let Some(current) = self.inner.current.load_full() else {
            return false;
        };
        if !current.is_due(&self.inner.config, Instant::now()) {
            return false;
        }

        let Ok(_guard) = self.inner.recycling.try_lock() else {
            debug!("Transport recycle already in progress");
            return false;
        };

        self.recycle(current).await
    }

    async fn recycle(&self, current: Arc<Generation>) -> bool {
        let candidate = match self.inner.factory.build() {
            Ok(backend) => backend,
            Err(e) => {
                warn!(error = %e, "Failed to build transport generation");
                return false;
            }
        };

        // Warm up before the swap so the first real request does not pay
        // for connection setup. Any response counts.
        let warm_up = HttpRequest::get("/").header("Cache-Control", "no-cache");
        let root = format!("{}/", self.inner.server);
        if let Err(e) = candidate.execute(&root, &warm_up).await {
            warn!(error = %e, "Transport warm-up failed, keeping current generation");
            return false;
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let expected = Some(current);
        let previous = self
            .inner
            .current
            .compare_and_swap(&expected, Some(Arc::new(Generation::new(id, candidate))));

        let swapped = matches!(
            (&*previous, &expected),
            (Some(previous), Some(expected)) if Arc::ptr_eq(previous, expected)
        );
        if !swapped {
            debug!(generation = id, "Pool shut down during recycle, discarding candidate");
            return false;
        }

        if let Some(old) = expected {
            metrics::counter!(RECYCLES_METRIC).increment(1);
            info!(
                old = old.id,
                new = id,
                requests = old.total.load(Ordering::SeqCst),
                "Transport generation recycled"
            );
            retire(old);
        }
        true
    }

    /// Stop the recycle sweep and retire the active generation.
    ///
    /// Requests already in flight complete normally; later requests fail
    /// with [`TransportError::Closed`].
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();

        if let Some(generation) = self.inner.current.swap(None) {
            info!(server = %self.inner.server, "Transport pool shut down");
            retire(generation);
        }
    }
}

/// Drop `generation` once its in-flight requests have completed.
fn retire(generation: Arc<Generation>) {
    tokio::spawn(async move {
        generation.wait_drained().await;
        debug!(generation = generation.id, "Transport generation disposed");
    });
}
