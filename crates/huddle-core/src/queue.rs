//! Elastic send queue.
//!
//! Messages are accepted without blocking and dispatched FIFO, with at most
//! `max_concurrent` deliveries in flight. Tearing down the connection
//! cancels everything that has not finished.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::action::MessageAction;
use crate::error::ClientError;
use crate::events::EventHub;
use crate::message::{MessageSink, OutboundMessage};
use crate::metrics;

/// Bounded-concurrency FIFO dispatcher.
pub struct ElasticQueue {
    tx: mpsc::UnboundedSender<Arc<MessageAction>>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<MessageAction>>>>,
    shared: Arc<Shared>,
}

struct Shared {
    sink: Arc<dyn MessageSink>,
    events: EventHub,
    permits: Arc<Semaphore>,
    in_flight: AtomicUsize,
    cancel: CancellationToken,
}

impl ElasticQueue {
    /// Create a queue bound to the connection token `cancel`.
    #[must_use]
    pub fn new(
        sink: Arc<dyn MessageSink>,
        events: EventHub,
        max_concurrent: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            shared: Arc::new(Shared {
                sink,
                events,
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                in_flight: AtomicUsize::new(0),
                cancel,
            }),
        }
    }

    /// Number of deliveries currently running.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Enqueue `message` and return its handle.
    ///
    /// The dispatcher starts on first use. Messages submitted after the
    /// connection is gone come back already cancelled.
    pub fn submit(&self, message: OutboundMessage) -> Arc<MessageAction> {
        let action = MessageAction::new(message, self.shared.cancel.clone());
        if self.shared.cancel.is_cancelled() {
            action.abort();
            return action;
        }

        self.ensure_worker();
        if self.tx.send(action.clone()).is_err() {
            action.abort();
        }
        action
    }

    fn ensure_worker(&self) {
        let rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(rx) = rx {
            tokio::spawn(run(self.shared.clone(), rx));
        }
    }
}

async fn run(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Arc<MessageAction>>) {
    loop {
        let action = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => break,
            action = rx.recv() => match action {
                Some(action) => action,
                None => break,
            },
        };

        let permit = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => {
                action.abort();
                break;
            }
            permit = shared.permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    action.abort();
                    break;
                }
            },
        };

        tokio::spawn(dispatch(shared.clone(), action, permit));
    }

    rx.close();
    let mut dropped = 0usize;
    while let Ok(action) = rx.try_recv() {
        action.abort();
        dropped += 1;
    }
    debug!(dropped, "Elastic queue stopped");
}

async fn dispatch(shared: Arc<Shared>, action: Arc<MessageAction>, _permit: OwnedSemaphorePermit) {
    if !action.start() {
        trace!("Skipping cancelled message");
        return;
    }

    let running = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    metrics::set_elastic_in_flight(running);

    let result = tokio::select! {
        () = shared.cancel.cancelled() => Err(ClientError::Cancelled),
        result = shared.sink.deliver(action.message()) => result,
    };

    let running = shared.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
    metrics::set_elastic_in_flight(running);

    match result {
        Ok(()) => action.complete(true),
        Err(e) if e.is_cancelled() => action.abort(),
        Err(e) => {
            action.complete(false);
            shared.events.report(e);
        }
    }
}
