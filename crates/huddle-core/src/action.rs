//! Handles for messages submitted to the elastic queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::message::OutboundMessage;

/// Lifecycle of a queued send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    /// Queued, not yet dispatched.
    Waiting,
    /// Delivery in progress.
    Started,
    /// Delivery finished, successfully or not.
    Completed,
    /// Cancelled before or during delivery.
    Cancelled,
}

impl ActionState {
    /// Whether no further transition is possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionState::Completed | ActionState::Cancelled)
    }
}

/// A message sent through the elastic queue.
///
/// The handle can be awaited, cancelled while still waiting, and inspected
/// after the fact.
#[derive(Debug)]
pub struct MessageAction {
    message: OutboundMessage,
    state: watch::Sender<ActionState>,
    succeeded: AtomicBool,
    connection: CancellationToken,
}

impl MessageAction {
    pub(crate) fn new(message: OutboundMessage, connection: CancellationToken) -> Arc<Self> {
        let (state, _) = watch::channel(ActionState::Waiting);
        Arc::new(Self {
            message,
            state,
            succeeded: AtomicBool::new(false),
            connection,
        })
    }

    /// The message this action delivers.
    #[must_use]
    pub fn message(&self) -> &OutboundMessage {
        &self.message
    }

    /// Current state. A waiting action reads as cancelled once the
    /// connection is gone.
    #[must_use]
    pub fn state(&self) -> ActionState {
        let state = *self.state.borrow();
        if state == ActionState::Waiting && self.connection.is_cancelled() {
            ActionState::Cancelled
        } else {
            state
        }
    }

    /// Whether delivery completed successfully.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.succeeded.load(Ordering::Acquire)
    }

    /// Whether the action reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Cancel the action if it has not been dispatched yet.
    ///
    /// Returns `false` once delivery started.
    pub fn cancel(&self) -> bool {
        self.transition(|state| *state == ActionState::Waiting, ActionState::Cancelled)
    }

    /// Wait until the action finishes and return its final state.
    pub async fn wait(&self) -> ActionState {
        let mut rx = self.state.subscribe();
        loop {
            let state = self.state();
            if state.is_terminal() {
                return state;
            }

            if state == ActionState::Waiting {
                tokio::select! {
                    _ = rx.changed() => {}
                    () = self.connection.cancelled() => {}
                }
            } else if rx.changed().await.is_err() {
                return self.state();
            }
        }
    }

    /// Waiting → Started. Returns `false` if the action was cancelled.
    pub(crate) fn start(&self) -> bool {
        self.transition(|state| *state == ActionState::Waiting, ActionState::Started)
    }

    /// Started → Completed.
    pub(crate) fn complete(&self, succeeded: bool) {
        self.succeeded.store(succeeded, Ordering::Release);
        self.transition(|state| *state == ActionState::Started, ActionState::Completed);
    }

    /// Any non-terminal state → Cancelled.
    pub(crate) fn abort(&self) {
        self.transition(|state| !state.is_terminal(), ActionState::Cancelled);
    }

    fn transition(&self, allowed: impl Fn(&ActionState) -> bool, next: ActionState) -> bool {
        self.state.send_if_modified(|state| {
            if allowed(state) {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}
