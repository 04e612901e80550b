//! Outbound messages and the delivery seam.

use async_trait::async_trait;
use tracing::debug;

use crate::error::ClientError;

/// An application or presence message addressed to a user or group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// User id or group id.
    pub recipient: String,
    /// Whether `recipient` names a group.
    pub group: bool,
    /// Message type.
    pub message_type: String,
    /// Payload.
    pub payload: String,
    /// Whether `payload` is already JSON.
    pub payload_is_json: bool,
}

impl OutboundMessage {
    /// Address a single user (all of their devices when given a user group).
    #[must_use]
    pub fn to_user(
        recipient: impl Into<String>,
        message_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            group: false,
            message_type: message_type.into(),
            payload: payload.into(),
            payload_is_json: false,
        }
    }

    /// Address a group.
    #[must_use]
    pub fn to_group(
        recipient: impl Into<String>,
        message_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            group: true,
            ..Self::to_user(recipient, message_type, payload)
        }
    }

    /// Mark the payload as JSON, sent as-is.
    #[must_use]
    pub fn json(mut self) -> Self {
        self.payload_is_json = true;
        self
    }

    /// Request body for the send endpoint.
    ///
    /// JSON payloads go as-is; anything else is sent as a JSON string.
    #[must_use]
    pub fn body(&self) -> String {
        if self.payload_is_json {
            self.payload.clone()
        } else {
            serde_json::Value::String(self.payload.clone()).to_string()
        }
    }
}

/// Delivers outbound messages.
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Make one delivery attempt.
    async fn deliver(&self, message: &OutboundMessage) -> Result<(), ClientError>;
}

/// Deliver `message` with up to `tries` attempts, stopping at the first
/// success. Cancellation ends the attempts immediately.
///
/// # Errors
///
/// Returns the last attempt's error.
pub async fn send_important(
    sink: &dyn MessageSink,
    message: &OutboundMessage,
    tries: u32,
) -> Result<(), ClientError> {
    let mut attempt = 1;
    loop {
        match sink.deliver(message).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_cancelled() || attempt >= tries => return Err(e),
            Err(e) => {
                debug!(
                    attempt,
                    message_type = %message.message_type,
                    error = %e,
                    "Important message failed, retrying"
                );
                attempt += 1;
            }
        }
    }
}
