//! Hub message types.
//!
//! The hub speaks a small invocation protocol: the server invokes named
//! client methods (`SIGNAL` for every envelope), and both sides exchange
//! keepalive pings and a final close message.

use crate::signal::SIGNAL_TARGET;
use serde_json::Value;

/// Hub message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
}

impl From<MessageType> for u8 {
    fn from(mt: MessageType) -> u8 {
        mt as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            1 => Ok(MessageType::Invocation),
            2 => Ok(MessageType::StreamItem),
            3 => Ok(MessageType::Completion),
            4 => Ok(MessageType::StreamInvocation),
            5 => Ok(MessageType::CancelInvocation),
            6 => Ok(MessageType::Ping),
            7 => Ok(MessageType::Close),
            _ => Err("Invalid hub message type"),
        }
    }
}

/// A message exchanged over the hub link.
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    /// Invoke a named method on the other side.
    Invocation {
        /// Set when the caller expects a completion.
        invocation_id: Option<String>,
        /// Method name.
        target: String,
        /// Positional arguments.
        arguments: Vec<Value>,
    },

    /// Keepalive.
    Ping,

    /// The other side is closing the link.
    Close {
        /// Reason, if the close was caused by an error.
        error: Option<String>,
        /// Whether the server allows reconnecting.
        allow_reconnect: bool,
    },

    /// A message type the client does not act on.
    Other {
        /// Raw type identifier.
        message_type: u8,
    },
}

impl HubMessage {
    /// Get the raw message type identifier.
    #[must_use]
    pub fn type_id(&self) -> u8 {
        match self {
            HubMessage::Invocation { .. } => MessageType::Invocation.into(),
            HubMessage::Ping => MessageType::Ping.into(),
            HubMessage::Close { .. } => MessageType::Close.into(),
            HubMessage::Other { message_type } => *message_type,
        }
    }

    /// Create a non-blocking invocation.
    #[must_use]
    pub fn invocation(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        HubMessage::Invocation {
            invocation_id: None,
            target: target.into(),
            arguments,
        }
    }

    /// Create a `SIGNAL` invocation carrying an envelope.
    #[must_use]
    pub fn signal(envelope: &Envelope) -> Self {
        Self::invocation(
            SIGNAL_TARGET,
            vec![
                Value::String(envelope.sender_id.clone()),
                Value::String(envelope.message_type.clone()),
                Value::String(envelope.payload.clone()),
            ],
        )
    }

    /// Create a Ping message.
    #[must_use]
    pub fn ping() -> Self {
        HubMessage::Ping
    }

    /// Create a Close message.
    #[must_use]
    pub fn close(error: Option<String>) -> Self {
        HubMessage::Close {
            error,
            allow_reconnect: false,
        }
    }

    /// Extract the envelope if this is a `SIGNAL` invocation.
    ///
    /// The target is matched ignoring case; invocations with fewer than three
    /// arguments are not envelopes.
    #[must_use]
    pub fn as_signal(&self) -> Option<Envelope> {
        match self {
            HubMessage::Invocation {
                target, arguments, ..
            } if target.eq_ignore_ascii_case(SIGNAL_TARGET) && arguments.len() >= 3 => {
                Some(Envelope {
                    sender_id: argument_string(&arguments[0]),
                    message_type: argument_string(&arguments[1]),
                    payload: argument_string(&arguments[2]),
                })
            }
            _ => None,
        }
    }
}

/// One application or presence message delivered through the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Full user id of the sender.
    pub sender_id: String,
    /// Message type (presence signal name or application-defined).
    pub message_type: String,
    /// Payload as sent, JSON or plain text.
    pub payload: String,
}

impl Envelope {
    /// Create a new envelope.
    #[must_use]
    pub fn new(
        sender_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            message_type: message_type.into(),
            payload: payload.into(),
        }
    }
}

fn argument_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
