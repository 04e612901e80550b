//! Client error taxonomy.

use huddle_protocol::ProtocolError;
use huddle_transport::TransportError;
use thiserror::Error;

/// Errors surfaced by the signaling client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The negotiation endpoint failed or refused the credentials.
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// A message token could not be obtained.
    #[error("Message token request failed: {0}")]
    Token(String),

    /// An outbound call failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// A payload or identity could not be parsed.
    #[error("Protocol error: {0}")]
    ProtocolParse(#[from] ProtocolError),

    /// Credentials contain reserved delimiter characters.
    #[error("Invalid credentials: {0}")]
    InvalidCredentials(String),

    /// The recipient is outside the sender's team scope.
    #[error("Recipient {0} is outside this team")]
    InvalidRecipient(String),

    /// The connection was torn down while the operation was pending.
    #[error("Operation cancelled")]
    Cancelled,

    /// No session is established.
    #[error("Not connected")]
    NotConnected,
}

impl ClientError {
    /// Whether this failure was caused by connection cancellation.
    ///
    /// Cancelled failures are never reported as events.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ClientError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ClientError::from(TransportError::Status {
            status: 500,
            body: "boom".into(),
        });
        assert_eq!(
            err.to_string(),
            "Transport error: HTTP request failed with 500. boom"
        );
        assert!(!err.is_cancelled());
        assert!(ClientError::Cancelled.is_cancelled());
    }
}
