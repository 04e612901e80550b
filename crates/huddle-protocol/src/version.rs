//! Hub protocol selection and versioning.
//!
//! The protocol is chosen once per link by the handshake; both framings
//! carry the same [`HubMessage`](crate::HubMessage) set.

use serde::{Deserialize, Serialize};

/// Current hub protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire encoding of hub messages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HubProtocol {
    /// JSON objects terminated by a record separator. Sent as text frames.
    #[default]
    Json,
    /// Varint length-prefixed MessagePack arrays. Sent as binary frames.
    #[serde(rename = "messagepack")]
    MessagePack,
}

impl HubProtocol {
    /// Protocol name announced in the handshake.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            HubProtocol::Json => "json",
            HubProtocol::MessagePack => "messagepack",
        }
    }

    /// Whether messages travel in binary frames.
    #[must_use]
    pub fn is_binary(&self) -> bool {
        matches!(self, HubProtocol::MessagePack)
    }
}

impl std::fmt::Display for HubProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} v{}", self.name(), PROTOCOL_VERSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names() {
        assert_eq!(HubProtocol::Json.name(), "json");
        assert_eq!(HubProtocol::MessagePack.name(), "messagepack");
        assert!(HubProtocol::MessagePack.is_binary());
        assert!(!HubProtocol::default().is_binary());
    }

    #[test]
    fn test_protocol_display() {
        assert_eq!(HubProtocol::Json.to_string(), "json v1");
    }
}
