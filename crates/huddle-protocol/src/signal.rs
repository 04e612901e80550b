//! Presence signals exchanged between peers.
//!
//! Presence travels as ordinary hub messages whose message type is one of
//! the reserved [`SignalKind`] names. Everything else is application data.

use crate::codec::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of the hub invocation carrying every envelope.
pub const SIGNAL_TARGET: &str = "SIGNAL";

/// Longest status timeout accepted from a peer, in seconds.
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

/// Presence status of a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerStatus {
    #[default]
    Online,
    Offline,
    Away,
    Busy,
    DoNotDisturb,
}

impl PeerStatus {
    /// All statuses, in wire order.
    pub const ALL: [PeerStatus; 5] = [
        PeerStatus::Online,
        PeerStatus::Offline,
        PeerStatus::Away,
        PeerStatus::Busy,
        PeerStatus::DoNotDisturb,
    ];

    /// Wire name of the status.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::Online => "Online",
            PeerStatus::Offline => "Offline",
            PeerStatus::Away => "Away",
            PeerStatus::Busy => "Busy",
            PeerStatus::DoNotDisturb => "DoNotDisturb",
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PeerStatus {
    type Err = ProtocolError;

    /// Parses a status name, ignoring case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| ProtocolError::Invalid(format!("unknown peer status '{s}'")))
    }
}

/// Reserved presence message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    /// Announces a peer joined. Payload: status timeout in seconds.
    IAmHere,
    /// Handshake reply. Payload: `["<seconds>", "<status>"]`.
    Hello,
    /// Announces a peer left. Empty payload.
    IAmOuttaHere,
    /// Heartbeat. Payload: status name.
    StillHere,
}

impl SignalKind {
    /// Wire message type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::IAmHere => "I_AM_HERE",
            SignalKind::Hello => "HELLO",
            SignalKind::IAmOuttaHere => "I_AM_OUTTA_HERE",
            SignalKind::StillHere => "STILL_HERE",
        }
    }

    /// Classify a message type, ignoring case.
    ///
    /// Returns `None` for application message types.
    #[must_use]
    pub fn from_message_type(message_type: &str) -> Option<Self> {
        [
            SignalKind::IAmHere,
            SignalKind::Hello,
            SignalKind::IAmOuttaHere,
            SignalKind::StillHere,
        ]
        .into_iter()
        .find(|kind| kind.as_str().eq_ignore_ascii_case(message_type))
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Encode an `I_AM_HERE` payload.
#[must_use]
pub fn encode_i_am_here(timeout_secs: u64) -> String {
    timeout_secs.to_string()
}

/// Parse an `I_AM_HERE` payload into a timeout in seconds.
///
/// # Errors
///
/// Returns an error if the payload is not a non-negative integer of at
/// most [`MAX_TIMEOUT_SECS`].
pub fn parse_i_am_here(payload: &str) -> Result<u64, ProtocolError> {
    parse_seconds(payload)
}

/// Encode a `HELLO` payload.
#[must_use]
pub fn encode_hello(timeout_secs: u64, status: PeerStatus) -> String {
    serde_json::json!([timeout_secs.to_string(), status.as_str()]).to_string()
}

/// Parse a `HELLO` payload into `(timeout_secs, status)`.
///
/// # Errors
///
/// Returns an error if the payload is not a two-element array of a
/// timeout and a status name.
pub fn parse_hello(payload: &str) -> Result<(u64, PeerStatus), ProtocolError> {
    let values: Vec<serde_json::Value> = serde_json::from_str(payload)?;
    let [timeout, status] = values.as_slice() else {
        return Err(ProtocolError::Invalid(format!(
            "HELLO expects 2 elements, got {}",
            values.len()
        )));
    };

    let timeout = match timeout {
        serde_json::Value::String(s) => parse_seconds(s)?,
        serde_json::Value::Number(n) => n
            .as_u64()
            .ok_or_else(|| ProtocolError::Invalid(format!("invalid timeout {n}")))
            .and_then(bounded)?,
        other => return Err(ProtocolError::Invalid(format!("invalid timeout {other}"))),
    };
    let status = status
        .as_str()
        .ok_or_else(|| ProtocolError::Invalid(format!("invalid status {status}")))?
        .parse()?;

    Ok((timeout, status))
}

/// Parse a `STILL_HERE` payload.
///
/// # Errors
///
/// Returns an error if the status name is unknown.
pub fn parse_still_here(payload: &str) -> Result<PeerStatus, ProtocolError> {
    // Payloads may arrive JSON-quoted.
    payload.trim().trim_matches('"').parse()
}

fn parse_seconds(value: &str) -> Result<u64, ProtocolError> {
    value
        .trim()
        .trim_matches('"')
        .parse()
        .map_err(|_| ProtocolError::Invalid(format!("invalid timeout '{value}'")))
        .and_then(bounded)
}

fn bounded(secs: u64) -> Result<u64, ProtocolError> {
    if secs > MAX_TIMEOUT_SECS {
        return Err(ProtocolError::Invalid(format!(
            "timeout {secs}s exceeds {MAX_TIMEOUT_SECS}s"
        )));
    }
    Ok(secs)
}
