//! # huddle-protocol
//!
//! Wire definitions shared by the Huddle signaling client.
//!
//! This crate has no I/O. It defines how identities are composed and
//! parsed, how presence signals are encoded, what the negotiation endpoints
//! return, and how hub messages are framed on the socket.
//!
//! ## Hub Messages
//!
//! - `Invocation` - Server-to-client method call (`SIGNAL` carries envelopes)
//! - `Ping` - Keepalive
//! - `Close` - The hub is closing the link
//!
//! ## Example
//!
//! ```rust
//! use huddle_protocol::{codec, Envelope, HubMessage, HubProtocol};
//!
//! let envelope = Envelope::new("mac1|alice+github.com/acme/eng", "CHAT", "hi");
//! let message = HubMessage::signal(&envelope);
//!
//! let encoded = codec::encode(&message, HubProtocol::MessagePack).unwrap();
//! let decoded = codec::decode(&encoded, HubProtocol::MessagePack).unwrap();
//! assert_eq!(decoded.as_signal(), Some(envelope));
//! ```

pub mod codec;
pub mod frames;
pub mod identity;
pub mod negotiate;
pub mod signal;
pub mod version;

pub use codec::{decode, encode, HubCodec, ProtocolError};
pub use frames::{Envelope, HubMessage, MessageType};
pub use identity::UserId;
pub use negotiate::{LinkNegotiation, NegotiateResponse};
pub use signal::{PeerStatus, SignalKind};
pub use version::{HubProtocol, PROTOCOL_VERSION};
