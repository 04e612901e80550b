//! # huddle-core
//!
//! Client-side signaling runtime for Huddle.
//!
//! - **SignalClient** - Session lifecycle: negotiate, hub link, teardown
//! - **TokenManager** - Short-lived message tokens, refreshed on demand
//! - **PresenceTracker** - Peer discovery, heartbeats and timeouts
//! - **ElasticQueue** - Bounded-concurrency fire-and-forget sends
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   SIGNAL    ┌─────────────┐   events   ┌─────────────┐
//! │  Hub link   │────────────▶│  Presence   │───────────▶│  EventHub   │
//! └─────────────┘             └─────────────┘            └─────────────┘
//!                                    │ HELLO / STILL_HERE
//!                                    ▼
//! ┌─────────────┐             ┌─────────────┐            ┌─────────────┐
//! │ ElasticQueue│────────────▶│  Messenger  │───────────▶│TransportPool│
//! └─────────────┘             └─────────────┘            └─────────────┘
//!                                    │
//!                                    ▼
//!                             ┌─────────────┐
//!                             │TokenManager │
//!                             └─────────────┘
//! ```

pub mod action;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod message;
pub mod messenger;
pub mod metrics;
pub mod peer;
pub mod presence;
pub mod queue;
pub mod token;

#[cfg(test)]
mod testing;

pub use action::{ActionState, MessageAction};
pub use client::{Credentials, SignalClient};
pub use config::ClientConfig;
pub use error::ClientError;
pub use events::{ClientEvent, EventHub};
pub use message::{send_important, MessageSink, OutboundMessage};
pub use peer::Peer;
pub use presence::PresenceTracker;
pub use queue::ElasticQueue;
pub use token::{MessageToken, TokenManager};

pub use huddle_protocol::PeerStatus;
