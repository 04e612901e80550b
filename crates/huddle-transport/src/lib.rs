//! # huddle-transport
//!
//! Outbound transports for the Huddle signaling client.
//!
//! - **HTTP** - Request/response calls to the negotiation and message
//!   endpoints, made through a self-recycling [`TransportPool`]
//! - **Hub link** - The long-lived socket delivering hub messages
//!
//! ## Transport Abstraction
//!
//! Both sides sit behind traits so the runtime can be driven by in-process
//! doubles in tests:
//!
//! ```rust,ignore
//! use huddle_transport::{HttpRequest, TransportPool};
//!
//! async fn post(pool: &TransportPool) {
//!     let response = pool.send(HttpRequest::post("/api/Message")).await;
//! }
//! ```

pub mod pool;
pub mod traits;

#[cfg(feature = "reqwest-backend")]
pub mod http;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use pool::{PoolConfig, TransportPool};
pub use traits::{
    BackendFactory, HttpBackend, HttpRequest, HttpResponse, HubConnector, HubLink, Method,
    TransportError,
};

#[cfg(feature = "reqwest-backend")]
pub use http::{ReqwestBackend, ReqwestFactory};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketHubConnector, WebSocketHubLink};
