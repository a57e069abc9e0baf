//! WebSocket Session Management
//!
//! - `protocol`: the JSON message format between client and server.
//! - `session`: the connection lifecycle and the per-turn event forwarding.

pub mod protocol;
pub mod session;

pub use session::ws_handler;
