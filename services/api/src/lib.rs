//! Parley API Library Crate
//!
//! This library contains the web-facing side of the assistant: configuration,
//! application state, HTTP handlers, the WebSocket session loop and routing.
//! The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
