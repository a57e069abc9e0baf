//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the services shared
//! by every WebSocket session and HTTP handler.

use crate::config::Config;
use parley_core::{intent::IntentClassifier, router::IntentRouter, tools::ToolServerManager};
use std::sync::Arc;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub classifier: Arc<IntentClassifier>,
    pub router: Arc<IntentRouter>,
    pub tools: Arc<ToolServerManager>,
}
