//! Parley Core
//!
//! The orchestration core of the voice assistant: tool-server connections
//! driven from a dedicated worker, intent classification and routing, and the
//! cancellable response stream that turns model output into client events.

pub mod assistant;
pub mod conversation;
pub mod error;
pub mod intent;
pub mod llm_client;
pub mod prompts;
pub mod retrieval;
pub mod router;
pub mod stream;
pub mod tools;
pub mod weather;

use serde::Serialize;
use std::fmt;

/// The kind of input that started a turn.
///
/// The front end echoes this back on audio and end-of-speech events so the
/// client can tell which input a response belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// Recorded speech, delivered as base64 WAV.
    Audio,
    /// Typed text.
    Text,
    /// An image with an optional text description.
    Image,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputKind::Audio => write!(f, "audio"),
            InputKind::Text => write!(f, "text"),
            InputKind::Image => write!(f, "image"),
        }
    }
}
