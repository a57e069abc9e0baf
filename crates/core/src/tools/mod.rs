//! Tool-server connections.
//!
//! Tool servers are external processes speaking the Model Context Protocol
//! over stdio. [`ToolServerManager`] owns every connection on a dedicated
//! worker thread; callers on other threads submit requests and block for the
//! result with a deadline.

pub mod config;
pub mod connection;
pub mod launcher;
pub mod manager;

pub use config::{ManagerTimeouts, ToolServerConfig};
pub use connection::{Capabilities, ConnectionState};
pub use launcher::{ChildProcessLauncher, McpClient, ToolServerLauncher};
pub use manager::ToolServerManager;

use crate::error::ToolServerError;
use rmcp::model::{Content, JsonObject, RawContent};
use serde_json::Value;

/// Name of the weather tool server.
pub const WEATHER_SERVER: &str = "weather";
/// Name of the financial tool server.
pub const FINANCIAL_SERVER: &str = "financial";

/// One content item returned by a tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolContent {
    Text(String),
    /// Images, embedded resources and anything else, kept as raw JSON.
    Opaque(Value),
}

impl From<Content> for ToolContent {
    fn from(content: Content) -> Self {
        match content.raw {
            RawContent::Text(text) => ToolContent::Text(text.text),
            other => ToolContent::Opaque(serde_json::to_value(&other).unwrap_or(Value::Null)),
        }
    }
}

/// Concatenates the text items of a tool result, one per line.
pub fn joined_text(contents: &[ToolContent]) -> String {
    contents
        .iter()
        .filter_map(|c| match c {
            ToolContent::Text(text) => Some(text.as_str()),
            ToolContent::Opaque(_) => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Blocking tool invocation, the seam the intent router calls through.
#[cfg_attr(test, mockall::automock)]
pub trait ToolInvoker: Send + Sync {
    fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: JsonObject,
    ) -> Result<Vec<ToolContent>, ToolServerError>;
}

impl ToolInvoker for ToolServerManager {
    fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: JsonObject,
    ) -> Result<Vec<ToolContent>, ToolServerError> {
        ToolServerManager::call_tool(self, server, tool, arguments)
    }
}
