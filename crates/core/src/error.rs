//! Error types shared across the core.

use std::time::Duration;

/// Failures of the tool-server connection manager.
///
/// These are returned as values from every call into the manager; nothing
/// in the manager panics or propagates across the worker boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ToolServerError {
    #[error("tool-server worker did not signal readiness within {0:?}")]
    StartupTimeout(Duration),
    #[error("tool-server worker failed to start: {0}")]
    StartupFailed(String),
    #[error("tool-server manager is not running")]
    NotRunning,
    #[error("unknown tool server: {0}")]
    UnknownServer(String),
    #[error("timed out connecting to tool server '{0}'")]
    ConnectTimeout(String),
    #[error("failed to connect to tool server '{server}': {reason}")]
    ConnectFailed { server: String, reason: String },
    #[error("tool server '{0}' is not connected")]
    NotConnected(String),
    #[error("tool call timed out: {tool}")]
    ToolTimeout { tool: String },
    #[error("tool '{tool}' failed: {message}")]
    ToolError { tool: String, message: String },
    #[error("reading resource '{uri}' failed: {message}")]
    ResourceError { uri: String, message: String },
}

impl ToolServerError {
    /// True when the failure happened while establishing the connection.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            ToolServerError::ConnectTimeout(_)
                | ToolServerError::ConnectFailed { .. }
                | ToolServerError::NotConnected(_)
        )
    }
}

/// Failures of the HTTP backends (weather, retrieval).
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("location not found: {0}")]
    LocationNotFound(String),
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            BackendError::Malformed(err.to_string())
        } else {
            BackendError::Unavailable(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_failures_are_classified() {
        assert!(ToolServerError::ConnectTimeout("weather".into()).is_connect_failure());
        assert!(
            ToolServerError::ConnectFailed {
                server: "weather".into(),
                reason: "spawn failed".into()
            }
            .is_connect_failure()
        );
        assert!(
            !ToolServerError::ToolTimeout {
                tool: "query_weather".into()
            }
            .is_connect_failure()
        );
    }

    #[test]
    fn test_tool_timeout_display_names_tool() {
        let err = ToolServerError::ToolTimeout {
            tool: "query_financial_data".into(),
        };
        assert_eq!(err.to_string(), "tool call timed out: query_financial_data");
    }
}
