use std::time::Duration;

/// Identity and launch command of one tool server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub description: String,
}

impl ToolServerConfig {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            description: description.into(),
        }
    }

    /// Builds a config from a whitespace-separated command line such as
    /// `python mcpserver/FinancialMCPServer.py`. Returns `None` for a blank line.
    pub fn from_command_line(
        name: impl Into<String>,
        command_line: &str,
        description: impl Into<String>,
    ) -> Option<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_owned);
        let command = parts.next()?;
        Some(Self::new(name, command, parts.collect(), description))
    }
}

/// Deadlines applied by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerTimeouts {
    /// Wait for the worker thread to signal readiness.
    pub startup: Duration,
    /// Launch, handshake and capability discovery of one server.
    pub connect: Duration,
    /// One tool call or resource read.
    pub tool_call: Duration,
    /// Graceful disconnect of all servers during shutdown.
    pub disconnect: Duration,
    /// Joining the worker thread after shutdown.
    pub join: Duration,
}

impl Default for ManagerTimeouts {
    fn default() -> Self {
        Self {
            startup: Duration::from_secs(3),
            connect: Duration::from_secs(3),
            tool_call: Duration::from_secs(2),
            disconnect: Duration::from_secs(5),
            join: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_is_split_into_program_and_args() {
        let config =
            ToolServerConfig::from_command_line("financial", "python  mcpserver/Fin.py --verbose", "")
                .unwrap();
        assert_eq!(config.command, "python");
        assert_eq!(config.args, vec!["mcpserver/Fin.py", "--verbose"]);
    }

    #[test]
    fn test_blank_command_line_is_rejected() {
        assert!(ToolServerConfig::from_command_line("weather", "   ", "").is_none());
    }
}
