use super::config::ToolServerConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rmcp::{
    ServiceExt,
    service::{RoleClient, RunningService},
    transport::TokioChildProcess,
};
use tokio::process::Command;
use tracing::debug;

/// A live client session with one tool server.
pub type McpClient = RunningService<RoleClient, ()>;

/// Starts a tool server and completes the protocol handshake with it.
#[async_trait]
pub trait ToolServerLauncher: Send + Sync {
    async fn launch(&self, config: &ToolServerConfig) -> Result<McpClient>;
}

/// Launches each tool server as a child process speaking over stdio.
///
/// The child is killed when the session is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChildProcessLauncher;

#[async_trait]
impl ToolServerLauncher for ChildProcessLauncher {
    async fn launch(&self, config: &ToolServerConfig) -> Result<McpClient> {
        debug!(server = %config.name, command = %config.command, args = ?config.args, "Spawning tool server");
        let mut command = Command::new(&config.command);
        command.args(&config.args).kill_on_drop(true);

        let transport = TokioChildProcess::new(command)
            .with_context(|| format!("Failed to spawn '{}'", config.command))?;
        let client = ()
            .serve(transport)
            .await
            .with_context(|| format!("Handshake with tool server '{}' failed", config.name))?;
        Ok(client)
    }
}
