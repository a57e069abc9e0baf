//! One tool-server connection, run as a task on the manager's worker runtime.
//!
//! The task owns the client session. Requests arrive through a mailbox and
//! are answered on per-request reply channels the caller blocks on; the
//! connection state is published through a watch channel so the worker can
//! read it without a round trip.

use super::{
    ToolContent, joined_text,
    config::{ManagerTimeouts, ToolServerConfig},
    launcher::{McpClient, ToolServerLauncher},
};
use crate::error::ToolServerError;
use rmcp::{
    ServiceError,
    model::{CallToolRequestParam, JsonObject, ReadResourceRequestParam, ResourceContents},
};
use std::{
    sync::{Arc, mpsc::SyncSender},
    time::Instant,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument, debug, error, info, info_span, warn};

/// Lifecycle of a tool-server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Failed,
}

/// Tool and resource names advertised by a connected server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub tools: Vec<String>,
    pub resources: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct ConnectionStatus {
    pub state: ConnectionState,
    pub capabilities: Capabilities,
}

pub(crate) type Reply<T> = SyncSender<Result<T, ToolServerError>>;

pub(crate) enum ConnectionRequest {
    Connect {
        reply: Reply<()>,
    },
    CallTool {
        tool: String,
        arguments: JsonObject,
        reply: Reply<Vec<ToolContent>>,
    },
    ReadResource {
        uri: String,
        reply: Reply<String>,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

impl ConnectionRequest {
    /// Answers the request with `err` without touching the server.
    pub(crate) fn reject(self, err: ToolServerError) {
        match self {
            ConnectionRequest::Connect { reply } => {
                let _ = reply.try_send(Err(err));
            }
            ConnectionRequest::CallTool { reply, .. } => {
                let _ = reply.try_send(Err(err));
            }
            ConnectionRequest::ReadResource { reply, .. } => {
                let _ = reply.try_send(Err(err));
            }
            ConnectionRequest::Disconnect { done } => {
                let _ = done.send(());
            }
        }
    }
}

/// The worker's handle on a running connection task.
pub(crate) struct ConnectionHandle {
    pub id: u64,
    mailbox: mpsc::UnboundedSender<ConnectionRequest>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
    /// Spawns the connection task on the current runtime.
    ///
    /// When the task gives up after a failure it sends `(name, id)` on
    /// `exited` so the worker can drop the registry entry.
    pub fn spawn(
        id: u64,
        config: ToolServerConfig,
        launcher: Arc<dyn ToolServerLauncher>,
        timeouts: ManagerTimeouts,
        exited: mpsc::UnboundedSender<(String, u64)>,
    ) -> Self {
        let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus {
            state: ConnectionState::Disconnected,
            capabilities: Capabilities::default(),
        });
        let span = info_span!("tool_server", server = %config.name, connection_id = id);
        let connection = Connection {
            id,
            config,
            launcher,
            timeouts,
            client: None,
            status: status_tx,
            exited,
        };
        tokio::spawn(connection.run(mailbox_rx).instrument(span));
        Self {
            id,
            mailbox: mailbox_tx,
            status: status_rx,
        }
    }

    /// Queues a request. Gives the request back if the task has exited.
    pub fn send(&self, request: ConnectionRequest) -> Result<(), ConnectionRequest> {
        self.mailbox.send(request).map_err(|e| e.0)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }
}

struct Connection {
    id: u64,
    config: ToolServerConfig,
    launcher: Arc<dyn ToolServerLauncher>,
    timeouts: ManagerTimeouts,
    client: Option<McpClient>,
    status: watch::Sender<ConnectionStatus>,
    exited: mpsc::UnboundedSender<(String, u64)>,
}

impl Connection {
    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<ConnectionRequest>) {
        let mut failed = false;
        while let Some(request) = mailbox.recv().await {
            match request {
                ConnectionRequest::Connect { reply } => {
                    let result = self.connect().await;
                    failed = result.is_err();
                    let _ = reply.try_send(result);
                }
                ConnectionRequest::CallTool {
                    tool,
                    arguments,
                    reply,
                } => {
                    let result = self.call_tool(tool, arguments).await;
                    let _ = reply.try_send(result);
                }
                ConnectionRequest::ReadResource { uri, reply } => {
                    let result = self.read_resource(uri).await;
                    let _ = reply.try_send(result);
                }
                ConnectionRequest::Disconnect { done } => {
                    self.disconnect().await;
                    let _ = done.send(());
                    return;
                }
            }
            if failed || self.state() == ConnectionState::Failed {
                failed = true;
                break;
            }
        }

        if failed {
            mailbox.close();
            while let Ok(request) = mailbox.try_recv() {
                request.reject(ToolServerError::NotConnected(self.config.name.clone()));
            }
            if let Some(client) = self.client.take() {
                let _ = client.cancel().await;
            }
            let _ = self.exited.send((self.config.name.clone(), self.id));
            debug!("Connection task exited after failure");
        } else {
            // Registry dropped the handle.
            self.disconnect().await;
        }
    }

    fn state(&self) -> ConnectionState {
        self.status.borrow().state
    }

    fn publish(&self, state: ConnectionState, capabilities: Option<Capabilities>) {
        self.status.send_modify(|status| {
            status.state = state;
            if let Some(capabilities) = capabilities {
                status.capabilities = capabilities;
            }
        });
    }

    async fn connect(&mut self) -> Result<(), ToolServerError> {
        if self.state() == ConnectionState::Connected {
            debug!("Already connected");
            return Ok(());
        }
        self.publish(ConnectionState::Connecting, None);
        let started = Instant::now();
        let name = self.config.name.clone();

        let outcome = tokio::time::timeout(self.timeouts.connect, self.handshake()).await;
        match outcome {
            Ok(Ok((client, capabilities))) => {
                info!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    tools = ?capabilities.tools,
                    resources = capabilities.resources.len(),
                    "Connected to tool server"
                );
                self.client = Some(client);
                self.publish(ConnectionState::Connected, Some(capabilities));
                Ok(())
            }
            Ok(Err(e)) => {
                error!(error = ?e, "Failed to connect to tool server");
                self.publish(ConnectionState::Failed, Some(Capabilities::default()));
                Err(ToolServerError::ConnectFailed {
                    server: name,
                    reason: format!("{e:#}"),
                })
            }
            Err(_) => {
                error!(timeout = ?self.timeouts.connect, "Timed out connecting to tool server");
                self.publish(ConnectionState::Failed, Some(Capabilities::default()));
                Err(ToolServerError::ConnectTimeout(name))
            }
        }
    }

    async fn handshake(&self) -> anyhow::Result<(McpClient, Capabilities)> {
        let client = self.launcher.launch(&self.config).await?;
        let capabilities = fetch_capabilities(&client).await;
        Ok((client, capabilities))
    }

    async fn call_tool(
        &mut self,
        tool: String,
        arguments: JsonObject,
    ) -> Result<Vec<ToolContent>, ToolServerError> {
        let Some(client) = self.client.as_ref() else {
            return Err(ToolServerError::NotConnected(self.config.name.clone()));
        };
        let started = Instant::now();
        let request = CallToolRequestParam {
            name: tool.clone().into(),
            arguments: Some(arguments),
        };
        let outcome = tokio::time::timeout(self.timeouts.tool_call, client.peer().call_tool(request)).await;

        let result = match outcome {
            Err(_) => {
                warn!(%tool, timeout = ?self.timeouts.tool_call, "Tool call timed out");
                return Err(ToolServerError::ToolTimeout { tool });
            }
            Ok(Err(err)) => {
                if is_transport_closed(&err) {
                    warn!(%tool, "Transport closed during tool call");
                    self.publish(ConnectionState::Failed, Some(Capabilities::default()));
                }
                return Err(ToolServerError::ToolError {
                    tool,
                    message: err.to_string(),
                });
            }
            Ok(Ok(result)) => result,
        };

        let contents: Vec<ToolContent> = result
            .content
            .unwrap_or_default()
            .into_iter()
            .map(ToolContent::from)
            .collect();
        debug!(
            %tool,
            elapsed_ms = started.elapsed().as_millis() as u64,
            items = contents.len(),
            "Tool call returned"
        );
        if result.is_error.unwrap_or(false) {
            return Err(ToolServerError::ToolError {
                tool,
                message: joined_text(&contents),
            });
        }
        Ok(contents)
    }

    async fn read_resource(&mut self, uri: String) -> Result<String, ToolServerError> {
        let Some(client) = self.client.as_ref() else {
            return Err(ToolServerError::NotConnected(self.config.name.clone()));
        };
        let request = ReadResourceRequestParam { uri: uri.clone() };
        let outcome =
            tokio::time::timeout(self.timeouts.tool_call, client.peer().read_resource(request)).await;

        match outcome {
            Err(_) => Err(ToolServerError::ResourceError {
                uri,
                message: format!("timed out after {:?}", self.timeouts.tool_call),
            }),
            Ok(Err(err)) => {
                if is_transport_closed(&err) {
                    self.publish(ConnectionState::Failed, Some(Capabilities::default()));
                }
                Err(ToolServerError::ResourceError {
                    uri,
                    message: err.to_string(),
                })
            }
            Ok(Ok(result)) => Ok(result
                .contents
                .into_iter()
                .filter_map(|contents| match contents {
                    ResourceContents::TextResourceContents { text, .. } => Some(text),
                    ResourceContents::BlobResourceContents { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n")),
        }
    }

    async fn disconnect(&mut self) {
        let Some(client) = self.client.take() else {
            self.publish(ConnectionState::Disconnected, Some(Capabilities::default()));
            return;
        };
        self.publish(ConnectionState::Disconnecting, None);
        match client.cancel().await {
            Ok(reason) => debug!(?reason, "Tool-server session closed"),
            Err(e) => warn!(error = %e, "Tool-server session did not close cleanly"),
        }
        self.publish(ConnectionState::Disconnected, Some(Capabilities::default()));
        info!("Disconnected from tool server");
    }
}

async fn fetch_capabilities(client: &McpClient) -> Capabilities {
    let tools = match client.peer().list_all_tools().await {
        Ok(tools) => tools.into_iter().map(|tool| tool.name.to_string()).collect(),
        Err(e) => {
            warn!(error = %e, "Failed to list tools");
            Vec::new()
        }
    };
    let resources = match client.peer().list_all_resources().await {
        Ok(resources) => resources.into_iter().map(|r| r.raw.uri).collect(),
        Err(e) => {
            debug!(error = %e, "Server did not list resources");
            Vec::new()
        }
    };
    Capabilities { tools, resources }
}

fn is_transport_closed(err: &ServiceError) -> bool {
    matches!(err, ServiceError::TransportClosed | ServiceError::TransportSend(_))
}
