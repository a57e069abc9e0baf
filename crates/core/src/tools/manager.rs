//! The tool-server connection manager.
//!
//! All sessions live on one worker thread running a single-threaded async
//! runtime. The public methods are blocking and may be called from any
//! thread; each one submits a command to the worker and waits for the reply
//! with a deadline, so a stalled server can never hang the caller.

use super::{
    ToolContent,
    config::{ManagerTimeouts, ToolServerConfig},
    connection::{
        Capabilities, ConnectionHandle, ConnectionRequest, ConnectionState, ConnectionStatus, Reply,
    },
    launcher::ToolServerLauncher,
};
use crate::error::ToolServerError;
use rmcp::model::JsonObject;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        mpsc::{self as std_mpsc, RecvTimeoutError},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

enum Command {
    Connect {
        server: String,
        reply: Reply<()>,
    },
    Disconnect {
        server: String,
        reply: Reply<()>,
    },
    CallTool {
        server: String,
        tool: String,
        arguments: JsonObject,
        reply: Reply<Vec<ToolContent>>,
    },
    ReadResource {
        server: String,
        uri: String,
        reply: Reply<String>,
    },
    Snapshot {
        reply: std_mpsc::SyncSender<HashMap<String, ConnectionStatus>>,
    },
    Shutdown,
}

struct Worker {
    commands: mpsc::UnboundedSender<Command>,
    thread: JoinHandle<()>,
    exited: std_mpsc::Receiver<()>,
}

enum Answer<T> {
    Ready(Result<T, ToolServerError>),
    TimedOut,
    Dropped,
}

/// Owns the tool-server sessions and serializes all access to them.
pub struct ToolServerManager {
    configs: HashMap<String, ToolServerConfig>,
    launcher: Arc<dyn ToolServerLauncher>,
    timeouts: ManagerTimeouts,
    worker: Mutex<Option<Worker>>,
}

impl ToolServerManager {
    pub fn new(
        configs: Vec<ToolServerConfig>,
        launcher: Arc<dyn ToolServerLauncher>,
        timeouts: ManagerTimeouts,
    ) -> Self {
        let configs = configs
            .into_iter()
            .map(|config| (config.name.clone(), config))
            .collect();
        Self {
            configs,
            launcher,
            timeouts,
            worker: Mutex::new(None),
        }
    }

    /// Names of the configured servers, in no particular order.
    pub fn server_names(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    /// Starts the worker thread and waits for it to report readiness.
    ///
    /// Calling `start` on a running manager is a no-op.
    pub fn start(&self) -> Result<(), ToolServerError> {
        let mut worker = self.lock_worker();
        if worker.is_some() {
            debug!("Tool-server worker already running");
            return Ok(());
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), String>>(1);
        let (exited_tx, exited_rx) = std_mpsc::channel();
        let (registry, reaped) =
            Registry::new(self.configs.clone(), self.launcher.clone(), self.timeouts);

        let thread = std::thread::Builder::new()
            .name("tool-server-worker".to_owned())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(async move {
                        let _ = ready_tx.send(Ok(()));
                        registry.run(commands_rx, reaped).await;
                    }),
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                    }
                }
                let _ = exited_tx.send(());
            })
            .map_err(|e| ToolServerError::StartupFailed(e.to_string()))?;

        match ready_rx.recv_timeout(self.timeouts.startup) {
            Ok(Ok(())) => {
                info!(servers = self.configs.len(), "Tool-server worker started");
                *worker = Some(Worker {
                    commands: commands_tx,
                    thread,
                    exited: exited_rx,
                });
                Ok(())
            }
            Ok(Err(reason)) => {
                error!(%reason, "Tool-server worker failed to start");
                Err(ToolServerError::StartupFailed(reason))
            }
            Err(_) => {
                error!(timeout = ?self.timeouts.startup, "Tool-server worker did not become ready");
                Err(ToolServerError::StartupTimeout(self.timeouts.startup))
            }
        }
    }

    /// Disconnects every server and stops the worker.
    ///
    /// Waits a bounded time for the worker to exit; a worker that overruns is
    /// logged and left detached. Calling `stop` when not running is a no-op.
    pub fn stop(&self) {
        let Some(worker) = self.lock_worker().take() else {
            return;
        };
        let _ = worker.commands.send(Command::Shutdown);
        drop(worker.commands);

        let deadline = self.timeouts.disconnect + self.timeouts.join;
        match worker.exited.recv_timeout(deadline) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    error!("Tool-server worker panicked");
                }
                info!("Tool-server worker stopped");
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout = ?deadline, "Tool-server worker did not exit in time; detaching");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_worker().is_some()
    }

    /// Connects to `server`, launching it if needed.
    ///
    /// Idempotent: a server that is already connected is not relaunched.
    pub fn connect(&self, server: &str) -> Result<(), ToolServerError> {
        self.ensure_known(server)?;
        let started = Instant::now();
        let answer = self.request(self.timeouts.connect, |reply| Command::Connect {
            server: server.to_owned(),
            reply,
        })?;
        let result = match answer {
            Answer::Ready(result) => result,
            Answer::TimedOut => Err(ToolServerError::ConnectTimeout(server.to_owned())),
            Answer::Dropped => Err(ToolServerError::NotConnected(server.to_owned())),
        };
        debug!(
            server,
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Connect finished"
        );
        result
    }

    /// Disconnects from `server`. Unknown or already-disconnected servers are
    /// a no-op; teardown errors are logged and swallowed.
    pub fn disconnect(&self, server: &str) {
        let answer = self.request(self.timeouts.disconnect, |reply| Command::Disconnect {
            server: server.to_owned(),
            reply,
        });
        match answer {
            Ok(Answer::Ready(_)) => debug!(server, "Disconnected"),
            Ok(Answer::TimedOut) => warn!(server, "Disconnect did not finish in time"),
            Ok(Answer::Dropped) => warn!(server, "Disconnect request dropped"),
            Err(e) => debug!(server, error = %e, "Disconnect skipped"),
        }
    }

    /// Calls `tool` on `server`, connecting first if needed.
    ///
    /// Returns within roughly connect + call deadline regardless of how the
    /// server behaves.
    pub fn call_tool(
        &self,
        server: &str,
        tool: &str,
        arguments: JsonObject,
    ) -> Result<Vec<ToolContent>, ToolServerError> {
        let started = Instant::now();
        self.connect(server)?;
        let answer = self.request(self.timeouts.tool_call, |reply| Command::CallTool {
            server: server.to_owned(),
            tool: tool.to_owned(),
            arguments,
            reply,
        })?;
        let result = match answer {
            Answer::Ready(result) => result,
            Answer::TimedOut => Err(ToolServerError::ToolTimeout {
                tool: tool.to_owned(),
            }),
            Answer::Dropped => Err(ToolServerError::NotConnected(server.to_owned())),
        };
        match &result {
            Ok(contents) => info!(
                server,
                tool,
                items = contents.len(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Tool call succeeded"
            ),
            Err(e) => warn!(
                server,
                tool,
                error = %e,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Tool call failed"
            ),
        }
        result
    }

    /// Reads a resource from `server`, connecting first if needed.
    pub fn read_resource(&self, server: &str, uri: &str) -> Result<String, ToolServerError> {
        self.connect(server)?;
        let answer = self.request(self.timeouts.tool_call, |reply| Command::ReadResource {
            server: server.to_owned(),
            uri: uri.to_owned(),
            reply,
        })?;
        match answer {
            Answer::Ready(result) => result,
            Answer::TimedOut => Err(ToolServerError::ResourceError {
                uri: uri.to_owned(),
                message: format!("timed out after {:?}", self.timeouts.tool_call),
            }),
            Answer::Dropped => Err(ToolServerError::NotConnected(server.to_owned())),
        }
    }

    /// Tool names of every connected server.
    pub fn available_tools(&self) -> HashMap<String, Vec<String>> {
        self.snapshot()
            .into_iter()
            .filter(|(_, status)| status.state == ConnectionState::Connected)
            .map(|(name, status)| (name, status.capabilities.tools))
            .collect()
    }

    /// Capabilities of `server` when it is connected.
    pub fn capabilities(&self, server: &str) -> Option<Capabilities> {
        self.snapshot()
            .remove(server)
            .filter(|status| status.state == ConnectionState::Connected)
            .map(|status| status.capabilities)
    }

    pub fn connection_state(&self, server: &str) -> ConnectionState {
        self.snapshot()
            .remove(server)
            .map_or(ConnectionState::Disconnected, |status| status.state)
    }

    fn snapshot(&self) -> HashMap<String, ConnectionStatus> {
        let Ok(commands) = self.commands() else {
            return HashMap::new();
        };
        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        if commands.send(Command::Snapshot { reply: reply_tx }).is_err() {
            return HashMap::new();
        }
        reply_rx
            .recv_timeout(self.timeouts.tool_call)
            .unwrap_or_default()
    }

    fn ensure_known(&self, server: &str) -> Result<(), ToolServerError> {
        if self.configs.contains_key(server) {
            Ok(())
        } else {
            Err(ToolServerError::UnknownServer(server.to_owned()))
        }
    }

    fn commands(&self) -> Result<mpsc::UnboundedSender<Command>, ToolServerError> {
        self.lock_worker()
            .as_ref()
            .map(|worker| worker.commands.clone())
            .ok_or(ToolServerError::NotRunning)
    }

    fn request<T>(
        &self,
        timeout: Duration,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<Answer<T>, ToolServerError> {
        let commands = self.commands()?;
        let (reply_tx, reply_rx) = std_mpsc::sync_channel(1);
        commands
            .send(build(reply_tx))
            .map_err(|_| ToolServerError::NotRunning)?;
        Ok(match reply_rx.recv_timeout(timeout) {
            Ok(result) => Answer::Ready(result),
            Err(RecvTimeoutError::Timeout) => Answer::TimedOut,
            Err(RecvTimeoutError::Disconnected) => Answer::Dropped,
        })
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ToolServerManager {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Worker-side state: the connection registry.
struct Registry {
    configs: HashMap<String, ToolServerConfig>,
    launcher: Arc<dyn ToolServerLauncher>,
    timeouts: ManagerTimeouts,
    connections: HashMap<String, ConnectionHandle>,
    next_id: u64,
    exited_tx: mpsc::UnboundedSender<(String, u64)>,
}

impl Registry {
    fn new(
        configs: HashMap<String, ToolServerConfig>,
        launcher: Arc<dyn ToolServerLauncher>,
        timeouts: ManagerTimeouts,
    ) -> (Self, mpsc::UnboundedReceiver<(String, u64)>) {
        let (exited_tx, exited_rx) = mpsc::unbounded_channel();
        (
            Self {
                configs,
                launcher,
                timeouts,
                connections: HashMap::new(),
                next_id: 0,
                exited_tx,
            },
            exited_rx,
        )
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut exited: mpsc::UnboundedReceiver<(String, u64)>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => {
                        self.disconnect_all().await;
                        break;
                    }
                    Some(command) => self.dispatch(command),
                },
                Some((server, id)) = exited.recv() => self.reap(&server, id),
            }
        }
        debug!("Tool-server registry loop finished");
    }

    fn dispatch(&mut self, command: Command) {
        match command {
            Command::Connect { server, reply } => {
                let connected = self
                    .connections
                    .get(&server)
                    .is_some_and(|handle| handle.state() == ConnectionState::Connected);
                if connected {
                    let _ = reply.try_send(Ok(()));
                } else {
                    self.connect(&server, ConnectionRequest::Connect { reply });
                }
            }
            Command::CallTool {
                server,
                tool,
                arguments,
                reply,
            } => self.forward(
                &server,
                ConnectionRequest::CallTool {
                    tool,
                    arguments,
                    reply,
                },
            ),
            Command::ReadResource { server, uri, reply } => {
                self.forward(&server, ConnectionRequest::ReadResource { uri, reply })
            }
            Command::Disconnect { server, reply } => match self.connections.remove(&server) {
                None => {
                    let _ = reply.try_send(Ok(()));
                }
                Some(handle) => {
                    let (done_tx, done_rx) = oneshot::channel();
                    if handle
                        .send(ConnectionRequest::Disconnect { done: done_tx })
                        .is_err()
                    {
                        let _ = reply.try_send(Ok(()));
                        return;
                    }
                    tokio::spawn(async move {
                        let _ = done_rx.await;
                        let _ = reply.try_send(Ok(()));
                    });
                }
            },
            Command::Snapshot { reply } => {
                let snapshot = self
                    .connections
                    .iter()
                    .map(|(name, handle)| (name.clone(), handle.status()))
                    .collect();
                let _ = reply.try_send(snapshot);
            }
            Command::Shutdown => {}
        }
    }

    /// Routes a connect request to the existing connection task, spawning a
    /// fresh one when there is none or the old one has exited.
    fn connect(&mut self, server: &str, request: ConnectionRequest) {
        let request = match self.connections.get(server) {
            Some(handle) => match handle.send(request) {
                Ok(()) => return,
                Err(request) => {
                    self.connections.remove(server);
                    request
                }
            },
            None => request,
        };
        let Some(config) = self.configs.get(server).cloned() else {
            request.reject(ToolServerError::UnknownServer(server.to_owned()));
            return;
        };

        self.next_id += 1;
        let handle = ConnectionHandle::spawn(
            self.next_id,
            config,
            self.launcher.clone(),
            self.timeouts,
            self.exited_tx.clone(),
        );
        if let Err(request) = handle.send(request) {
            request.reject(ToolServerError::NotConnected(server.to_owned()));
            return;
        }
        self.connections.insert(server.to_owned(), handle);
    }

    fn forward(&mut self, server: &str, request: ConnectionRequest) {
        match self.connections.get(server) {
            Some(handle) => {
                if let Err(request) = handle.send(request) {
                    self.connections.remove(server);
                    request.reject(ToolServerError::NotConnected(server.to_owned()));
                }
            }
            None => request.reject(ToolServerError::NotConnected(server.to_owned())),
        }
    }

    fn reap(&mut self, server: &str, id: u64) {
        if self.connections.get(server).is_some_and(|handle| handle.id == id) {
            self.connections.remove(server);
            debug!(server, connection_id = id, "Removed failed connection");
        }
    }

    async fn disconnect_all(&mut self) {
        let mut pending = Vec::new();
        for (server, handle) in self.connections.drain() {
            let (done_tx, done_rx) = oneshot::channel();
            if handle
                .send(ConnectionRequest::Disconnect { done: done_tx })
                .is_ok()
            {
                debug!(%server, "Disconnecting");
                pending.push(done_rx);
            }
        }
        if pending.is_empty() {
            return;
        }
        let count = pending.len();
        match tokio::time::timeout(self.timeouts.disconnect, futures::future::join_all(pending)).await
        {
            Ok(_) => info!(count, "Disconnected all tool servers"),
            Err(_) => warn!(count, timeout = ?self.timeouts.disconnect, "Timed out disconnecting tool servers"),
        }
    }
}
