//! One notebook's connection to its kernel.
//!
//! A [`KernelSession`] owns a tokio runtime; its methods are blocking and
//! must not be called from inside an async context. Replies are routed by a
//! dispatch task that reads both channels, so results arrive while the
//! caller is doing other work.
//!
//! ```text
//! Unstarted --start--> Starting --ok--> Connected --restart--> Restarting --ok--> Connected
//!     ^                   |                 |  \                    |
//!     +------ error ------+                 |   +--channel lost--> Disconnected
//!                                           +--shutdown--> ShuttingDown --> Closed
//! ```

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kernel_wire::{
    CompleteReply, CompleteRequest, ExecuteRequest, ExecutionState, JupyterMessageContent, Message,
};
use log::{debug, info, warn};
use notebook_doc::Notebook;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::channel::{ChannelConnection, ChannelKind};
use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::gateway::KernelGateway;
use crate::pending::{PendingTable, ReplySink, Routed};
use crate::reply::Execution;
use crate::server::{NotebookEntry, NotebookServer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Unstarted,
    Starting,
    Connected,
    Restarting,
    /// A channel dropped; `restart` or `shutdown` are the ways out.
    Disconnected,
    ShuttingDown,
    Closed,
}

impl SessionPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionPhase::Unstarted => "unstarted",
            SessionPhase::Starting => "starting",
            SessionPhase::Connected => "connected",
            SessionPhase::Restarting => "restarting",
            SessionPhase::Disconnected => "disconnected",
            SessionPhase::ShuttingDown => "shutting down",
            SessionPhase::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kernel state as last reported on iopub.
///
/// `Unknown` until the first status message and after the channels are lost;
/// `Dead` once the session has shut the kernel down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelStatus {
    #[default]
    Unknown,
    Starting,
    Idle,
    Busy,
    Restarting,
    Dead,
}

impl KernelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            KernelStatus::Unknown => "unknown",
            KernelStatus::Starting => "starting",
            KernelStatus::Idle => "idle",
            KernelStatus::Busy => "busy",
            KernelStatus::Restarting => "restarting",
            KernelStatus::Dead => "dead",
        }
    }
}

impl From<&ExecutionState> for KernelStatus {
    fn from(state: &ExecutionState) -> Self {
        match state {
            ExecutionState::Starting => KernelStatus::Starting,
            ExecutionState::Idle => KernelStatus::Idle,
            ExecutionState::Busy => KernelStatus::Busy,
            ExecutionState::Restarting => KernelStatus::Restarting,
        }
    }
}

impl fmt::Display for KernelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Channel senders and the task reading both channels, for one kernel
/// incarnation.
struct LiveChannels {
    shell: mpsc::UnboundedSender<String>,
    /// Held so the iopub socket stays open.
    _iopub: mpsc::UnboundedSender<String>,
    dispatch: JoinHandle<()>,
}

impl LiveChannels {
    /// Stop dispatching and drop the senders, which closes both sockets.
    fn close(self) {
        self.dispatch.abort();
    }
}

struct SessionState {
    phase: SessionPhase,
    notebook_id: Option<String>,
    kernel_id: Option<String>,
    pending: PendingTable,
    channels: Option<LiveChannels>,
    /// Bumped whenever channels are torn down; stale dispatch tasks compare
    /// against it and stand down.
    generation: u64,
}

struct SessionInner {
    gateway: Arc<dyn KernelGateway>,
    session_id: String,
    username: String,
    state: Mutex<SessionState>,
    status_tx: watch::Sender<KernelStatus>,
}

impl SessionInner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn open_channels(
        &self,
        kernel_id: &str,
    ) -> Result<(ChannelConnection, ChannelConnection), SessionError> {
        futures::try_join!(
            self.gateway
                .open_channel(kernel_id, ChannelKind::Shell, &self.session_id),
            self.gateway
                .open_channel(kernel_id, ChannelKind::Iopub, &self.session_id),
        )
    }

    /// Register `sink` under the message id, then send on shell.
    ///
    /// Registration happens first so a fast reply cannot beat it.
    fn send_request(
        &self,
        message: Message,
        sink: ReplySink,
        operation: &'static str,
    ) -> Result<String, SessionError> {
        let frame = kernel_wire::encode(&message)?;
        let msg_id = message.header.msg_id;

        let mut state = self.lock();
        let shell = match (&state.phase, &state.channels) {
            (SessionPhase::Connected, Some(channels)) => channels.shell.clone(),
            _ => {
                return Err(SessionError::InvalidPhase {
                    operation,
                    phase: state.phase,
                })
            }
        };
        state.pending.insert(msg_id.clone(), sink);
        if shell.send(frame).is_err() {
            state.pending.remove(&msg_id);
            return Err(SessionError::Disconnected(
                "shell channel closed".to_string(),
            ));
        }
        debug!("[session] sent {} {}", message.header.msg_type, msg_id);
        Ok(msg_id)
    }

    fn handle_frame(&self, generation: u64, kind: ChannelKind, frame: &str) {
        let message = match kernel_wire::decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("[session] discarding {} frame: {}", kind, SessionError::from(e));
                return;
            }
        };

        let mut state = self.lock();
        if state.generation != generation {
            return;
        }

        if let JupyterMessageContent::Status(status) = &message.content {
            let status = KernelStatus::from(&status.execution_state);
            debug!("[session] kernel {}", status);
            self.status_tx.send_replace(status);
            return;
        }

        let Some(parent_id) = message.parent_id().map(str::to_string) else {
            debug!("[session] {} without parent, dropped", message.msg_type());
            return;
        };
        let msg_type = message.msg_type().to_string();
        if state.pending.route(&parent_id, message.content) == Routed::Unmatched {
            debug!("[session] {} for unknown request {}, dropped", msg_type, parent_id);
        }
    }

    fn channel_lost(&self, generation: u64, kind: ChannelKind) {
        let mut state = self.lock();
        if state.generation != generation {
            return;
        }
        warn!("[session] {} channel closed, session disconnected", kind);
        state.phase = SessionPhase::Disconnected;
        state.generation += 1;
        // Dropping the senders closes the surviving socket; this task is the
        // dispatcher and ends on its own.
        state.channels = None;
        let failed = state
            .pending
            .fail_all(|| SessionError::Disconnected(format!("{} channel closed", kind)));
        if failed > 0 {
            info!("[session] failed {} pending request(s)", failed);
        }
        self.status_tx.send_replace(KernelStatus::Unknown);
    }
}

async fn dispatch(
    inner: Arc<SessionInner>,
    generation: u64,
    mut shell: mpsc::UnboundedReceiver<String>,
    mut iopub: mpsc::UnboundedReceiver<String>,
) {
    loop {
        // iopub first: outputs already queued must land before the shell
        // reply retires their request.
        tokio::select! {
            biased;
            frame = iopub.recv() => match frame {
                Some(frame) => inner.handle_frame(generation, ChannelKind::Iopub, &frame),
                None => {
                    inner.channel_lost(generation, ChannelKind::Iopub);
                    return;
                }
            },
            frame = shell.recv() => match frame {
                Some(frame) => inner.handle_frame(generation, ChannelKind::Shell, &frame),
                None => {
                    inner.channel_lost(generation, ChannelKind::Shell);
                    return;
                }
            },
        }
    }
}

/// Client side of one notebook's kernel session.
pub struct KernelSession {
    runtime: Runtime,
    inner: Arc<SessionInner>,
    complete_timeout: Duration,
}

impl KernelSession {
    /// A session against a real notebook server.
    pub fn new(config: ServerConfig) -> Result<Self, SessionError> {
        let server = NotebookServer::new(config.clone())?;
        Self::with_gateway(Arc::new(server), &config)
    }

    /// A session over any gateway; `config` supplies the username and
    /// default completion deadline.
    pub fn with_gateway(
        gateway: Arc<dyn KernelGateway>,
        config: &ServerConfig,
    ) -> Result<Self, SessionError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("kernel-session")
            .enable_all()
            .build()
            .map_err(|e| SessionError::Runtime(e.to_string()))?;
        let (status_tx, _) = watch::channel(KernelStatus::Unknown);

        let inner = Arc::new(SessionInner {
            gateway,
            session_id: Uuid::new_v4().to_string(),
            username: config.username.clone(),
            state: Mutex::new(SessionState {
                phase: SessionPhase::Unstarted,
                notebook_id: None,
                kernel_id: None,
                pending: PendingTable::default(),
                channels: None,
                generation: 0,
            }),
            status_tx,
        });

        Ok(Self {
            runtime,
            inner,
            complete_timeout: config.complete_timeout,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn phase(&self) -> SessionPhase {
        self.inner.lock().phase
    }

    pub fn kernel_id(&self) -> Option<String> {
        self.inner.lock().kernel_id.clone()
    }

    pub fn notebook_id(&self) -> Option<String> {
        self.inner.lock().notebook_id.clone()
    }

    /// Number of requests still waiting for their terminal reply.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Watch the kernel's reported execution state.
    pub fn status(&self) -> watch::Receiver<KernelStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Run a future on the session runtime. Not for use inside an async context.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn login(&self) -> Result<(), SessionError> {
        self.runtime.block_on(self.inner.gateway.login())
    }

    pub fn list_notebooks(&self) -> Result<Vec<NotebookEntry>, SessionError> {
        self.runtime.block_on(self.inner.gateway.list_notebooks())
    }

    /// Create a notebook on the server and return its id. Does not open it.
    pub fn new_notebook(&self) -> Result<String, SessionError> {
        self.runtime.block_on(self.inner.gateway.new_notebook())
    }

    /// Fetch a notebook's document and bind this session to it.
    ///
    /// Rebinding to a different notebook is only allowed before `start`.
    /// A failed fetch leaves the binding unchanged.
    pub fn open(&self, notebook_id: &str) -> Result<Notebook, SessionError> {
        self.check_rebind(notebook_id)?;
        let value = self
            .runtime
            .block_on(self.inner.gateway.fetch_notebook(notebook_id))?;
        let notebook = Notebook::from_value(value)?;

        self.check_rebind(notebook_id)?;
        self.inner.lock().notebook_id = Some(notebook_id.to_string());
        info!("[session] Opened notebook {}", notebook_id);
        Ok(notebook)
    }

    fn check_rebind(&self, notebook_id: &str) -> Result<(), SessionError> {
        let state = self.inner.lock();
        let rebinding = state.notebook_id.as_deref() != Some(notebook_id);
        if rebinding && state.phase != SessionPhase::Unstarted {
            return Err(SessionError::InvalidPhase {
                operation: "open another notebook",
                phase: state.phase,
            });
        }
        Ok(())
    }

    /// Fetch the bound notebook's current document from the server.
    pub fn fetch(&self) -> Result<Notebook, SessionError> {
        let notebook_id = self.bound_notebook()?;
        let value = self
            .runtime
            .block_on(self.inner.gateway.fetch_notebook(&notebook_id))?;
        Ok(Notebook::from_value(value)?)
    }

    /// Store `notebook` as the bound notebook's document.
    pub fn save(&self, notebook: &Notebook) -> Result<(), SessionError> {
        let notebook_id = self.bound_notebook()?;
        let document = notebook.to_value();
        self.runtime
            .block_on(self.inner.gateway.save_notebook(&notebook_id, document))
    }

    fn bound_notebook(&self) -> Result<String, SessionError> {
        self.inner
            .lock()
            .notebook_id
            .clone()
            .ok_or(SessionError::NoNotebook)
    }

    /// Start the bound notebook's kernel and open both channels.
    ///
    /// On failure the session stays `Unstarted` and may be started again.
    pub fn start(&self) -> Result<(), SessionError> {
        let notebook_id = {
            let mut state = self.inner.lock();
            if state.phase != SessionPhase::Unstarted {
                return Err(SessionError::InvalidPhase {
                    operation: "start",
                    phase: state.phase,
                });
            }
            let notebook_id = state.notebook_id.clone().ok_or(SessionError::NoNotebook)?;
            state.phase = SessionPhase::Starting;
            notebook_id
        };
        info!("[session] Starting kernel for notebook {}", notebook_id);

        let inner = &self.inner;
        let result = self.runtime.block_on(async {
            let kernel_id = inner.gateway.start_kernel(&notebook_id).await?;
            let channels = inner.open_channels(&kernel_id).await?;
            Ok::<_, SessionError>((kernel_id, channels))
        });

        match result {
            Ok((kernel_id, (shell, iopub))) => {
                self.install(kernel_id, shell, iopub);
                Ok(())
            }
            Err(e) => {
                warn!("[session] Kernel start failed: {}", e);
                self.inner.lock().phase = SessionPhase::Unstarted;
                Err(match e {
                    e if e.is_unreachable() => e,
                    other => SessionError::KernelUnreachable(other.to_string()),
                })
            }
        }
    }

    fn install(&self, kernel_id: String, shell: ChannelConnection, iopub: ChannelConnection) {
        let mut state = self.inner.lock();
        state.generation += 1;
        let dispatch = self.runtime.spawn(dispatch(
            self.inner.clone(),
            state.generation,
            shell.inbound,
            iopub.inbound,
        ));
        state.channels = Some(LiveChannels {
            shell: shell.outbound,
            _iopub: iopub.outbound,
            dispatch,
        });
        info!("[session] Connected to kernel {}", kernel_id);
        state.kernel_id = Some(kernel_id);
        state.phase = SessionPhase::Connected;
    }

    /// Submit `code` for execution.
    ///
    /// Outputs and the final reply arrive on the returned [`Execution`].
    pub fn run(&self, code: &str) -> Result<Execution, SessionError> {
        let message = Message::new(
            ExecuteRequest::new(code.to_string()),
            &self.inner.session_id,
            &self.inner.username,
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let msg_id = self
            .inner
            .send_request(message, ReplySink::Execute(tx), "run code")?;
        Ok(Execution::new(msg_id, rx, self.runtime.handle().clone()))
    }

    /// Completion candidates for `line` at `cursor_pos`.
    ///
    /// Best effort: an empty list when the kernel does not answer within
    /// `timeout` (or the default deadline) or the request fails.
    pub fn complete(
        &self,
        line: &str,
        cursor_pos: usize,
        timeout: Option<Duration>,
    ) -> Vec<String> {
        match self.try_complete(line, cursor_pos, timeout) {
            Ok(reply) => reply.matches,
            Err(SessionError::RequestTimeout) => {
                debug!("[session] completion timed out");
                Vec::new()
            }
            Err(e) => {
                warn!("[session] completion failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Like [`complete`](Self::complete) but reporting why nothing came back.
    pub fn try_complete(
        &self,
        line: &str,
        cursor_pos: usize,
        timeout: Option<Duration>,
    ) -> Result<CompleteReply, SessionError> {
        let request = CompleteRequest {
            code: line.to_string(),
            cursor_pos,
        };
        let message = Message::new(request, &self.inner.session_id, &self.inner.username);
        let (tx, rx) = oneshot::channel();
        let msg_id = self
            .inner
            .send_request(message, ReplySink::Complete(tx), "complete")?;

        let timeout = timeout.unwrap_or(self.complete_timeout);
        match self
            .runtime
            .block_on(async { tokio::time::timeout(timeout, rx).await })
        {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Disconnected(
                "completion request dropped".to_string(),
            )),
            Err(_) => {
                self.inner.lock().pending.remove(&msg_id);
                Err(SessionError::RequestTimeout)
            }
        }
    }

    /// Ask the server to interrupt the running cell. No state change.
    pub fn interrupt(&self) -> Result<(), SessionError> {
        let kernel_id = self.kernel_in(&[SessionPhase::Connected], "interrupt")?;
        self.runtime
            .block_on(self.inner.gateway.interrupt_kernel(&kernel_id))
    }

    /// Restart the kernel and reopen both channels.
    ///
    /// Every outstanding request fails with `SessionInvalidated`. If the
    /// kernel cannot be brought back the session ends `Disconnected`.
    pub fn restart(&self) -> Result<(), SessionError> {
        let (kernel_id, old) = {
            let mut state = self.inner.lock();
            let kernel_id = match (state.phase, state.kernel_id.clone()) {
                (SessionPhase::Connected | SessionPhase::Disconnected, Some(id)) => id,
                (phase, _) => {
                    return Err(SessionError::InvalidPhase {
                        operation: "restart",
                        phase,
                    })
                }
            };
            state.phase = SessionPhase::Restarting;
            state.generation += 1;
            let failed = state.pending.fail_all(|| SessionError::SessionInvalidated);
            if failed > 0 {
                info!("[session] invalidated {} pending request(s)", failed);
            }
            (kernel_id, state.channels.take())
        };
        if let Some(old) = old {
            old.close();
        }
        self.inner
            .status_tx
            .send_replace(KernelStatus::Restarting);
        info!("[session] Restarting kernel {}", kernel_id);

        let inner = &self.inner;
        let result = self.runtime.block_on(async {
            inner.gateway.restart_kernel(&kernel_id).await?;
            inner.open_channels(&kernel_id).await
        });

        match result {
            Ok((shell, iopub)) => {
                self.install(kernel_id, shell, iopub);
                Ok(())
            }
            Err(e) => {
                warn!("[session] Restart failed: {}", e);
                self.inner.lock().phase = SessionPhase::Disconnected;
                self.inner.status_tx.send_replace(KernelStatus::Unknown);
                Err(e)
            }
        }
    }

    /// Shut the kernel down and close the session for good.
    ///
    /// Outstanding requests fail with `SessionClosed`. The session is
    /// `Closed` afterwards even when the server call fails.
    pub fn shutdown(&self) -> Result<(), SessionError> {
        let (kernel_id, old) = {
            let mut state = self.inner.lock();
            match state.phase {
                SessionPhase::Closed => return Ok(()),
                SessionPhase::Connected | SessionPhase::Disconnected | SessionPhase::Unstarted => {}
                phase => {
                    return Err(SessionError::InvalidPhase {
                        operation: "shut down",
                        phase,
                    })
                }
            }
            state.phase = SessionPhase::ShuttingDown;
            state.generation += 1;
            state.pending.fail_all(|| SessionError::SessionClosed);
            (state.kernel_id.take(), state.channels.take())
        };
        if let Some(old) = old {
            old.close();
        }

        let result = match &kernel_id {
            Some(id) => {
                info!("[session] Shutting down kernel {}", id);
                self.runtime
                    .block_on(self.inner.gateway.shutdown_kernel(id))
            }
            None => Ok(()),
        };

        self.inner.lock().phase = SessionPhase::Closed;
        self.inner.status_tx.send_replace(KernelStatus::Dead);
        result
    }

    fn kernel_in(
        &self,
        allowed: &[SessionPhase],
        operation: &'static str,
    ) -> Result<String, SessionError> {
        let state = self.inner.lock();
        match &state.kernel_id {
            Some(id) if allowed.contains(&state.phase) => Ok(id.clone()),
            _ => Err(SessionError::InvalidPhase {
                operation,
                phase: state.phase,
            }),
        }
    }
}

impl Drop for KernelSession {
    /// Closes the local channels. The kernel itself keeps running on the
    /// server unless `shutdown` was called.
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        state.generation += 1;
        state.pending.fail_all(|| SessionError::SessionClosed);
        if let Some(channels) = state.channels.take() {
            channels.close();
        }
    }
}
