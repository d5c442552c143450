//! Host-facing ACP client
//!
//! [`AcpClient`] is what a host application drives: connect to an agent,
//! send messages and drain their [`StreamEvent`]s, answer permission
//! prompts, and switch modes, models, config options and sessions.
//!
//! ```no_run
//! use acplink_core::{AcpClient, ConnectConfig, SendOptions};
//! use futures::StreamExt;
//!
//! # async fn run() -> acplink_core::Result<()> {
//! let client = AcpClient::new(ConnectConfig::new("/path/to/project"));
//! client.connect().await?;
//!
//! let mut events = client.send_message("Explain this repo", SendOptions::default())?;
//! while let Some(event) = events.next().await {
//!     println!("{:?}", event);
//! }
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

use crate::acp::{
    AcpConnection, AgentProcess, ClientDelegate, FileSystem, PermissionHandler, PermissionSlot,
    PromptTranslator, Session, SessionNotification, SessionStore, StreamEvent,
};
use crate::config::{ConnectConfig, OperatingMode};
use crate::error::{AcpError, ConnectError, Error, Result, TerminalError};
use crate::sandbox::{LocalFileSystem, TerminalHandle, TerminalRegistry};
use crate::types::{
    AgentInfo, CapabilityFlags, ClientCapabilities, ConfigOption, ConnectionStatus, ContentBlock,
    CreateTerminalParams, FileSystemCapability, InitializeParams, ListSessionsParams,
    ListSessionsResponse, PromptResponse, SessionMode, SessionModel, SessionUpdate, StopReason,
};
use futures::{Stream, StreamExt};
use parking_lot::RwLock;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lazy, single-pass sequence of events for one prompt
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// How long `disconnect` waits for the read loop to wind down
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Capacity of the host notification broadcast
const NOTIFICATION_CAPACITY: usize = 256;

/// Extra content sent with a message
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Blocks appended after the text (images, resource links, embedded files)
    pub attachments: Vec<ContentBlock>,
}

/// Everything that lives exactly as long as one agent connection
struct ActiveConnection {
    connection: Arc<AcpConnection>,
    delegate: Arc<ClientDelegate>,
    process: Option<Arc<AgentProcess>>,
    terminals: Option<Arc<TerminalRegistry>>,
    /// Host-driven teardown for this connection
    teardown: CancellationToken,
}

impl ActiveConnection {
    fn shut_down(&self) {
        if let Some(ref terminals) = self.terminals {
            terminals.release_all();
        }
        self.connection.shutdown();
        if let Some(ref process) = self.process {
            process.kill();
        }
    }
}

/// ACP client for one agent at a time
pub struct AcpClient {
    config: ConnectConfig,
    active: RwLock<Option<Arc<ActiveConnection>>>,
    status: Arc<RwLock<ConnectionStatus>>,
    sessions: SessionStore,
    permission_handler: PermissionSlot,
    file_system: Arc<dyn FileSystem>,
    notification_tx: broadcast::Sender<SessionNotification>,
    /// Bumped per connection; older read loops stop touching shared state
    generation: Arc<AtomicU64>,
}

impl AcpClient {
    /// File requests are confined to `allowedRoots` when any are configured
    pub fn new(config: ConnectConfig) -> Self {
        let file_system = LocalFileSystem::with_guard(config.path_guard());
        Self::with_file_system(config, Arc::new(file_system))
    }

    /// Serve the agent's `fs/*` requests from a host-supplied file system
    pub fn with_file_system(config: ConnectConfig, file_system: Arc<dyn FileSystem>) -> Self {
        let (notification_tx, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        Self {
            config,
            active: RwLock::new(None),
            status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            sessions: SessionStore::new(),
            permission_handler: PermissionSlot::default(),
            file_system,
            notification_tx,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.config
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the agent, run the handshake and open a session
    pub async fn connect(&self) -> Result<Session> {
        self.disconnect().await;
        self.set_status(ConnectionStatus::Connecting);

        let command = self.config.command();
        let cwd = self.config.cwd_string();
        info!("Connecting to agent: {} (cwd: {})", command, cwd);

        let spawned = AgentProcess::spawn(&command, &self.config.args, &self.config.agent_env(), Some(cwd.as_str()));
        let (process, stdin, stdout) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                self.set_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };

        self.establish(stdout, stdin, Some(Arc::new(process))).await
    }

    /// Connect over already-open pipes instead of spawning a process
    pub async fn connect_with_io<R, W>(&self, reader: R, writer: W) -> Result<Session>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        self.disconnect().await;
        self.set_status(ConnectionStatus::Connecting);
        self.establish(reader, writer, None).await
    }

    async fn establish<R, W>(
        &self,
        reader: R,
        writer: W,
        process: Option<Arc<AgentProcess>>,
    ) -> Result<Session>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let cwd = self.config.cwd_string();
        let terminals = match self.config.mode {
            OperatingMode::Native => Some(Arc::new(TerminalRegistry::new(Some(self.config.cwd.clone())))),
            OperatingMode::Passthrough => None,
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut delegate = ClientDelegate::new(self.sessions.clone(), Arc::clone(&self.file_system))
            .with_permission_handler(Arc::clone(&self.permission_handler))
            .with_notifications(self.notification_tx.clone())
            .with_status(Arc::clone(&self.status))
            .with_generation(Arc::clone(&self.generation), generation);
        if let Some(ref terminals) = terminals {
            delegate = delegate.with_terminals(Arc::clone(terminals));
        }
        let delegate = Arc::new(delegate);

        let connection = Arc::new(
            AcpConnection::new(reader, writer, delegate.clone())
                .with_request_timeout(self.config.request_timeout()),
        );

        let handshake = async {
            connection
                .initialize(InitializeParams {
                    protocol_version: self.config.protocol_version,
                    client_capabilities: self.client_capabilities(),
                    client_info: self.config.client_info(),
                })
                .await?;
            let setup = connection
                .new_session(&cwd, self.config.mcp_servers.clone())
                .await?;
            self.established(setup.session_id.as_deref().unwrap_or_default())
        }
        .await;

        let session = match handshake {
            Ok(done) => done,
            Err(e) => {
                warn!("Handshake failed: {}", e);
                connection.shutdown();
                if let Some(ref process) = process {
                    process.kill();
                }
                self.sessions.clear();
                self.set_status(ConnectionStatus::Disconnected);
                return Err(ConnectError::HandshakeFailed(e.to_string()).into());
            }
        };

        let session_id = session.id.clone();
        let active = Arc::new(ActiveConnection {
            connection,
            delegate,
            process,
            terminals,
            teardown: CancellationToken::new(),
        });
        tokio::spawn(watch_connection(Arc::clone(&active)));
        *self.active.write() = Some(active);

        self.set_status(ConnectionStatus::Connected);
        let _ = self
            .notification_tx
            .send(SessionNotification::Connected { session_id });
        info!("Connected; session {}", session.id);
        Ok(session)
    }

    fn client_capabilities(&self) -> ClientCapabilities {
        ClientCapabilities {
            fs: FileSystemCapability {
                read_text_file: true,
                write_text_file: true,
            },
            terminal: self.config.mode == OperatingMode::Native,
        }
    }

    /// Tear down the connection. Safe to call when already disconnected.
    pub async fn disconnect(&self) {
        let active = self.active.write().take();
        // The old read loop may outlive the grace period; detach it first
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(active) = active {
            info!("Disconnecting from agent");
            let was_open = !active.connection.is_closed();
            active.shut_down();
            if tokio::time::timeout(DISCONNECT_GRACE, active.connection.closed())
                .await
                .is_err()
            {
                warn!("Agent connection did not close within {:?}", DISCONNECT_GRACE);
            }
            if was_open {
                let _ = self.notification_tx.send(SessionNotification::Disconnected);
            }
        }
        self.sessions.clear();
        self.set_status(ConnectionStatus::Disconnected);
    }

    pub fn is_connected(&self) -> bool {
        self.active
            .read()
            .as_ref()
            .map_or(false, |a| !a.connection.is_closed())
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
    }

    fn active(&self) -> Result<Arc<ActiveConnection>> {
        match self.active.read().as_ref() {
            Some(active) if !active.connection.is_closed() => Ok(Arc::clone(active)),
            _ => Err(Error::Acp(AcpError::NotConnected)),
        }
    }

    fn current_session_id(&self) -> Result<String> {
        self.sessions
            .current_id()
            .ok_or(Error::Acp(AcpError::NoActiveSession))
    }

    /// The session the read loop recorded when the agent accepted it
    fn established(&self, session_id: &str) -> Result<Session> {
        self.sessions
            .snapshot()
            .filter(|session| session.id == session_id)
            .ok_or(Error::Acp(AcpError::NoActiveSession))
    }

    /// Every session notification plus connect/disconnect events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.notification_tx.subscribe()
    }

    /// Cancelled once the current connection has closed
    pub fn closed_token(&self) -> Option<CancellationToken> {
        self.active.read().as_ref().map(|a| a.connection.closed_token())
    }

    /// Resolves when the current connection closes, or at once if there is none
    pub async fn closed(&self) {
        if let Some(token) = self.closed_token() {
            token.cancelled().await;
        }
    }

    /// Cancelling this token tears the current connection down
    pub fn teardown_token(&self) -> Option<CancellationToken> {
        self.active.read().as_ref().map(|a| a.teardown.clone())
    }

    pub fn agent_info(&self) -> Option<AgentInfo> {
        self.active.read().as_ref().and_then(|a| a.connection.agent_info())
    }

    pub fn capabilities(&self) -> Option<CapabilityFlags> {
        self.active.read().as_ref().and_then(|a| a.connection.capabilities())
    }

    // ========================================================================
    // Prompting
    // ========================================================================

    /// Send a user message. The returned stream starts with `message_start`
    /// and ends with exactly one `message_complete` or `error`.
    ///
    /// Drain it once, in order. Updates queue while the consumer lags and a
    /// warning is logged once `eventBuffer` of them are waiting. Starting a
    /// new message cancels the previous one.
    pub fn send_message(&self, text: &str, options: SendOptions) -> Result<EventStream> {
        let active = self.active()?;
        let session_id = self.current_session_id()?;

        let mut prompt = vec![ContentBlock::text(text)];
        prompt.extend(options.attachments);

        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let (prompt_id, superseded) = active
            .delegate
            .begin_prompt(session_id.clone(), update_tx, cancel.clone());
        debug!("Starting prompt {} on session {}", prompt_id, session_id);

        let cycle = PromptCycle {
            connection: Arc::clone(&active.connection),
            guard: PromptGuard {
                delegate: Arc::clone(&active.delegate),
                prompt_id,
                status: Arc::clone(&self.status),
            },
            session_id,
            prompt,
            updates: update_rx,
            lag_warning: self.config.event_buffer.max(1),
            supersedes: superseded.map(|previous| previous.session_id),
            cancel,
            cancel_timeout: self.config.cancel_timeout(),
        };
        Ok(cycle.into_stream())
    }

    /// Send a message and collect every event
    pub async fn send_message_sync(&self, text: &str, options: SendOptions) -> Result<Vec<StreamEvent>> {
        let stream = self.send_message(text, options)?;
        Ok(stream.collect().await)
    }

    /// Ask the agent to stop the current turn. The open event stream ends
    /// with `message_complete(cancelled)` once the agent settles, or after
    /// `cancelTimeoutSecs` if it does not.
    pub async fn cancel(&self) -> Result<()> {
        let active = self.active()?;
        let session_id = self.current_session_id()?;
        if !active.delegate.cancel_prompt() {
            debug!("Cancel requested with no prompt in flight");
        }
        active.connection.cancel(&session_id).await
    }

    pub fn set_permission_handler(&self, handler: impl PermissionHandler + 'static) {
        let handler: Arc<dyn PermissionHandler> = Arc::new(handler);
        *self.permission_handler.write() = Some(handler);
    }

    pub fn clear_permission_handler(&self) {
        *self.permission_handler.write() = None;
    }

    // ========================================================================
    // Session state
    // ========================================================================

    pub fn session(&self) -> Option<Session> {
        self.sessions.snapshot()
    }

    pub fn current_mode(&self) -> Option<String> {
        self.sessions.with(|s| s.current_mode.clone()).flatten()
    }

    pub fn available_modes(&self) -> Vec<SessionMode> {
        self.sessions
            .with(|s| s.available_modes.clone())
            .unwrap_or_default()
    }

    pub fn current_model(&self) -> Option<String> {
        self.sessions.with(|s| s.current_model.clone()).flatten()
    }

    pub fn available_models(&self) -> Vec<SessionModel> {
        self.sessions
            .with(|s| s.available_models.clone())
            .unwrap_or_default()
    }

    pub fn config_options(&self) -> Vec<ConfigOption> {
        self.sessions
            .with(|s| s.config_options.clone())
            .unwrap_or_default()
    }

    pub async fn set_mode(&self, mode_id: &str) -> Result<()> {
        let active = self.active()?;
        let session_id = self.current_session_id()?;
        active.connection.set_session_mode(&session_id, mode_id).await?;
        self.sessions.set_current_mode(mode_id);
        Ok(())
    }

    pub async fn set_model(&self, model_id: &str) -> Result<()> {
        let active = self.active()?;
        let session_id = self.current_session_id()?;
        active.connection.set_session_model(&session_id, model_id).await?;
        self.sessions.set_current_model(model_id);
        Ok(())
    }

    /// Returns the agent's updated option list, which replaces the session's
    pub async fn set_config_option(&self, config_id: &str, value: &str) -> Result<Vec<ConfigOption>> {
        let active = self.active()?;
        let session_id = self.current_session_id()?;
        let options = active
            .connection
            .set_session_config_option(&session_id, config_id, value)
            .await?;
        self.sessions.replace_config_options(options.clone());
        Ok(options)
    }

    // ========================================================================
    // Session management
    // ========================================================================

    fn resolve_cwd(&self, cwd: Option<&str>) -> String {
        cwd.map(str::to_string)
            .unwrap_or_else(|| self.config.cwd_string())
    }

    /// Open a fresh session and make it current
    pub async fn new_session(&self, cwd: Option<&str>) -> Result<Session> {
        let active = self.active()?;
        let cwd = self.resolve_cwd(cwd);
        let setup = active
            .connection
            .new_session(&cwd, self.config.mcp_servers.clone())
            .await?;
        self.established(setup.session_id.as_deref().unwrap_or_default())
    }

    pub async fn list_sessions(&self, params: ListSessionsParams) -> Result<ListSessionsResponse> {
        self.active()?.connection.list_sessions(params).await
    }

    /// Load a stored session and make it current. Its history is replayed
    /// through [`subscribe`](Self::subscribe).
    pub async fn load_session(&self, session_id: &str, cwd: Option<&str>) -> Result<Session> {
        let active = self.active()?;
        let cwd = self.resolve_cwd(cwd);
        let setup = active
            .connection
            .load_session(session_id, &cwd, self.config.mcp_servers.clone())
            .await?;
        self.established(setup.session_id.as_deref().unwrap_or(session_id))
    }

    /// Fork a session and make the fork current
    pub async fn fork_session(&self, session_id: &str, cwd: Option<&str>) -> Result<Session> {
        let active = self.active()?;
        let cwd = self.resolve_cwd(cwd);
        let setup = active.connection.fork_session(session_id, &cwd).await?;
        let forked_id = setup.session_id.unwrap_or_default();
        info!("Forked session {} into {}", session_id, forked_id);
        self.established(&forked_id)
    }

    /// Resume a session without replaying its history and make it current
    pub async fn resume_session(&self, session_id: &str, cwd: Option<&str>) -> Result<Session> {
        let active = self.active()?;
        let cwd = self.resolve_cwd(cwd);
        let setup = active
            .connection
            .resume_session(session_id, &cwd, self.config.mcp_servers.clone())
            .await?;
        self.established(setup.session_id.as_deref().unwrap_or(session_id))
    }

    // ========================================================================
    // Terminals
    // ========================================================================

    /// Spawn a terminal owned by this connection (native mode only)
    pub fn create_terminal(&self, params: CreateTerminalParams) -> Result<Arc<TerminalHandle>> {
        let active = self.active()?;
        let terminals = active
            .terminals
            .as_ref()
            .ok_or(Error::Terminal(TerminalError::Unsupported))?;
        terminals.create(&params)
    }

    pub fn terminal(&self, terminal_id: &str) -> Result<Arc<TerminalHandle>> {
        let active = self.active()?;
        let terminals = active
            .terminals
            .as_ref()
            .ok_or(Error::Terminal(TerminalError::Unsupported))?;
        terminals.get(terminal_id)
    }
}

/// Tear the connection down when the host asks or the agent exits
async fn watch_connection(active: Arc<ActiveConnection>) {
    let process_exit = async {
        match active.process {
            Some(ref process) => Some(process.wait().await),
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = active.connection.closed() => {}
        _ = active.teardown.cancelled() => {
            info!("Teardown requested by host");
            active.shut_down();
        }
        exit = process_exit => {
            info!("Agent process exited: {:?}", exit);
            active.shut_down();
        }
    }
}

/// Clears the prompt routing when the stream is dropped or finishes
struct PromptGuard {
    delegate: Arc<ClientDelegate>,
    prompt_id: u64,
    status: Arc<RwLock<ConnectionStatus>>,
}

impl PromptGuard {
    fn thinking(&self) {
        let mut status = self.status.write();
        if *status == ConnectionStatus::Connected {
            *status = ConnectionStatus::Thinking;
        }
    }
}

impl Drop for PromptGuard {
    fn drop(&mut self) {
        self.delegate.end_prompt(self.prompt_id);
        let mut status = self.status.write();
        if *status == ConnectionStatus::Thinking {
            *status = ConnectionStatus::Connected;
        }
    }
}

/// Inputs of one prompt turn, consumed by [`PromptCycle::into_stream`]
struct PromptCycle {
    connection: Arc<AcpConnection>,
    guard: PromptGuard,
    session_id: String,
    prompt: Vec<ContentBlock>,
    updates: mpsc::UnboundedReceiver<SessionUpdate>,
    lag_warning: usize,
    /// Session of the prompt this one replaced; the agent is told to stop it
    supersedes: Option<String>,
    cancel: CancellationToken,
    cancel_timeout: Duration,
}

enum Step {
    Update(SessionUpdate),
    UpdatesClosed,
    Finished(Result<PromptResponse>),
    Cancelling,
    CancelTimedOut,
}

async fn wait_deadline(deadline: &mut Option<Pin<Box<Sleep>>>) {
    match deadline {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

impl PromptCycle {
    fn into_stream(self) -> EventStream {
        let PromptCycle {
            connection,
            guard,
            session_id,
            prompt,
            mut updates,
            lag_warning,
            supersedes,
            cancel,
            cancel_timeout,
        } = self;

        Box::pin(async_stream::stream! {
            let guard = guard;
            let mut translator = PromptTranslator::new();
            if let Some(event) = translator.start() {
                yield event;
            }
            guard.thinking();

            if let Some(previous) = supersedes {
                if let Err(e) = connection.cancel(&previous).await {
                    warn!("Failed to cancel superseded prompt: {}", e);
                }
            }

            let request = connection.prompt(&session_id, prompt);
            tokio::pin!(request);

            let mut updates_open = true;
            let mut lagging = false;
            let mut cancelling = false;
            let mut deadline: Option<Pin<Box<Sleep>>> = None;

            loop {
                // Updates first: everything the agent sent before its
                // response must be yielded before the terminal event
                let step = tokio::select! {
                    biased;
                    update = updates.recv(), if updates_open => match update {
                        Some(update) => Step::Update(update),
                        None => Step::UpdatesClosed,
                    },
                    result = &mut request => Step::Finished(result),
                    _ = cancel.cancelled(), if !cancelling => Step::Cancelling,
                    _ = wait_deadline(&mut deadline) => Step::CancelTimedOut,
                };

                match step {
                    Step::Update(update) => {
                        let backlog = updates.len();
                        if backlog >= lag_warning && !lagging {
                            warn!("Stream consumer is {} updates behind", backlog);
                        }
                        lagging = backlog >= lag_warning;
                        if let Some(event) = translator.on_update(update) {
                            yield event;
                        }
                    }
                    Step::UpdatesClosed => updates_open = false,
                    Step::Cancelling => {
                        debug!("Prompt cancelled; waiting up to {:?} for the agent", cancel_timeout);
                        cancelling = true;
                        deadline = Some(Box::pin(tokio::time::sleep(cancel_timeout)));
                    }
                    Step::Finished(result) => {
                        while let Ok(update) = updates.try_recv() {
                            if let Some(event) = translator.on_update(update) {
                                yield event;
                            }
                        }
                        let last = match result {
                            Ok(response) => translator.complete(response.stop_reason),
                            Err(e) => translator.fail(e.to_string()),
                        };
                        if let Some(event) = last {
                            yield event;
                        }
                        break;
                    }
                    Step::CancelTimedOut => {
                        warn!("Agent did not settle within {:?} of cancel", cancel_timeout);
                        if let Some(event) = translator.complete(StopReason::Cancelled) {
                            yield event;
                        }
                        break;
                    }
                }
            }
        })
    }
}
