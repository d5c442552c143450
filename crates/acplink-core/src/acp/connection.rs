//! ACP Connection implementation
//!
//! [`AcpConnection`] correlates our requests with the agent's responses and
//! dispatches everything the agent sends unprompted. Two tables are kept
//! apart: requests we initiated wait in the pending map until their response
//! arrives, while requests the agent initiated each run on their own task
//! and answer whenever the host's handler finishes. Neither side can stall
//! the read loop.

use super::protocol::{error_codes, methods, response_id, AcpMessage, InboundMethod, ProtocolHandler};
use super::traits::{AgentClient, SessionNotification};
use super::transport::Transport;
use crate::error::{AcpError, Error, Result};
use crate::types::{
    AgentInfo, CancelParams, CapabilityFlags, ConfigOption, ContentBlock, CreateTerminalParams,
    CreateTerminalResponse, ForkSessionParams, InitializeParams, InitializeResult,
    JsonRpcRequest, JsonRpcResponse, ListSessionsParams, ListSessionsResponse, LoadSessionParams,
    McpServer, NewSessionParams, PermissionOutcome, PromptParams, PromptResponse,
    ReadTextFileParams, RequestPermissionParams, RequestPermissionResponse,
    SetConfigOptionParams, SetConfigOptionResponse, SetModeParams, SetModelParams, SessionSetup,
    TerminalIdParams, WriteTextFileParams,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Session a successful response will establish
struct PendingSession {
    /// Known up front for load and resume; new and fork read it from the result
    session_id: Option<String>,
    cwd: String,
    flags: CapabilityFlags,
}

struct Waiter {
    tx: oneshot::Sender<JsonRpcResponse>,
    establish: Option<PendingSession>,
}

/// Requests we sent that are still waiting for a response
#[derive(Default)]
struct PendingRequests {
    map: HashMap<u64, Waiter>,
    /// Set once the read loop has ended; no new requests are accepted
    closed: bool,
}

type PendingTable = Arc<Mutex<PendingRequests>>;

/// Removes a pending entry when its caller stops waiting
struct PendingGuard {
    pending: PendingTable,
    id: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().map.remove(&self.id);
    }
}

/// Outcome of serving one agent request: a result or a JSON-RPC error
type Reply = std::result::Result<Value, (i64, String)>;

/// ACP Connection for communicating with an agent
pub struct AcpConnection {
    protocol: ProtocolHandler,
    transport: Arc<Transport>,
    pending: PendingTable,
    /// Handshake result, set once by `initialize`
    init: OnceLock<InitializeResult>,
    flags: OnceLock<CapabilityFlags>,
    request_timeout: Option<Duration>,
    /// Cancelled exactly once, after the read loop has torn down
    closed: CancellationToken,
    _message_task: JoinHandle<()>,
}

impl AcpConnection {
    /// Start a connection over the agent's stdout (`reader`) and stdin
    /// (`writer`). Agent requests and notifications go to `delegate`.
    pub fn new<R, W>(reader: R, writer: W, delegate: Arc<dyn AgentClient>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (transport, inbound_rx) = Transport::new(reader, writer);
        let transport = Arc::new(transport);
        let pending = PendingTable::default();
        let closed = CancellationToken::new();

        let message_task = tokio::spawn(Self::message_loop(
            inbound_rx,
            Arc::clone(&transport),
            Arc::clone(&pending),
            delegate,
            closed.clone(),
        ));

        Self {
            protocol: ProtocolHandler::new(),
            transport,
            pending,
            init: OnceLock::new(),
            flags: OnceLock::new(),
            request_timeout: None,
            closed,
            _message_task: message_task,
        }
    }

    /// Bound every request except `session/prompt`
    pub fn with_request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.request_timeout = timeout;
        self
    }

    // ========================================================================
    // Request plumbing
    // ========================================================================

    async fn send_request<P: Serialize>(
        &self,
        method: &str,
        params: &P,
        timeout: Option<Duration>,
    ) -> Result<JsonRpcResponse> {
        self.send_tracked(method, params, timeout, None).await
    }

    /// Send a session-establishing request and parse its (possibly null) result
    async fn establish<P: Serialize>(
        &self,
        method: &str,
        params: &P,
        session: PendingSession,
    ) -> Result<SessionSetup> {
        let response = self
            .send_tracked(method, params, self.request_timeout, Some(session))
            .await?;
        let setup: Option<SessionSetup> = self.protocol.parse_result(method, response)?;
        Ok(setup.unwrap_or_default())
    }

    async fn send_tracked<P: Serialize>(
        &self,
        method: &str,
        params: &P,
        timeout: Option<Duration>,
        establish: Option<PendingSession>,
    ) -> Result<JsonRpcResponse> {
        let (id, request) = self.protocol.request(method, params)?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(Error::Acp(AcpError::Disconnected));
            }
            pending.map.insert(id, Waiter { tx, establish });
        }
        let _guard = PendingGuard {
            pending: Arc::clone(&self.pending),
            id,
        };

        debug!("Sending request {} method={}", id, method);
        self.transport.send(&request).await?;

        let response = match timeout {
            Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                warn!("Request {} ({}) timed out after {:?}", id, method, limit);
                Error::Acp(AcpError::Timeout)
            })?,
            None => rx.await,
        };

        // Sender dropped: the read loop drained the table on disconnect
        response.map_err(|_| Error::Acp(AcpError::Disconnected))
    }

    async fn call<P: Serialize, T: DeserializeOwned>(&self, method: &str, params: &P) -> Result<T> {
        let response = self.send_request(method, params, self.request_timeout).await?;
        self.protocol.parse_result(method, response)
    }

    async fn call_void<P: Serialize>(&self, method: &str, params: &P) -> Result<()> {
        let response = self.send_request(method, params, self.request_timeout).await?;
        self.protocol.parse_void(response)
    }

    fn require_initialized(&self) -> Result<CapabilityFlags> {
        self.flags
            .get()
            .copied()
            .ok_or(Error::Acp(AcpError::NotInitialized))
    }

    fn require_capability(
        &self,
        enabled: impl Fn(&CapabilityFlags) -> bool,
        name: &str,
    ) -> Result<CapabilityFlags> {
        let flags = self.require_initialized()?;
        if enabled(&flags) {
            Ok(flags)
        } else {
            Err(Error::Acp(AcpError::CapabilityNotSupported(name.to_string())))
        }
    }

    // ========================================================================
    // Read loop
    // ========================================================================

    async fn message_loop(
        mut inbound: mpsc::Receiver<Value>,
        transport: Arc<Transport>,
        pending: PendingTable,
        delegate: Arc<dyn AgentClient>,
        closed: CancellationToken,
    ) {
        let protocol = Arc::new(ProtocolHandler::new());

        while let Some(value) = inbound.recv().await {
            trace!("Received message: {}", value);

            match protocol.parse_message(value) {
                Ok(AcpMessage::Response(response)) => {
                    let Some(id) = response_id(&response) else {
                        warn!("Dropping response without a usable id: {:?}", response.id);
                        continue;
                    };
                    let waiter = pending.lock().map.remove(&id);
                    match waiter {
                        Some(waiter) => {
                            if let Some(session) = waiter.establish {
                                announce_session(delegate.as_ref(), session, &response).await;
                            }
                            debug!("Delivering response for request {}", id);
                            let _ = waiter.tx.send(response);
                        }
                        None => warn!("Received response for unknown request: {}", id),
                    }
                }
                Ok(AcpMessage::SessionUpdate(notification)) => {
                    debug!("Session update for {}", notification.session_id);
                    if let Err(e) = delegate
                        .on_session_notification(SessionNotification::Update(notification))
                        .await
                    {
                        warn!("Session update handler failed: {}", e);
                    }
                }
                Ok(AcpMessage::AgentRequest(request)) => {
                    debug!("Agent request: {}", request.method);
                    let protocol = Arc::clone(&protocol);
                    let transport = Arc::clone(&transport);
                    let delegate = Arc::clone(&delegate);
                    tokio::spawn(async move {
                        let response = handle_agent_request(&protocol, delegate.as_ref(), request).await;
                        if let Err(e) = transport.send(&response).await {
                            error!("Failed to send response: {}", e);
                        }
                    });
                }
                Ok(AcpMessage::Unknown(request)) => {
                    trace!("Ignoring notification {}", request.method);
                }
                Err(e) => {
                    warn!("Dropping malformed message: {}", e);
                }
            }
        }

        info!("Agent connection closed");
        let orphaned = {
            let mut pending = pending.lock();
            pending.closed = true;
            std::mem::take(&mut pending.map)
        };
        if !orphaned.is_empty() {
            warn!("Failing {} outstanding request(s)", orphaned.len());
        }
        drop(orphaned);

        if let Err(e) = delegate
            .on_session_notification(SessionNotification::Disconnected)
            .await
        {
            warn!("Disconnect handler failed: {}", e);
        }
        closed.cancel();
    }

    // ========================================================================
    // Outbound RPCs
    // ========================================================================

    /// Handshake. Must complete before any other request.
    pub async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        info!(
            "Initializing ACP connection (protocol version {})",
            params.protocol_version
        );

        let result: InitializeResult = self.call(methods::INITIALIZE, &params).await?;
        if result.protocol_version != 0 && result.protocol_version != params.protocol_version {
            warn!(
                "Agent negotiated protocol version {} (requested {})",
                result.protocol_version, params.protocol_version
            );
        }

        let flags = CapabilityFlags::from(&result.get_capabilities());
        if self.flags.set(flags).is_err() {
            return Err(Error::Acp(AcpError::InvalidMessage(
                "Connection already initialized".to_string(),
            )));
        }
        let _ = self.init.set(result.clone());

        info!(
            "ACP connection initialized ({})",
            result
                .agent_info
                .as_ref()
                .map_or("unknown agent", |a| a.name.as_str())
        );
        Ok(result)
    }

    pub async fn new_session(&self, cwd: &str, mcp_servers: Vec<McpServer>) -> Result<SessionSetup> {
        let flags = self.require_initialized()?;
        debug!("Creating new session (cwd: {})", cwd);

        let params = NewSessionParams {
            cwd: cwd.to_string(),
            mcp_servers,
        };
        let session = PendingSession {
            session_id: None,
            cwd: cwd.to_string(),
            flags,
        };
        let setup = self.establish(methods::SESSION_NEW, &params, session).await?;
        if setup.session_id.is_none() {
            return Err(Error::Acp(AcpError::InvalidMessage(
                "session/new result has no sessionId".to_string(),
            )));
        }
        Ok(setup)
    }

    /// Load a stored session. The agent replays its history as
    /// `session/update` notifications before responding.
    pub async fn load_session(
        &self,
        session_id: &str,
        cwd: &str,
        mcp_servers: Vec<McpServer>,
    ) -> Result<SessionSetup> {
        let flags = self.require_capability(|c| c.load_session, "loadSession")?;
        debug!("Loading session: {}", session_id);

        let params = LoadSessionParams {
            session_id: session_id.to_string(),
            cwd: cwd.to_string(),
            mcp_servers,
        };
        // session/load may answer with null
        let session = PendingSession {
            session_id: Some(session_id.to_string()),
            cwd: cwd.to_string(),
            flags,
        };
        self.establish(methods::SESSION_LOAD, &params, session).await
    }

    /// Run one prompt turn. Never times out; use [`cancel`](Self::cancel).
    pub async fn prompt(&self, session_id: &str, prompt: Vec<ContentBlock>) -> Result<PromptResponse> {
        self.require_initialized()?;
        debug!("Sending prompt to session: {}", session_id);

        let params = PromptParams {
            session_id: session_id.to_string(),
            prompt,
        };
        let response = self.send_request(methods::SESSION_PROMPT, &params, None).await?;
        self.protocol.parse_result(methods::SESSION_PROMPT, response)
    }

    /// Ask the agent to stop the current turn. Fire and forget.
    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        debug!("Cancelling session: {}", session_id);
        let notification = self.protocol.notification(
            methods::SESSION_CANCEL,
            &CancelParams {
                session_id: session_id.to_string(),
            },
        )?;
        self.transport.send(&notification).await
    }

    pub async fn set_session_mode(&self, session_id: &str, mode_id: &str) -> Result<()> {
        self.require_initialized()?;
        debug!("Setting mode for session {}: {}", session_id, mode_id);
        let params = SetModeParams {
            session_id: session_id.to_string(),
            mode_id: mode_id.to_string(),
        };
        self.call_void(methods::SESSION_SET_MODE, &params).await
    }

    pub async fn set_session_model(&self, session_id: &str, model_id: &str) -> Result<()> {
        self.require_initialized()?;
        debug!("Setting model for session {}: {}", session_id, model_id);
        let params = SetModelParams {
            session_id: session_id.to_string(),
            model_id: model_id.to_string(),
        };
        self.call_void(methods::SESSION_SET_MODEL, &params).await
    }

    /// Returns the agent's full, updated option list
    pub async fn set_session_config_option(
        &self,
        session_id: &str,
        config_id: &str,
        value: &str,
    ) -> Result<Vec<ConfigOption>> {
        self.require_initialized()?;
        debug!(
            "Setting config for session {}: {} = {}",
            session_id, config_id, value
        );
        let params = SetConfigOptionParams {
            session_id: session_id.to_string(),
            config_id: config_id.to_string(),
            value: value.to_string(),
        };
        let response: SetConfigOptionResponse = self
            .call(methods::SESSION_SET_CONFIG_OPTION, &params)
            .await?;
        Ok(response.config_options)
    }

    pub async fn list_sessions(&self, params: ListSessionsParams) -> Result<ListSessionsResponse> {
        self.require_capability(|c| c.list_sessions, "listSessions")?;
        debug!("Listing sessions (cwd: {:?})", params.cwd);
        self.call(methods::SESSION_LIST, &params).await
    }

    pub async fn fork_session(&self, session_id: &str, cwd: &str) -> Result<SessionSetup> {
        let flags = self.require_capability(|c| c.fork_session, "forkSession")?;
        debug!("Forking session: {}", session_id);
        let params = ForkSessionParams {
            session_id: session_id.to_string(),
            cwd: cwd.to_string(),
        };
        let session = PendingSession {
            session_id: None,
            cwd: cwd.to_string(),
            flags,
        };
        let setup = self.establish(methods::SESSION_FORK, &params, session).await?;
        if setup.session_id.is_none() {
            return Err(Error::Acp(AcpError::InvalidMessage(
                "session/fork result has no sessionId".to_string(),
            )));
        }
        Ok(setup)
    }

    pub async fn resume_session(
        &self,
        session_id: &str,
        cwd: &str,
        mcp_servers: Vec<McpServer>,
    ) -> Result<SessionSetup> {
        let flags = self.require_capability(|c| c.resume_session, "resumeSession")?;
        debug!("Resuming session: {}", session_id);
        let params = LoadSessionParams {
            session_id: session_id.to_string(),
            cwd: cwd.to_string(),
            mcp_servers,
        };
        let session = PendingSession {
            session_id: Some(session_id.to_string()),
            cwd: cwd.to_string(),
            flags,
        };
        self.establish(methods::SESSION_RESUME, &params, session).await
    }

    // ========================================================================
    // State
    // ========================================================================

    /// Capability flags agreed at `initialize`
    pub fn capabilities(&self) -> Option<CapabilityFlags> {
        self.flags.get().copied()
    }

    pub fn initialize_result(&self) -> Option<&InitializeResult> {
        self.init.get()
    }

    pub fn agent_info(&self) -> Option<AgentInfo> {
        self.init.get().and_then(|r| r.agent_info.clone())
    }

    /// Resolves once the connection has gone away
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Stop reading from the agent. Outstanding requests fail with
    /// `Disconnected` once the read loop tears down.
    pub fn shutdown(&self) {
        self.transport.close();
    }
}

/// Hand a newly accepted session to the host ahead of the response itself
async fn announce_session(delegate: &dyn AgentClient, session: PendingSession, response: &JsonRpcResponse) {
    if response.error.is_some() {
        return;
    }
    let result = response.result.clone().unwrap_or(Value::Null);
    let setup = match serde_json::from_value::<Option<SessionSetup>>(result) {
        Ok(setup) => setup.unwrap_or_default(),
        Err(e) => {
            debug!("Session result did not parse: {}", e);
            return;
        }
    };
    let Some(session_id) = setup.session_id.clone().or(session.session_id) else {
        return;
    };

    debug!("Session {} established", session_id);
    let notification = SessionNotification::Established {
        session_id,
        cwd: session.cwd,
        setup,
        flags: session.flags,
    };
    if let Err(e) = delegate.on_session_notification(notification).await {
        warn!("Session handler failed: {}", e);
    }
}

// ============================================================================
// Agent request dispatch
// ============================================================================

fn decode<T: DeserializeOwned>(request: &JsonRpcRequest) -> std::result::Result<T, (i64, String)> {
    let params = request.params.clone().unwrap_or(Value::Null);
    serde_json::from_value(params).map_err(|e| {
        (
            error_codes::INVALID_PARAMS,
            format!("Invalid params for {}: {}", request.method, e),
        )
    })
}

fn reply<T: Serialize>(result: Result<T>) -> Reply {
    result
        .and_then(|value| Ok(serde_json::to_value(value)?))
        .map_err(|e| (error_codes::INTERNAL_ERROR, e.to_string()))
}

async fn serve(method: InboundMethod, request: &JsonRpcRequest, delegate: &dyn AgentClient) -> Reply {
    match method {
        InboundMethod::RequestPermission => {
            let params: RequestPermissionParams = decode(request)?;
            let response = delegate.request_permission(params).await.unwrap_or_else(|e| {
                warn!("Permission callback failed: {}; denying", e);
                RequestPermissionResponse {
                    outcome: PermissionOutcome::Cancelled,
                }
            });
            reply(Ok(response))
        }
        InboundMethod::ReadTextFile => {
            let params: ReadTextFileParams = decode(request)?;
            let content = delegate.read_text_file(params).await.unwrap_or_else(|e| {
                warn!("Read callback failed: {}; returning empty content", e);
                String::new()
            });
            Ok(json!({ "content": content }))
        }
        InboundMethod::WriteTextFile => {
            let params: WriteTextFileParams = decode(request)?;
            reply(delegate.write_text_file(params).await.map(|()| json!({})))
        }
        InboundMethod::CreateTerminal => {
            let params: CreateTerminalParams = decode(request)?;
            reply(
                delegate
                    .create_terminal(params)
                    .await
                    .map(|terminal_id| CreateTerminalResponse { terminal_id }),
            )
        }
        InboundMethod::TerminalOutput => {
            let params: TerminalIdParams = decode(request)?;
            reply(delegate.terminal_output(&params.terminal_id).await)
        }
        InboundMethod::WaitForTerminalExit => {
            let params: TerminalIdParams = decode(request)?;
            reply(delegate.wait_for_terminal_exit(&params.terminal_id).await)
        }
        InboundMethod::KillTerminal => {
            let params: TerminalIdParams = decode(request)?;
            reply(delegate.kill_terminal(&params.terminal_id).await.map(|()| json!({})))
        }
        InboundMethod::ReleaseTerminal => {
            let params: TerminalIdParams = decode(request)?;
            reply(delegate.release_terminal(&params.terminal_id).await.map(|()| json!({})))
        }
    }
}

/// Serve one agent request. Always produces a response.
async fn handle_agent_request(
    protocol: &ProtocolHandler,
    delegate: &dyn AgentClient,
    request: JsonRpcRequest,
) -> JsonRpcResponse {
    let request_id = request.id.clone().unwrap_or(Value::Null);

    let reply = match InboundMethod::from_method(&request.method) {
        Some(method) => serve(method, &request, delegate).await,
        None => Err((
            error_codes::METHOD_NOT_FOUND,
            format!("Unsupported method: {}", request.method),
        )),
    };

    match reply {
        Ok(result) => protocol.create_response(request_id, &result),
        Err((code, message)) => {
            debug!("Agent request {} failed ({}): {}", request.method, code, message);
            protocol.create_error_response(request_id, code, &message)
        }
    }
}
