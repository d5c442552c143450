//! Agent Client Delegate implementation
//!
//! [`ClientDelegate`] is the [`AgentClient`] the connection calls back into.
//! It routes permission requests to the host's handler, file requests to a
//! [`FileSystem`], terminal requests to the [`TerminalRegistry`], and session
//! notifications into the session store, the active prompt and the host
//! broadcast.

use super::session::SessionStore;
use super::traits::{AgentClient, FileSystem, PermissionDecision, PermissionHandler, SessionNotification};
use crate::error::{Result, TerminalError};
use crate::sandbox::{line_window, TerminalRegistry};
use crate::types::{
    ConnectionStatus, CreateTerminalParams, PermissionOptionKind, PermissionOutcome,
    ReadTextFileParams, RequestPermissionParams, RequestPermissionResponse, SessionUpdate,
    TerminalExitStatus, TerminalOutputResponse, WriteTextFileParams,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Host permission handler, replaceable while connected
pub type PermissionSlot = Arc<RwLock<Option<Arc<dyn PermissionHandler>>>>;

/// Where updates for the in-flight prompt go
struct PromptSink {
    id: u64,
    session_id: String,
    tx: mpsc::UnboundedSender<SessionUpdate>,
    cancel: CancellationToken,
}

/// Prompt displaced by a newer [`ClientDelegate::begin_prompt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superseded {
    pub prompt_id: u64,
    pub session_id: String,
}

/// Default implementation of AgentClient backed by the sandbox services
pub struct ClientDelegate {
    sessions: SessionStore,
    file_system: Arc<dyn FileSystem>,
    /// `None` in passthrough mode
    terminals: Option<Arc<TerminalRegistry>>,
    permission_handler: PermissionSlot,
    prompt: Mutex<Option<PromptSink>>,
    next_prompt_id: AtomicU64,
    notification_tx: Option<broadcast::Sender<SessionNotification>>,
    status: Arc<RwLock<ConnectionStatus>>,
    /// Shared connection counter and the value it had when this delegate was built
    generation: Arc<AtomicU64>,
    own_generation: u64,
}

impl ClientDelegate {
    pub fn new(sessions: SessionStore, file_system: Arc<dyn FileSystem>) -> Self {
        Self {
            sessions,
            file_system,
            terminals: None,
            permission_handler: PermissionSlot::default(),
            prompt: Mutex::new(None),
            next_prompt_id: AtomicU64::new(1),
            notification_tx: None,
            status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            generation: Arc::new(AtomicU64::new(0)),
            own_generation: 0,
        }
    }

    /// Serve `terminal/*` requests from this registry (native mode)
    pub fn with_terminals(mut self, terminals: Arc<TerminalRegistry>) -> Self {
        self.terminals = Some(terminals);
        self
    }

    pub fn with_permission_handler(mut self, slot: PermissionSlot) -> Self {
        self.permission_handler = slot;
        self
    }

    /// Create a new delegate with notification support
    pub fn with_notifications(mut self, tx: broadcast::Sender<SessionNotification>) -> Self {
        self.notification_tx = Some(tx);
        self
    }

    pub fn with_status(mut self, status: Arc<RwLock<ConnectionStatus>>) -> Self {
        self.status = status;
        self
    }

    /// Only touch shared state while `counter` still reads `generation`
    pub fn with_generation(mut self, counter: Arc<AtomicU64>, generation: u64) -> Self {
        self.generation = counter;
        self.own_generation = generation;
        self
    }

    /// False once a newer connection has replaced this one
    pub fn is_current(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == self.own_generation
    }

    /// Route updates for `session_id` into `tx` until [`end_prompt`] is
    /// called with the returned id. Replaces any previous prompt sink, whose
    /// stream is cancelled and returned so the agent can be told as well.
    ///
    /// [`end_prompt`]: Self::end_prompt
    pub fn begin_prompt(
        &self,
        session_id: String,
        tx: mpsc::UnboundedSender<SessionUpdate>,
        cancel: CancellationToken,
    ) -> (u64, Option<Superseded>) {
        let id = self.next_prompt_id.fetch_add(1, Ordering::SeqCst);
        let previous = self.prompt.lock().replace(PromptSink {
            id,
            session_id,
            tx,
            cancel,
        });
        let superseded = previous.map(|previous| {
            warn!("Prompt {} superseded by prompt {}", previous.id, id);
            previous.cancel.cancel();
            Superseded {
                prompt_id: previous.id,
                session_id: previous.session_id,
            }
        });
        (id, superseded)
    }

    pub fn end_prompt(&self, id: u64) {
        let mut prompt = self.prompt.lock();
        if prompt.as_ref().map_or(false, |p| p.id == id) {
            *prompt = None;
        }
    }

    /// Cancel the in-flight prompt. Pending permission requests resolve as
    /// cancelled. Returns false when no prompt is active.
    pub fn cancel_prompt(&self) -> bool {
        match self.prompt.lock().as_ref() {
            Some(sink) => {
                sink.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn terminals(&self) -> Option<&Arc<TerminalRegistry>> {
        self.terminals.as_ref()
    }

    fn terminal_registry(&self) -> Result<&Arc<TerminalRegistry>> {
        self.terminals
            .as_ref()
            .ok_or_else(|| TerminalError::Unsupported.into())
    }

    fn prompt_cancel_token(&self, session_id: &str) -> Option<CancellationToken> {
        self.prompt
            .lock()
            .as_ref()
            .filter(|p| p.session_id == session_id)
            .map(|p| p.cancel.clone())
    }

    /// Queue an update for the in-flight prompt. Never waits on the consumer.
    fn deliver(&self, session_id: &str, update: &SessionUpdate) {
        let prompt = self.prompt.lock();
        if let Some(sink) = prompt.as_ref().filter(|p| p.session_id == session_id) {
            if sink.tx.send(update.clone()).is_err() {
                debug!("Prompt stream dropped; update not delivered");
            }
        }
    }

    fn release_connection_resources(&self) {
        if let Some(ref terminals) = self.terminals {
            terminals.release_all();
        }
        self.prompt.lock().take();
    }

    fn broadcast(&self, notification: SessionNotification) {
        if let Some(ref tx) = self.notification_tx {
            // No subscribers is fine
            let _ = tx.send(notification);
        }
    }
}

/// Map a host decision onto the options the agent offered
pub fn resolve_permission(
    request: &RequestPermissionParams,
    decision: PermissionDecision,
) -> RequestPermissionResponse {
    let cancelled = RequestPermissionResponse {
        outcome: PermissionOutcome::Cancelled,
    };

    if let Some(option_id) = decision.option_id {
        if request.options.iter().any(|o| o.option_id == option_id) {
            return RequestPermissionResponse {
                outcome: PermissionOutcome::Selected { option_id },
            };
        }
        warn!("Host selected unknown permission option {}", option_id);
        return cancelled;
    }

    if !decision.granted {
        return cancelled;
    }

    [PermissionOptionKind::AllowOnce, PermissionOptionKind::AllowAlways]
        .iter()
        .find_map(|kind| request.options.iter().find(|o| o.kind == *kind))
        .map(|option| RequestPermissionResponse {
            outcome: PermissionOutcome::Selected {
                option_id: option.option_id.clone(),
            },
        })
        .unwrap_or(cancelled)
}

#[async_trait]
impl AgentClient for ClientDelegate {
    async fn request_permission(
        &self,
        params: RequestPermissionParams,
    ) -> Result<RequestPermissionResponse> {
        debug!(
            "Permission request for session {}: {} ({} options)",
            params.session_id,
            params.tool_call.tool_call_id,
            params.options.len()
        );

        let handler = self.permission_handler.read().clone();
        let Some(handler) = handler else {
            info!("No permission handler registered; denying");
            return Ok(resolve_permission(&params, PermissionDecision::deny()));
        };

        let decision = match self.prompt_cancel_token(&params.session_id) {
            Some(cancel) => tokio::select! {
                decision = handler.decide(&params) => decision,
                _ = cancel.cancelled() => {
                    debug!("Prompt cancelled while permission was pending");
                    Ok(PermissionDecision::deny())
                }
            },
            None => handler.decide(&params).await,
        };

        let decision = decision.unwrap_or_else(|e| {
            warn!("Permission handler failed: {}; denying", e);
            PermissionDecision::deny()
        });
        Ok(resolve_permission(&params, decision))
    }

    async fn read_text_file(&self, params: ReadTextFileParams) -> Result<String> {
        debug!("Reading file for session {}: {}", params.session_id, params.path);
        match self.file_system.read_text_file(Path::new(&params.path)).await {
            Ok(content) => Ok(line_window(&content, params.line, params.limit)),
            Err(e) => {
                warn!("Read of {} failed: {}; returning empty content", params.path, e);
                Ok(String::new())
            }
        }
    }

    async fn write_text_file(&self, params: WriteTextFileParams) -> Result<()> {
        debug!("Writing file for session {}: {}", params.session_id, params.path);
        self.file_system
            .write_text_file(Path::new(&params.path), &params.content)
            .await
    }

    async fn create_terminal(&self, params: CreateTerminalParams) -> Result<String> {
        let handle = self.terminal_registry()?.create(&params)?;
        Ok(handle.id().to_string())
    }

    async fn terminal_output(&self, terminal_id: &str) -> Result<TerminalOutputResponse> {
        self.terminal_registry()?.output(terminal_id)
    }

    async fn wait_for_terminal_exit(&self, terminal_id: &str) -> Result<TerminalExitStatus> {
        self.terminal_registry()?.wait_for_exit(terminal_id).await
    }

    async fn kill_terminal(&self, terminal_id: &str) -> Result<()> {
        self.terminal_registry()?.kill(terminal_id)
    }

    async fn release_terminal(&self, terminal_id: &str) -> Result<()> {
        self.terminal_registry()?.release(terminal_id)
    }

    async fn on_session_notification(&self, notification: SessionNotification) -> Result<()> {
        if !self.is_current() {
            // Session store, status and broadcast belong to the newer connection
            match &notification {
                SessionNotification::Update(update) => self.deliver(&update.session_id, &update.update),
                SessionNotification::Disconnected => {
                    debug!("Superseded connection closed");
                    self.release_connection_resources();
                }
                _ => {}
            }
            return Ok(());
        }

        match &notification {
            SessionNotification::Update(update) => {
                self.sessions.apply_update(update);
                self.deliver(&update.session_id, &update.update);
            }
            SessionNotification::Established {
                session_id,
                cwd,
                setup,
                flags,
            } => {
                self.sessions
                    .establish(session_id.clone(), cwd.clone(), setup.clone(), *flags);
            }
            SessionNotification::Disconnected => {
                info!("Agent disconnected");
                self.sessions.mark_inactive();
                self.release_connection_resources();
                *self.status.write() = ConnectionStatus::Disconnected;
            }
            SessionNotification::Connected { .. } => {}
        }
        self.broadcast(notification);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acp::traits::MockFileSystem;
    use crate::error::Error;
    use crate::sandbox::LocalFileSystem;
    use crate::types::{
        CapabilityFlags, PermissionOption, SessionSetup, SessionUpdateNotification,
        ToolCallUpdateFields,
    };
    use serde_json::json;

    fn permission_request() -> RequestPermissionParams {
        RequestPermissionParams {
            session_id: "s1".to_string(),
            tool_call: ToolCallUpdateFields {
                tool_call_id: "t1".to_string(),
                ..Default::default()
            },
            options: vec![
                PermissionOption {
                    option_id: "a".to_string(),
                    name: "Allow".to_string(),
                    kind: PermissionOptionKind::AllowOnce,
                },
                PermissionOption {
                    option_id: "b".to_string(),
                    name: "Reject".to_string(),
                    kind: PermissionOptionKind::RejectOnce,
                },
            ],
        }
    }

    fn chunk(session_id: &str, text: &str) -> SessionNotification {
        let update: SessionUpdateNotification = serde_json::from_value(json!({
            "sessionId": session_id,
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": text}
            }
        }))
        .unwrap();
        SessionNotification::Update(update)
    }

    fn mode_update(session_id: &str, mode: &str) -> SessionNotification {
        let update: SessionUpdateNotification = serde_json::from_value(json!({
            "sessionId": session_id,
            "update": {"sessionUpdate": "current_mode_update", "currentModeId": mode}
        }))
        .unwrap();
        SessionNotification::Update(update)
    }

    fn delegate() -> ClientDelegate {
        ClientDelegate::new(SessionStore::new(), Arc::new(LocalFileSystem::new()))
    }

    fn with_handler(delegate: ClientDelegate, handler: impl PermissionHandler + 'static) -> ClientDelegate {
        let handler: Arc<dyn PermissionHandler> = Arc::new(handler);
        delegate.with_permission_handler(Arc::new(RwLock::new(Some(handler))))
    }

    #[test]
    fn test_resolve_permission() {
        let request = permission_request();
        assert_eq!(
            resolve_permission(&request, PermissionDecision::allow()).outcome,
            PermissionOutcome::Selected {
                option_id: "a".to_string()
            }
        );
        assert_eq!(
            resolve_permission(&request, PermissionDecision::deny()).outcome,
            PermissionOutcome::Cancelled
        );
        assert_eq!(
            resolve_permission(&request, PermissionDecision::select("b")).outcome,
            PermissionOutcome::Selected {
                option_id: "b".to_string()
            }
        );
        assert_eq!(
            resolve_permission(&request, PermissionDecision::select("zzz")).outcome,
            PermissionOutcome::Cancelled
        );
    }

    #[test]
    fn test_granted_without_allow_option_is_cancelled() {
        let mut request = permission_request();
        request.options.retain(|o| !o.kind.is_allow());
        assert_eq!(
            resolve_permission(&request, PermissionDecision::allow()).outcome,
            PermissionOutcome::Cancelled
        );
    }

    #[tokio::test]
    async fn test_no_handler_denies() {
        let response = delegate().request_permission(permission_request()).await.unwrap();
        assert_eq!(
            serde_json::to_value(response).unwrap(),
            json!({"outcome": {"outcome": "cancelled"}})
        );
    }

    #[tokio::test]
    async fn test_handler_denial() {
        let delegate = with_handler(delegate(), |_req: RequestPermissionParams| async {
            PermissionDecision::deny()
        });
        let response = delegate.request_permission(permission_request()).await.unwrap();
        assert_eq!(response.outcome, PermissionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_resolves_pending_permission() {
        let delegate = Arc::new(with_handler(delegate(), |_req: RequestPermissionParams| async {
            std::future::pending::<PermissionDecision>().await
        }));
        let (tx, _rx) = mpsc::unbounded_channel();
        delegate.begin_prompt("s1".to_string(), tx, CancellationToken::new());

        let pending = tokio::spawn({
            let delegate = Arc::clone(&delegate);
            async move { delegate.request_permission(permission_request()).await }
        });
        tokio::task::yield_now().await;
        assert!(delegate.cancel_prompt());

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.outcome, PermissionOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_read_failure_returns_empty_content() {
        let mut fs = MockFileSystem::new();
        fs.expect_read_text_file()
            .returning(|_| Err(Error::AccessDenied("nope".to_string())));
        let delegate = ClientDelegate::new(SessionStore::new(), Arc::new(fs));

        let content = delegate
            .read_text_file(ReadTextFileParams {
                session_id: "s1".to_string(),
                path: "/missing".to_string(),
                line: None,
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(content, "");
    }

    #[tokio::test]
    async fn test_read_applies_line_window() {
        let mut fs = MockFileSystem::new();
        fs.expect_read_text_file()
            .withf(|path| path == Path::new("/notes.txt"))
            .returning(|_| Ok("one\ntwo\nthree\n".to_string()));
        let delegate = ClientDelegate::new(SessionStore::new(), Arc::new(fs));

        let content = delegate
            .read_text_file(ReadTextFileParams {
                session_id: "s1".to_string(),
                path: "/notes.txt".to_string(),
                line: Some(2),
                limit: Some(1),
            })
            .await
            .unwrap();
        assert_eq!(content, "two\n");
    }

    #[tokio::test]
    async fn test_write_failure_propagates() {
        let mut fs = MockFileSystem::new();
        fs.expect_write_text_file()
            .returning(|_, _| Err(Error::AccessDenied("outside".to_string())));
        let delegate = ClientDelegate::new(SessionStore::new(), Arc::new(fs));

        let result = delegate
            .write_text_file(WriteTextFileParams {
                session_id: "s1".to_string(),
                path: "/etc/passwd".to_string(),
                content: "x".to_string(),
            })
            .await;
        assert!(matches!(result, Err(Error::AccessDenied(_))));
    }

    #[tokio::test]
    async fn test_terminals_unsupported_in_passthrough() {
        let result = delegate()
            .create_terminal(CreateTerminalParams {
                command: "true".to_string(),
                ..Default::default()
            })
            .await;
        assert!(matches!(result, Err(Error::Terminal(TerminalError::Unsupported))));
    }

    #[tokio::test]
    async fn test_updates_routed_to_matching_prompt() {
        let (notify_tx, mut notify_rx) = broadcast::channel(8);
        let delegate = delegate().with_notifications(notify_tx);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (prompt, _) = delegate.begin_prompt("s1".to_string(), tx, CancellationToken::new());

        for session_id in ["other", "s1"] {
            let update: SessionUpdateNotification = serde_json::from_value(json!({
                "sessionId": session_id,
                "update": {
                    "sessionUpdate": "agent_message_chunk",
                    "content": {"type": "text", "text": session_id}
                }
            }))
            .unwrap();
            delegate
                .on_session_notification(SessionNotification::Update(update))
                .await
                .unwrap();
        }

        match rx.try_recv().unwrap() {
            SessionUpdate::AgentMessageChunk { content } => assert_eq!(content.as_text(), Some("s1")),
            other => panic!("unexpected update: {other:?}"),
        }
        assert!(rx.try_recv().is_err());

        // Every update is broadcast regardless of the prompt
        assert!(matches!(notify_rx.try_recv(), Ok(SessionNotification::Update(_))));
        assert!(matches!(notify_rx.try_recv(), Ok(SessionNotification::Update(_))));

        delegate.end_prompt(prompt);
        assert!(!delegate.cancel_prompt());
    }

    #[tokio::test]
    async fn test_disconnect_marks_session_inactive() {
        let store = SessionStore::new();
        store.establish(
            "s1".into(),
            "/work".into(),
            SessionSetup::default(),
            CapabilityFlags::default(),
        );
        let status = Arc::new(RwLock::new(ConnectionStatus::Connected));
        let delegate = ClientDelegate::new(store.clone(), Arc::new(LocalFileSystem::new()))
            .with_terminals(Arc::new(TerminalRegistry::new(None)))
            .with_status(Arc::clone(&status));

        delegate
            .on_session_notification(SessionNotification::Disconnected)
            .await
            .unwrap();

        assert!(!store.snapshot().unwrap().is_active);
        assert_eq!(*status.read(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_updates_never_wait_for_the_consumer() {
        let delegate = delegate();
        let (tx, mut rx) = mpsc::unbounded_channel();
        delegate.begin_prompt("s1".to_string(), tx, CancellationToken::new());

        let flood = async {
            for i in 0..1000 {
                delegate
                    .on_session_notification(chunk("s1", &i.to_string()))
                    .await
                    .unwrap();
            }
        };
        tokio::time::timeout(std::time::Duration::from_secs(1), flood)
            .await
            .expect("delivery blocked on an undrained stream");

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 1000);
    }

    #[tokio::test]
    async fn test_established_session_takes_following_updates() {
        let store = SessionStore::new();
        let delegate = ClientDelegate::new(store.clone(), Arc::new(LocalFileSystem::new()));
        let setup: SessionSetup = serde_json::from_value(json!({
            "sessionId": "s1",
            "modes": {"currentModeId": "ask", "availableModes": []}
        }))
        .unwrap();

        delegate
            .on_session_notification(SessionNotification::Established {
                session_id: "s1".to_string(),
                cwd: "/work".to_string(),
                setup,
                flags: CapabilityFlags::default(),
            })
            .await
            .unwrap();
        delegate.on_session_notification(mode_update("s1", "code")).await.unwrap();

        let session = store.snapshot().unwrap();
        assert_eq!(session.working_directory, "/work");
        assert_eq!(session.current_mode.as_deref(), Some("code"));
    }

    #[tokio::test]
    async fn test_begin_prompt_reports_superseded_prompt() {
        let delegate = delegate();
        let first_cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (first, none) = delegate.begin_prompt("s1".to_string(), tx, first_cancel.clone());
        assert!(none.is_none());

        let (tx, _rx) = mpsc::unbounded_channel();
        let (_, superseded) = delegate.begin_prompt("s1".to_string(), tx, CancellationToken::new());
        assert_eq!(
            superseded,
            Some(Superseded {
                prompt_id: first,
                session_id: "s1".to_string()
            })
        );
        assert!(first_cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_superseded_connection_leaves_shared_state_alone() {
        let store = SessionStore::new();
        store.establish(
            "s2".into(),
            "/work".into(),
            SessionSetup::default(),
            CapabilityFlags::default(),
        );
        let status = Arc::new(RwLock::new(ConnectionStatus::Connected));
        let counter = Arc::new(AtomicU64::new(1));
        let (notify_tx, mut notify_rx) = broadcast::channel(8);
        let stale = ClientDelegate::new(store.clone(), Arc::new(LocalFileSystem::new()))
            .with_status(Arc::clone(&status))
            .with_notifications(notify_tx)
            .with_generation(Arc::clone(&counter), 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        stale.begin_prompt("s1".to_string(), tx, CancellationToken::new());
        assert!(stale.is_current());

        counter.fetch_add(1, Ordering::SeqCst);
        assert!(!stale.is_current());

        stale.on_session_notification(mode_update("s2", "code")).await.unwrap();
        stale.on_session_notification(chunk("s1", "late")).await.unwrap();
        stale
            .on_session_notification(SessionNotification::Disconnected)
            .await
            .unwrap();

        let session = store.snapshot().unwrap();
        assert!(session.is_active);
        assert_eq!(session.current_mode, None);
        assert_eq!(*status.read(), ConnectionStatus::Connected);
        assert!(notify_rx.try_recv().is_err());

        // Its own prompt still gets its update, then the sink is dropped
        assert!(matches!(rx.try_recv(), Ok(SessionUpdate::AgentMessageChunk { .. })));
        assert!(!stale.cancel_prompt());
    }
}
