//! Core ACP traits for agent communication
//!
//! This module defines the seams between the connection and the host:
//! - `AgentClient` - Callback interface the connection invokes for agent requests
//! - `PermissionHandler` - Host decision for a single permission request
//! - `FileSystem` - File access used to serve `fs/*` requests

use crate::error::{Result, TerminalError};
use crate::types::{
    CapabilityFlags, CreateTerminalParams, ReadTextFileParams, RequestPermissionParams,
    RequestPermissionResponse, SessionSetup, SessionUpdateNotification, TerminalExitStatus,
    TerminalOutputResponse, WriteTextFileParams,
};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;

// ============================================================================
// Notifications
// ============================================================================

/// Notification types that can be received from an agent connection
#[derive(Debug, Clone)]
pub enum SessionNotification {
    /// Session update notification
    Update(SessionUpdateNotification),
    /// The agent accepted session/new, load, resume or fork. Delivered from
    /// the read loop before the response reaches its caller.
    Established {
        session_id: String,
        cwd: String,
        setup: SessionSetup,
        flags: CapabilityFlags,
    },
    /// Handshake finished and a session is current
    Connected { session_id: String },
    /// Connection closed
    Disconnected,
}

// ============================================================================
// Agent Client Trait (Callback Interface)
// ============================================================================

/// Callback interface for handling requests from the agent.
///
/// The agent may request permissions, file operations, or terminals while a
/// prompt is in flight. Each call runs on its own task, so an implementation
/// may suspend for as long as it needs to without stalling the read loop.
/// Terminal methods default to [`TerminalError::Unsupported`].
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Ask the host to approve a tool call
    async fn request_permission(
        &self,
        params: RequestPermissionParams,
    ) -> Result<RequestPermissionResponse>;

    /// Read a text file
    async fn read_text_file(&self, params: ReadTextFileParams) -> Result<String>;

    /// Write a text file
    async fn write_text_file(&self, params: WriteTextFileParams) -> Result<()>;

    /// Spawn a terminal and return its id
    async fn create_terminal(&self, _params: CreateTerminalParams) -> Result<String> {
        Err(TerminalError::Unsupported.into())
    }

    async fn terminal_output(&self, _terminal_id: &str) -> Result<TerminalOutputResponse> {
        Err(TerminalError::Unsupported.into())
    }

    async fn wait_for_terminal_exit(&self, _terminal_id: &str) -> Result<TerminalExitStatus> {
        Err(TerminalError::Unsupported.into())
    }

    async fn kill_terminal(&self, _terminal_id: &str) -> Result<()> {
        Err(TerminalError::Unsupported.into())
    }

    async fn release_terminal(&self, _terminal_id: &str) -> Result<()> {
        Err(TerminalError::Unsupported.into())
    }

    /// Handle a session notification. Called inline from the read loop in
    /// arrival order, so it must not wait on the host.
    async fn on_session_notification(&self, notification: SessionNotification) -> Result<()>;
}

// ============================================================================
// Permission Handler
// ============================================================================

/// Host verdict on a permission request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionDecision {
    pub granted: bool,
    /// Explicit option to select; must be one of the offered ids
    pub option_id: Option<String>,
}

impl PermissionDecision {
    pub fn allow() -> Self {
        Self {
            granted: true,
            option_id: None,
        }
    }

    pub fn deny() -> Self {
        Self::default()
    }

    pub fn select(option_id: impl Into<String>) -> Self {
        Self {
            granted: true,
            option_id: Some(option_id.into()),
        }
    }
}

/// Host-supplied permission policy
#[async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn decide(&self, request: &RequestPermissionParams) -> Result<PermissionDecision>;
}

#[async_trait]
impl<F, Fut> PermissionHandler for F
where
    F: Fn(RequestPermissionParams) -> Fut + Send + Sync,
    Fut: Future<Output = PermissionDecision> + Send,
{
    async fn decide(&self, request: &RequestPermissionParams) -> Result<PermissionDecision> {
        Ok((self)(request.clone()).await)
    }
}

// ============================================================================
// File System
// ============================================================================

/// File access used to serve the agent's `fs/*` requests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read_text_file(&self, path: &Path) -> Result<String>;

    /// Write the whole file, creating parent directories as needed
    async fn write_text_file(&self, path: &Path, content: &str) -> Result<()>;
}
