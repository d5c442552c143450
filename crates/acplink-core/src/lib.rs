//! acplink Core Library
//!
//! This crate provides the client side of the Agent Client Protocol:
//! - Agent subprocess transport and newline-delimited JSON-RPC framing
//! - Request/response correlation and inbound request dispatch
//! - Session state and prompt event streaming
//! - Permission, file system and terminal callbacks served for the agent
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     acplink-core                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  client.rs     - Host-facing AcpClient                      │
//! │  acp/          - Process, codec, connection, session, events│
//! │  sandbox/      - Path guard, local fs, terminal registry    │
//! │  types/        - Wire types                                 │
//! │  config.rs     - ConnectConfig                              │
//! │  error.rs      - Error types                                │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod acp;
pub mod client;
pub mod config;
pub mod error;
pub mod sandbox;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;

// Re-export ACP traits and implementations
pub use acp::{
    // Traits
    AgentClient, FileSystem, PermissionHandler,
    // Implementations
    AcpConnection, ClientDelegate, PermissionDecision, PromptTranslator, Session,
    SessionNotification, SessionStore, StreamEvent,
};

pub use client::{AcpClient, EventStream, SendOptions};
pub use config::{ConnectConfig, OperatingMode};

// Re-export sandbox components
pub use sandbox::{LocalFileSystem, PathGuard, TerminalHandle, TerminalRegistry};
