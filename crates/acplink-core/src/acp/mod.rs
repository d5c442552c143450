//! ACP (Agent Client Protocol) implementation
//!
//! This module implements the client side of the ACP protocol for communicating
//! with AI agents via JSON-RPC over stdin/stdout.
//!
//! # Architecture
//!
//! - `AgentProcess` - The agent subprocess and its exit signal
//! - `Transport` / `AcpCodec` - Newline-delimited JSON framing over the pipes
//! - `AcpConnection` - Request/response correlation and inbound dispatch
//! - `ClientDelegate` - The `AgentClient` callbacks served on the host's behalf
//! - `SessionStore` - The current session's state
//! - `PromptTranslator` - Session updates to `StreamEvent`s for one prompt

mod client_delegate;
pub mod codec;
mod connection;
mod events;
mod process;
pub mod protocol;
mod session;
pub mod traits;
mod transport;

// Re-export core traits
pub use traits::{
    AgentClient, FileSystem, PermissionDecision, PermissionHandler, SessionNotification,
};

// Re-export implementations
pub use client_delegate::{resolve_permission, ClientDelegate, PermissionSlot, Superseded};
pub use codec::AcpCodec;
pub use connection::AcpConnection;
pub use events::{PromptTranslator, StreamEvent, TranslatorState};
pub use process::{AgentProcess, ProcessExit};
pub use protocol::{AcpMessage, InboundMethod, ProtocolHandler};
pub use session::{Session, SessionStore};
pub use transport::Transport;
