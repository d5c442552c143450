//! Error types for acplink

use thiserror::Error;

/// Main error type for acplink operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Connect error: {0}")]
    Connect(#[from] ConnectError),

    #[error("ACP protocol error: {0}")]
    Acp(#[from] AcpError),

    #[error("Terminal error: {0}")]
    Terminal(#[from] TerminalError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Host callback failed: {0}")]
    Callback(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// True when the agent process is gone and the host must reconnect.
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Error::Acp(AcpError::Disconnected))
    }
}

/// Failures that prevent a connection from being established
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("Failed to spawn agent process '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("Failed to capture agent {0}")]
    MissingPipe(&'static str),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
}

/// ACP-specific errors
#[derive(Error, Debug)]
pub enum AcpError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Agent returned error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    #[error("Agent disconnected")]
    Disconnected,

    #[error("Request timeout")]
    Timeout,

    #[error("Connection is not initialized")]
    NotInitialized,

    #[error("Not connected to an agent")]
    NotConnected,

    #[error("No active session")]
    NoActiveSession,

    #[error("Capability not supported: {0}")]
    CapabilityNotSupported(String),
}

/// Terminal registry errors
#[derive(Error, Debug)]
pub enum TerminalError {
    #[error("Terminals are not available in passthrough mode")]
    Unsupported,

    #[error("Terminal not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn terminal command '{command}': {reason}")]
    SpawnFailed { command: String, reason: String },
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

impl serde::Serialize for Error {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;
