//! Connection configuration
//!
//! [`ConnectConfig`] says which agent to spawn and how to talk to it. Every
//! field has a default, so a TOML file only needs the keys it changes.

use crate::error::{ConfigError, Result};
use crate::sandbox::{expand_home, PathGuard};
use crate::types::{ClientInfo, McpServer, ACP_PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Agent launched when no `binaryPath` is configured
pub const DEFAULT_AGENT_COMMAND: &str = "claude-code-acp";

/// Environment variable the API key is read from by default
pub const DEFAULT_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

/// Who owns terminals the agent asks for
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// The client spawns and tracks terminals itself
    #[default]
    Native,
    /// Transport only; terminal requests are refused
    Passthrough,
}

/// Settings for one agent connection
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectConfig {
    /// Working directory for the agent and its sessions
    pub cwd: PathBuf,
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub binary_path: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub mcp_servers: Vec<McpServer>,
    pub mode: OperatingMode,
    pub protocol_version: u32,
    pub request_timeout_secs: u64,
    pub cancel_timeout_secs: u64,
    /// Queued updates at which a lagging stream consumer is reported
    pub event_buffer: usize,
    /// Directories `fs/*` requests are confined to; empty allows any path
    pub allowed_roots: Vec<PathBuf>,
    pub client_name: String,
    pub client_version: String,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        let client = ClientInfo::default();
        Self {
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            binary_path: None,
            args: Vec::new(),
            env: HashMap::new(),
            mcp_servers: Vec::new(),
            mode: OperatingMode::Native,
            protocol_version: ACP_PROTOCOL_VERSION,
            request_timeout_secs: 60,
            cancel_timeout_secs: 10,
            event_buffer: 256,
            allowed_roots: Vec::new(),
            client_name: client.name,
            client_version: client.version,
        }
    }
}

impl ConnectConfig {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(ConfigError::Parse)?;
        Ok(config)
    }

    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading config from {:?}", path);
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&raw)
    }

    /// Program to spawn: `binaryPath` with `~` expanded, else the default agent
    pub fn command(&self) -> String {
        match self.binary_path.as_deref() {
            Some(path) if !path.trim().is_empty() => {
                expand_home(Path::new(path)).to_string_lossy().into_owned()
            }
            _ => DEFAULT_AGENT_COMMAND.to_string(),
        }
    }

    /// Explicit key, else the configured environment variable
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|key| !key.is_empty())
    }

    /// Environment for the agent process: configured `env` plus the API key
    pub fn agent_env(&self) -> HashMap<String, String> {
        let mut env = self.env.clone();
        match self.resolve_api_key() {
            Some(key) => {
                env.insert(self.api_key_env.clone(), key);
            }
            None => warn!(
                "No API key configured and {} is not set; the agent must supply its own credentials",
                self.api_key_env
            ),
        }
        env
    }

    /// Guard for the agent's file requests
    pub fn path_guard(&self) -> PathGuard {
        PathGuard::with_roots(&self.allowed_roots)
    }

    pub fn cwd_string(&self) -> String {
        self.cwd.to_string_lossy().into_owned()
    }

    /// `None` disables the timeout
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_secs(self.cancel_timeout_secs)
    }

    pub fn client_info(&self) -> ClientInfo {
        ClientInfo {
            name: self.client_name.clone(),
            version: self.client_version.clone(),
        }
    }
}
