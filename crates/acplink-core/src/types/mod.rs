//! Core type definitions for acplink
//!
//! This module contains the shared wire types exchanged with an ACP agent:
//! JSON-RPC envelopes, handshake and session payloads, session updates,
//! tool calls, plans and the host-callback request shapes.

mod acp_types;
mod session_types;

pub use acp_types::*;
pub use session_types::*;

use serde::{Deserialize, Serialize};

/// Content block that can contain text, images, or other content types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        data: String,
        #[serde(rename = "mimeType")]
        mime_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        uri: Option<String>,
    },
    ResourceLink {
        uri: String,
        name: String,
        #[serde(rename = "mimeType", default, skip_serializing_if = "Option::is_none")]
        mime_type: Option<String>,
    },
    Resource {
        resource: serde_json::Value,
    },
    #[serde(other)]
    Unsupported,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Text payload, if this is a text block
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Plan entry from agent planning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub content: String,
    pub status: PlanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<PlanPriority>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PlanPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
}

/// Name/value pair used for environment variables and HTTP headers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVariable {
    pub name: String,
    pub value: String,
}

impl EnvVariable {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// MCP server handed to the agent when a session is established
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum McpServer {
    /// Remote server reached over HTTP or SSE
    Http {
        #[serde(rename = "type")]
        transport: McpHttpTransport,
        name: String,
        url: String,
        #[serde(default)]
        headers: Vec<EnvVariable>,
    },
    /// Server spawned by the agent over stdio
    Stdio {
        name: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: Vec<EnvVariable>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum McpHttpTransport {
    Http,
    Sse,
}

/// Why a prompt cycle ended
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
    #[serde(other)]
    Other,
}

/// Coarse connection state for host status indicators
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// A prompt is in flight
    Thinking,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_content_block_unknown_type() {
        let block: ContentBlock = serde_json::from_value(json!({"type": "audio", "data": "x"})).unwrap();
        assert_eq!(block, ContentBlock::Unsupported);
        assert!(block.as_text().is_none());
    }

    #[test]
    fn test_mcp_server_shapes() {
        let stdio: McpServer = serde_json::from_value(json!({
            "name": "files",
            "command": "mcp-files",
            "args": ["--root", "/tmp"],
            "env": [{"name": "DEBUG", "value": "1"}]
        }))
        .unwrap();
        assert!(matches!(stdio, McpServer::Stdio { ref args, .. } if args.len() == 2));

        let http: McpServer = serde_json::from_value(json!({
            "type": "sse",
            "name": "remote",
            "url": "https://example.invalid/mcp"
        }))
        .unwrap();
        assert!(matches!(
            http,
            McpServer::Http { transport: McpHttpTransport::Sse, .. }
        ));
    }

    #[test]
    fn test_stop_reason_unknown_maps_to_other() {
        let reason: StopReason = serde_json::from_value(json!("context_window")).unwrap();
        assert_eq!(reason, StopReason::Other);
        let reason: StopReason = serde_json::from_value(json!("max_turn_requests")).unwrap();
        assert_eq!(reason, StopReason::MaxTurnRequests);
    }
}
