//! ACP Protocol message handling

use crate::error::{AcpError, Error, Result};
use crate::types::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, SessionUpdateNotification, JSONRPC_VERSION};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{trace, warn};

/// Method names used on the wire
pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const SESSION_NEW: &str = "session/new";
    pub const SESSION_LOAD: &str = "session/load";
    pub const SESSION_PROMPT: &str = "session/prompt";
    pub const SESSION_CANCEL: &str = "session/cancel";
    pub const SESSION_SET_MODE: &str = "session/set_mode";
    pub const SESSION_SET_MODEL: &str = "session/set_model";
    pub const SESSION_SET_CONFIG_OPTION: &str = "session/set_config_option";
    pub const SESSION_LIST: &str = "session/list";
    pub const SESSION_FORK: &str = "session/fork";
    pub const SESSION_RESUME: &str = "session/resume";

    pub const SESSION_UPDATE: &str = "session/update";
}

/// JSON-RPC error codes sent back to the agent
pub mod error_codes {
    pub const INVALID_PARAMS: i64 = -32602;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Requests the agent may send to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundMethod {
    RequestPermission,
    ReadTextFile,
    WriteTextFile,
    CreateTerminal,
    TerminalOutput,
    WaitForTerminalExit,
    KillTerminal,
    ReleaseTerminal,
}

impl InboundMethod {
    /// Match a method name, accepting both the snake_case and camelCase spellings
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "session/request_permission" | "permission/request" => Some(Self::RequestPermission),
            "fs/read_text_file" | "fs/readTextFile" => Some(Self::ReadTextFile),
            "fs/write_text_file" | "fs/writeTextFile" => Some(Self::WriteTextFile),
            "terminal/create" => Some(Self::CreateTerminal),
            "terminal/output" => Some(Self::TerminalOutput),
            "terminal/wait_for_exit" | "terminal/waitForExit" => Some(Self::WaitForTerminalExit),
            "terminal/kill" => Some(Self::KillTerminal),
            "terminal/release" => Some(Self::ReleaseTerminal),
            _ => None,
        }
    }
}

/// Protocol handler for ACP messages
pub struct ProtocolHandler {
    request_id: AtomicU64,
}

impl ProtocolHandler {
    pub fn new() -> Self {
        Self {
            request_id: AtomicU64::new(1),
        }
    }

    /// Generate next request ID
    pub fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Build a request with a fresh id
    pub fn request<P: Serialize>(&self, method: &str, params: &P) -> Result<(u64, JsonRpcRequest)> {
        let id = self.next_id();
        let params = serde_json::to_value(params)?;
        Ok((id, JsonRpcRequest::new(id, method, Some(params))))
    }

    /// Build a notification (no id, no response expected)
    pub fn notification<P: Serialize>(&self, method: &str, params: &P) -> Result<JsonRpcRequest> {
        let params = serde_json::to_value(params)?;
        Ok(JsonRpcRequest::notification(method, Some(params)))
    }

    /// Decode a response's result, turning an error payload into `AcpError::Rpc`
    pub fn parse_result<T: DeserializeOwned>(&self, method: &str, response: JsonRpcResponse) -> Result<T> {
        let result = Self::into_result(response)?;
        serde_json::from_value(result).map_err(|e| {
            Error::Acp(AcpError::InvalidMessage(format!(
                "Unexpected {} result: {}",
                method, e
            )))
        })
    }

    /// Check a response for an error payload, ignoring its result
    pub fn parse_void(&self, response: JsonRpcResponse) -> Result<()> {
        Self::into_result(response).map(|_| ())
    }

    fn into_result(response: JsonRpcResponse) -> Result<Value> {
        if let Some(error) = response.error {
            return Err(Error::Acp(AcpError::Rpc {
                code: error.code,
                message: error.message,
                data: error.data,
            }));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Parse incoming message (could be response, notification, or request)
    pub fn parse_message(&self, value: Value) -> Result<AcpMessage> {
        let has_id = value.get("id").map_or(false, |id| !id.is_null());
        let has_method = value.get("method").is_some();

        // Response: has "id" and "result" or "error"
        if has_id && !has_method && (value.get("result").is_some() || value.get("error").is_some()) {
            let response: JsonRpcResponse = serde_json::from_value(value)?;
            return Ok(AcpMessage::Response(response));
        }

        // Request from agent: has "method" and "id"
        if has_method && has_id {
            let request: JsonRpcRequest = serde_json::from_value(value)?;
            return Ok(AcpMessage::AgentRequest(request));
        }

        // Notification: has "method" but no "id"
        if has_method {
            let request: JsonRpcRequest = serde_json::from_value(value)?;
            return self.parse_notification(request);
        }

        Err(Error::Acp(AcpError::InvalidMessage(format!(
            "Unknown message type: {}",
            value
        ))))
    }

    fn parse_notification(&self, request: JsonRpcRequest) -> Result<AcpMessage> {
        match request.method.as_str() {
            methods::SESSION_UPDATE => {
                let params = request.params.ok_or_else(|| {
                    Error::Acp(AcpError::InvalidMessage(
                        "Missing params in session/update".to_string(),
                    ))
                })?;
                let notification: SessionUpdateNotification = serde_json::from_value(params)?;
                Ok(AcpMessage::SessionUpdate(notification))
            }
            method if method.starts_with("$/") => {
                trace!("Ignoring protocol notification: {}", method);
                Ok(AcpMessage::Unknown(request))
            }
            method => {
                warn!("Unknown notification method: {}", method);
                Ok(AcpMessage::Unknown(request))
            }
        }
    }

    /// Successful response to an agent request
    pub fn create_response<T: Serialize>(&self, request_id: Value, result: &T) -> JsonRpcResponse {
        match serde_json::to_value(result) {
            Ok(result) => JsonRpcResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id: Some(request_id),
                result: Some(result),
                error: None,
            },
            Err(e) => self.create_error_response(
                request_id,
                error_codes::INTERNAL_ERROR,
                &format!("Failed to encode result: {}", e),
            ),
        }
    }

    /// Create error response
    pub fn create_error_response(&self, request_id: Value, code: i64, message: &str) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(request_id),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }
}

impl Default for ProtocolHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Numeric id of a response. Agents echo our ids, but some echo them as strings.
pub fn response_id(response: &JsonRpcResponse) -> Option<u64> {
    match response.id.as_ref()? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Parsed ACP message types
#[derive(Debug, Clone)]
pub enum AcpMessage {
    /// Response to our request
    Response(JsonRpcResponse),
    /// Session update notification
    SessionUpdate(SessionUpdateNotification),
    /// Request from agent (permission, fs/*, terminal/*)
    AgentRequest(JsonRpcRequest),
    /// Notification we don't handle
    Unknown(JsonRpcRequest),
}
