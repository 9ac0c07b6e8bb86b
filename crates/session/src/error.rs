//! Error types for the session runtime and for tool callbacks.

use std::time::Duration;

use tether_protocol::{JsonRpcError, RequestId};

/// Top-level session error.
///
/// `Clone` so that a single teardown can fail every pending request with
/// the same cause.
#[derive(thiserror::Error, Debug, Clone)]
pub enum SessionError {
    #[error("connection timed out after {0:?}")]
    ConnectionTimeout(Duration),
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("not connected")]
    NotConnected,
    #[error("already connecting or connected")]
    AlreadyConnected,
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("invalid JSON-RPC message: {0}")]
    InvalidJsonRpc(String),
    #[error("request {method} timed out after {timeout:?}")]
    RequestTimeout { method: String, timeout: Duration },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("request id {0} is already pending")]
    DuplicateRequestId(RequestId),
    #[error("tool not found: {0}")]
    ToolNotFound(String),
    #[error("invalid tool arguments: {0}")]
    InvalidToolArguments(String),
    #[error("invalid tool definition: {0}")]
    InvalidToolDefinition(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("{0}")]
    Rpc(#[from] JsonRpcError),
    #[error("invalid credential: token must not be empty")]
    InvalidCredential,
    #[error("config: {0}")]
    Config(String),
}

impl SessionError {
    /// Short machine-readable name, used as the `kind` of error events.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::ConnectionTimeout(_) => "connection_timeout",
            SessionError::ConnectionError(_) => "connection_error",
            SessionError::NotConnected => "not_connected",
            SessionError::AlreadyConnected => "already_connected",
            SessionError::SendFailed(_) => "send_failed",
            SessionError::InvalidJson(_) => "invalid_json",
            SessionError::InvalidJsonRpc(_) => "invalid_jsonrpc",
            SessionError::RequestTimeout { .. } => "request_timeout",
            SessionError::ConnectionClosed => "connection_closed",
            SessionError::DuplicateRequestId(_) => "duplicate_request_id",
            SessionError::ToolNotFound(_) => "tool_not_found",
            SessionError::InvalidToolArguments(_) => "invalid_tool_arguments",
            SessionError::InvalidToolDefinition(_) => "invalid_tool_definition",
            SessionError::HandshakeFailed(_) => "handshake_failed",
            SessionError::Rpc(_) => "rpc_error",
            SessionError::InvalidCredential => "invalid_credential",
            SessionError::Config(_) => "config",
        }
    }
}

/// Errors a tool callback can return.
///
/// These never reach the peer as JSON-RPC errors: the dispatcher turns them
/// into an error-flagged tool response.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ToolError {
    #[error("invalid_args: {0}")]
    InvalidArgs(String),
    #[error("{0}")]
    Failed(String),
}

impl From<anyhow::Error> for ToolError {
    fn from(err: anyhow::Error) -> Self {
        ToolError::Failed(format!("{err:#}"))
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        ToolError::InvalidArgs(err.to_string())
    }
}
