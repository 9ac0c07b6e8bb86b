//! Wire protocol for Tether sessions: JSON-RPC 2.0 envelopes carried over
//! WebSocket text frames, plus the MCP payloads exchanged on top of them.
//!
//! This crate is pure data: no I/O, no runtime.  The session runtime lives in
//! `tether-session`.

pub mod jsonrpc;
pub mod mcp;

pub use jsonrpc::{
    error_codes, InvalidMessage, JsonRpcError, JsonRpcRequest, JsonRpcResponse, Message,
    RequestId, JSONRPC_VERSION,
};
pub use mcp::{
    methods, Implementation, InitializeParams, InitializeResult, ToolCallParams, ToolCallResult,
    ToolContent, ToolDescriptor, ToolsListResult, PROTOCOL_VERSION,
};
