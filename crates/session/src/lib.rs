//! `tether-session`: persistent MCP session over JSON-RPC 2.0 on WebSocket.
//!
//! A session keeps one long-lived connection to a remote MCP peer, exposes
//! a local registry of tools the peer can call, and lets the local side
//! issue its own requests and notifications.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │  McpSession (state machine, heartbeat)                    │
//! │                                                           │
//! │   ┌──────────────┐   frames   ┌────────────────────────┐  │
//! │   │  Transport   │──────────►│  MessageRouter          │  │
//! │   │  (WebSocket) │◄──────────│  pending map, handlers  │  │
//! │   └──────────────┘            └───────────┬────────────┘  │
//! │          ▲                      tools/call │               │
//! │          │ reconnect                       ▼               │
//! │   ┌──────┴───────────────┐    ┌────────────────────────┐  │
//! │   │ ReconnectController  │    │  ToolRegistry           │  │
//! │   │ (back-off, ceiling)  │    │  (FIFO queue, ceiling)  │  │
//! │   └──────────────────────┘    └────────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! # Connection flow
//!
//! 1. Connect WS (with `token=<credential>` query param)
//! 2. Send `initialize`, wait for the peer's result
//! 3. Main loop:
//!    - Responses complete the matching pending request
//!    - `ping`, `initialize`, `tools/list`, `tools/call` are answered by
//!      built-in handlers; unknown methods get `-32601`
//!    - Heartbeat `ping` every interval; silence past the liveness timeout
//!      drops the connection
//! 4. On unexpected closure: reconnect with jittered exponential back-off
//!
//! # Example
//!
//! ```rust,no_run
//! use tether_session::{sync_tool, SessionBuilder};
//!
//! # async fn run() -> Result<(), tether_session::SessionError> {
//! let session = SessionBuilder::new()
//!     .endpoint("ws://localhost:8080/mcp")
//!     .token("secret")
//!     .tool(
//!         "echo",
//!         "Echo a message",
//!         serde_json::json!({
//!             "type": "object",
//!             "properties": { "msg": { "type": "string" } },
//!             "required": ["msg"]
//!         }),
//!         sync_tool(|args| Ok(args["msg"].clone())),
//!     )
//!     .build()?;
//!
//! session.connect().await?;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod builder;
pub mod config;
pub mod error;
pub mod events;
pub mod reconnect;
pub mod router;
pub mod session;
pub mod tools;
pub mod transport;

// ── Re-exports for ergonomic imports ─────────────────────────────────

pub use backoff::ReconnectPolicy;
pub use builder::SessionBuilder;
pub use config::{Credential, SessionConfig};
pub use error::{SessionError, ToolError};
pub use events::{ConnectionState, EventBus, SessionEvent};
pub use reconnect::{ReconnectController, ReconnectTarget, ScheduleOutcome};
pub use router::{MessageRouter, MethodHandler, RequestContext, RouterStats};
pub use session::{McpSession, SessionStats, MANUAL_DISCONNECT};
pub use tools::{
    sync_tool, tool_fn, ToolHandler, ToolInfo, ToolOutput, ToolRegistry, ToolStats, ToolTicket,
};
pub use transport::{Connection, Connector, Transport, TransportEvent, WsConnector};

// Re-export protocol types so callers rarely need tether-protocol directly.
pub use tether_protocol::{JsonRpcError, RequestId, ToolCallResult, ToolDescriptor};
