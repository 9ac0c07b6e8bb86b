//! Builder pattern for constructing an [`McpSession`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::backoff::ReconnectPolicy;
use crate::config::{Credential, SessionConfig};
use crate::error::SessionError;
use crate::events::EventBus;
use crate::session::McpSession;
use crate::tools::ToolHandler;
use crate::transport::{Connector, WsConnector};

struct PendingTool {
    name: String,
    description: String,
    input_schema: Value,
    handler: Arc<dyn ToolHandler>,
}

/// Fluent builder for [`McpSession`].
///
/// # Example
///
/// ```rust,no_run
/// # use tether_session::{sync_tool, SessionBuilder};
/// let session = SessionBuilder::new()
///     .endpoint("ws://localhost:8080/mcp")
///     .token("secret")
///     .server_name("tether-node")
///     .heartbeat_interval(std::time::Duration::from_secs(30))
///     .max_concurrent_tools(4)
///     .tool(
///         "echo",
///         "Echo a message",
///         serde_json::json!({"type": "object", "required": ["msg"]}),
///         sync_tool(|args| Ok(args["msg"].clone())),
///     )
///     .build()
///     .unwrap();
/// ```
pub struct SessionBuilder {
    config: SessionConfig,
    token: Option<String>,
    connector: Arc<dyn Connector>,
    event_capacity: usize,
    tools: Vec<PendingTool>,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
            token: None,
            connector: Arc::new(WsConnector),
            event_capacity: 256,
            tools: Vec::new(),
        }
    }

    /// Start from an existing configuration (e.g. loaded from TOML).
    pub fn from_config(config: SessionConfig) -> Self {
        Self {
            config,
            ..Self::new()
        }
    }

    // ── Required ─────────────────────────────────────────────────────

    /// Set the WebSocket endpoint (e.g. `wss://mcp.example.com/ws`).
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.config.endpoint = url.into();
        self
    }

    /// Set the bearer token sent as the `token` query parameter.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn server_name(mut self, name: impl Into<String>) -> Self {
        self.config.server_name = name.into();
        self
    }

    pub fn server_version(mut self, version: impl Into<String>) -> Self {
        self.config.server_version = version.into();
        self
    }

    // ── Behavior ─────────────────────────────────────────────────────

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.config.reconnect_base_delay_ms = policy.base_delay.as_millis() as u64;
        self.config.reconnect_max_delay_ms = policy.max_delay.as_millis() as u64;
        self.config.max_reconnect_attempts = policy.max_attempts;
        self
    }

    /// Heartbeat interval.  `Duration::ZERO` disables the heartbeat.
    pub fn heartbeat_interval(mut self, d: Duration) -> Self {
        self.config.heartbeat_interval_ms = d.as_millis() as u64;
        self
    }

    pub fn liveness_timeout(mut self, d: Duration) -> Self {
        self.config.liveness_timeout_ms = d.as_millis() as u64;
        self
    }

    pub fn request_timeout(mut self, d: Duration) -> Self {
        self.config.request_timeout_ms = d.as_millis() as u64;
        self
    }

    pub fn max_concurrent_tools(mut self, n: usize) -> Self {
        self.config.max_concurrent_tools = n;
        self
    }

    pub fn max_frame_bytes(mut self, n: usize) -> Self {
        self.config.max_frame_bytes = n;
        self
    }

    /// Replace the WebSocket connector, mostly for tests.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn event_capacity(mut self, n: usize) -> Self {
        self.event_capacity = n.max(1);
        self
    }

    // ── Tools ────────────────────────────────────────────────────────

    /// Register a tool once the session is built.
    pub fn tool<T: ToolHandler>(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: T,
    ) -> Self {
        self.tools.push(PendingTool {
            name: name.into(),
            description: description.into(),
            input_schema,
            handler: Arc::new(handler),
        });
        self
    }

    // ── Build ────────────────────────────────────────────────────────

    /// Validate and build.  Fails on a missing or empty token, an invalid
    /// configuration or an invalid tool definition.
    pub fn build(self) -> Result<McpSession, SessionError> {
        let credential = Credential::new(self.token.unwrap_or_default())?;
        let session = McpSession::with_connector(
            self.config,
            credential,
            self.connector,
            EventBus::new(self.event_capacity),
        )?;
        for tool in self.tools {
            session
                .tools()
                .register_boxed(tool.name, tool.description, tool.input_schema, tool.handler)?;
        }
        Ok(session)
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
