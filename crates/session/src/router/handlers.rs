//! Built-in MCP method handlers: `ping`, `initialize`, `tools/list` and
//! `tools/call`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tether_protocol::{
    methods, Implementation, InitializeResult, ToolCallParams, ToolCallResult, ToolsListResult,
};

use super::{MessageRouter, MethodHandler, RequestContext};
use crate::error::SessionError;
use crate::tools::ToolRegistry;

/// Install the four built-in handlers.  Any of them can be replaced later
/// through [`MessageRouter::register_handler`].
pub fn register_builtin_handlers(
    router: &MessageRouter,
    server_info: Implementation,
    tools: Arc<ToolRegistry>,
) {
    router.register_handler(methods::PING, Arc::new(PingHandler));
    router.register_handler(methods::INITIALIZE, Arc::new(InitializeHandler { server_info }));
    router.register_handler(
        methods::TOOLS_LIST,
        Arc::new(ToolsListHandler {
            tools: tools.clone(),
        }),
    );
    router.register_handler(methods::TOOLS_CALL, Arc::new(ToolsCallHandler { tools }));
}

fn to_value<T: serde::Serialize>(v: &T) -> Result<Value, SessionError> {
    serde_json::to_value(v).map_err(|e| SessionError::InvalidJson(e.to_string()))
}

/// Replies `{}`.
pub struct PingHandler;

#[async_trait]
impl MethodHandler for PingHandler {
    async fn handle(&self, ctx: RequestContext, _params: Option<Value>) -> Result<(), SessionError> {
        ctx.respond(Value::Object(Default::default())).await
    }
}

/// Answers the peer's handshake, then announces `notifications/initialized`.
pub struct InitializeHandler {
    pub server_info: Implementation,
}

#[async_trait]
impl MethodHandler for InitializeHandler {
    async fn handle(&self, ctx: RequestContext, params: Option<Value>) -> Result<(), SessionError> {
        if let Some(client) = params.as_ref().and_then(|p| p.get("clientInfo")) {
            tracing::info!(client = %client, "peer initialized session");
        }
        let result = InitializeResult::tool_server(self.server_info.clone());
        ctx.respond(to_value(&result)?).await?;

        let router = ctx.router().clone();
        tokio::spawn(async move {
            if let Err(e) = router
                .send_notification(methods::NOTIFICATION_INITIALIZED, None)
                .await
            {
                tracing::warn!(error = %e, "failed to send initialized notification");
            }
        });
        Ok(())
    }
}

pub struct ToolsListHandler {
    pub tools: Arc<ToolRegistry>,
}

#[async_trait]
impl MethodHandler for ToolsListHandler {
    async fn handle(&self, ctx: RequestContext, _params: Option<Value>) -> Result<(), SessionError> {
        let result = ToolsListResult {
            tools: self.tools.descriptors(),
        };
        ctx.respond(to_value(&result)?).await
    }
}

/// Runs a tool.  Always replies with a success response; tool failures,
/// unknown tools and malformed params are reported in-band via `isError`.
///
/// The tool's place in the concurrency window is reserved before `handle`
/// returns, so calls are admitted in arrival order; the call itself runs on
/// its own task.
pub struct ToolsCallHandler {
    pub tools: Arc<ToolRegistry>,
}

#[async_trait]
impl MethodHandler for ToolsCallHandler {
    async fn handle(&self, ctx: RequestContext, params: Option<Value>) -> Result<(), SessionError> {
        let call = match serde_json::from_value::<ToolCallParams>(params.unwrap_or(Value::Null)) {
            Ok(call) => call,
            Err(e) => {
                let err = SessionError::InvalidToolArguments(format!("bad tools/call params: {e}"));
                return ctx.respond(to_value(&ToolCallResult::error(err.to_string()))?).await;
            }
        };
        let ticket = match self.tools.reserve(&call.name) {
            Ok(ticket) => ticket,
            Err(e) => {
                tracing::warn!(tool = %call.name, error = %e, "tools/call rejected");
                return ctx.respond(to_value(&ToolCallResult::error(e.to_string()))?).await;
            }
        };

        tokio::spawn(async move {
            let result = match ticket.run(call.arguments).await {
                Ok(result) => result,
                Err(e) => ToolCallResult::error(e.to_string()),
            };
            let reply = match to_value(&result) {
                Ok(reply) => ctx.respond(reply).await,
                Err(e) => Err(e),
            };
            if let Err(e) = reply {
                tracing::warn!(tool = %call.name, error = %e, "failed to send tools/call result");
            }
        });
        Ok(())
    }
}
