//! Tool callbacks.
//!
//! Every callback is asynchronous.  Synchronous closures are adapted with
//! [`sync_tool`], which simply wraps their return value.

use std::future::Future;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ToolError;

/// What a tool callback returns.  See [`normalize`](super::response::normalize)
/// for how values map onto the response envelope.
pub type ToolOutput = Result<Value, ToolError>;

/// Implement this trait to expose a tool to the peer.
///
/// ```rust,no_run
/// use tether_session::{ToolHandler, ToolOutput};
///
/// struct Echo;
///
/// #[async_trait::async_trait]
/// impl ToolHandler for Echo {
///     async fn call(&self, args: serde_json::Value) -> ToolOutput {
///         Ok(args["msg"].clone())
///     }
/// }
/// ```
#[async_trait]
pub trait ToolHandler: Send + Sync + 'static {
    async fn call(&self, args: Value) -> ToolOutput;
}

/// Adapter for async closures.  Build with [`tool_fn`].
pub struct FnTool<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolOutput> + Send + 'static,
{
    async fn call(&self, args: Value) -> ToolOutput {
        (self.0)(args).await
    }
}

pub fn tool_fn<F, Fut>(f: F) -> FnTool<F>
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ToolOutput> + Send + 'static,
{
    FnTool(f)
}

/// Adapter for synchronous closures.  Build with [`sync_tool`].
pub struct SyncTool<F>(F);

#[async_trait]
impl<F> ToolHandler for SyncTool<F>
where
    F: Fn(Value) -> ToolOutput + Send + Sync + 'static,
{
    async fn call(&self, args: Value) -> ToolOutput {
        (self.0)(args)
    }
}

pub fn sync_tool<F>(f: F) -> SyncTool<F>
where
    F: Fn(Value) -> ToolOutput + Send + Sync + 'static,
{
    SyncTool(f)
}
