//! Tool registry, dispatcher and the callback plumbing around it.

pub mod handler;
pub mod registry;
pub mod response;
pub mod schema;

pub use handler::{sync_tool, tool_fn, FnTool, SyncTool, ToolHandler, ToolOutput};
pub use registry::{ToolInfo, ToolRegistry, ToolStats, ToolTicket};
pub use response::normalize;
pub use schema::{validate, SchemaViolation};
