//! Demo tools served by the node.

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tether_session::{sync_tool, SessionBuilder, ToolError};

pub fn register_all(builder: SessionBuilder) -> SessionBuilder {
    builder
        .tool(
            "echo",
            "Echo the `msg` argument back",
            json!({
                "type": "object",
                "properties": { "msg": { "type": "string" } },
                "required": ["msg"]
            }),
            sync_tool(echo),
        )
        .tool(
            "add",
            "Add two numbers",
            json!({
                "type": "object",
                "properties": {
                    "a": { "type": "number" },
                    "b": { "type": "number" }
                },
                "required": ["a", "b"]
            }),
            sync_tool(add),
        )
        .tool(
            "time",
            "Current UTC time in RFC 3339",
            json!({ "type": "object", "properties": {} }),
            sync_tool(|_| Ok(Value::String(now()))),
        )
}

fn echo(args: Value) -> Result<Value, ToolError> {
    Ok(args["msg"].clone())
}

fn add(args: Value) -> Result<Value, ToolError> {
    let a = args["a"].as_f64().ok_or_else(|| ToolError::InvalidArgs("a must be a number".into()))?;
    let b = args["b"].as_f64().ok_or_else(|| ToolError::InvalidArgs("b must be a number".into()))?;
    Ok(json!(a + b))
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
