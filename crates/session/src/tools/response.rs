//! Normalizes whatever a tool callback returns into the canonical
//! `{content, isError}` envelope.

use serde_json::Value;
use tether_protocol::ToolCallResult;

const NO_RESULT: &str = "No result";

/// - `null` becomes the text "No result"
/// - a string becomes a single text item
/// - an object with a `content` array that parses as an envelope passes through
/// - anything else is pretty-printed JSON text
pub fn normalize(value: Value) -> ToolCallResult {
    match value {
        Value::Null => ToolCallResult::text(NO_RESULT),
        Value::String(s) => ToolCallResult::text(s),
        Value::Object(ref obj) if obj.get("content").is_some_and(Value::is_array) => {
            match serde_json::from_value::<ToolCallResult>(value.clone()) {
                Ok(envelope) => envelope,
                Err(_) => pretty(&value),
            }
        }
        other => pretty(&other),
    }
}

fn pretty(value: &Value) -> ToolCallResult {
    let text = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
    ToolCallResult::text(text)
}
