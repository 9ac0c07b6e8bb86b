//! JSON-RPC 2.0 envelopes.
//!
//! Every frame is a single JSON object.  Outbound traffic is built from the
//! typed structs below; inbound traffic is classified with
//! [`Message::from_value`], which performs the shape checks the router
//! relies on.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC error codes.
pub mod error_codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request ids
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A request identifier.  The peer may use numbers or strings; both are
/// echoed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{n}"),
            RequestId::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        RequestId::Number(n)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        RequestId::String(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::String(s.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Outbound envelopes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A request (with `id`) or a notification (without).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: Some(id),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// A response carrying either `result` or `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RequestId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(error_codes::METHOD_NOT_FOUND, "Method not found")
            .with_data(Value::String(method.to_string()))
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(error_codes::INTERNAL_ERROR, "Internal error")
            .with_data(Value::String(detail.into()))
    }
}

impl fmt::Display for JsonRpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for JsonRpcError {}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inbound classification
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Why an inbound JSON value is not a usable JSON-RPC message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvalidMessage {
    #[error("message is not a JSON object")]
    NotAnObject,
    #[error("missing or unsupported jsonrpc version (expected \"2.0\")")]
    WrongVersion,
    #[error("message has none of method, result or error")]
    MissingMember,
    #[error("method must be a string")]
    BadMethod,
    #[error("id must be a string or an integer")]
    BadId,
    #[error("malformed error object: {0}")]
    BadError(String),
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: RequestId,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: Option<RequestId>,
        outcome: Result<Value, JsonRpcError>,
    },
}

impl Message {
    /// Classify a parsed frame.  A `method` member makes it a request (or a
    /// notification when `id` is absent or null); otherwise `result` or
    /// `error` makes it a response.  `error` wins over `result`.
    pub fn from_value(value: Value) -> Result<Self, InvalidMessage> {
        let Value::Object(mut obj) = value else {
            return Err(InvalidMessage::NotAnObject);
        };

        match obj.get("jsonrpc") {
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            _ => return Err(InvalidMessage::WrongVersion),
        }

        let id = take_id(&mut obj)?;

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(InvalidMessage::BadMethod);
            };
            let params = obj.remove("params");
            return Ok(match id {
                Some(id) => Message::Request { id, method, params },
                None => Message::Notification { method, params },
            });
        }

        if let Some(error) = obj.remove("error") {
            let error: JsonRpcError = serde_json::from_value(error)
                .map_err(|e| InvalidMessage::BadError(e.to_string()))?;
            return Ok(Message::Response {
                id,
                outcome: Err(error),
            });
        }

        if let Some(result) = obj.remove("result") {
            return Ok(Message::Response {
                id,
                outcome: Ok(result),
            });
        }

        Err(InvalidMessage::MissingMember)
    }
}

fn take_id(obj: &mut Map<String, Value>) -> Result<Option<RequestId>, InvalidMessage> {
    match obj.remove("id") {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(RequestId::String(s))),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(|n| Some(RequestId::Number(n)))
            .ok_or(InvalidMessage::BadId),
        Some(_) => Err(InvalidMessage::BadId),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_request() {
        let req = JsonRpcRequest::request(
            RequestId::Number(1),
            "initialize",
            Some(json!({ "protocolVersion": "2024-11-05" })),
        );
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
    }

    #[test]
    fn notification_omits_id_and_params() {
        let notif = JsonRpcRequest::notification("notifications/initialized", None);
        let json = serde_json::to_string(&notif).unwrap();
        assert!(!json.contains("\"id\""));
        assert!(!json.contains("params"));
        assert!(notif.is_notification());
    }

    #[test]
    fn string_ids_round_trip_verbatim() {
        let resp = JsonRpcResponse::success(RequestId::from("abc-1"), json!({}));
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["id"], json!("abc-1"));
    }

    #[test]
    fn classify_request_and_notification() {
        let req = Message::from_value(json!({"jsonrpc":"2.0","id":7,"method":"ping"})).unwrap();
        assert_eq!(
            req,
            Message::Request {
                id: RequestId::Number(7),
                method: "ping".into(),
                params: None
            }
        );

        let notif =
            Message::from_value(json!({"jsonrpc":"2.0","method":"x","params":[1]})).unwrap();
        assert!(matches!(notif, Message::Notification { ref method, .. } if method == "x"));
    }

    #[test]
    fn null_id_is_a_notification() {
        let msg = Message::from_value(json!({"jsonrpc":"2.0","id":null,"method":"x"})).unwrap();
        assert!(matches!(msg, Message::Notification { .. }));
    }

    #[test]
    fn classify_null_result_as_response() {
        let msg = Message::from_value(json!({"jsonrpc":"2.0","id":"a","result":null})).unwrap();
        assert_eq!(
            msg,
            Message::Response {
                id: Some(RequestId::from("a")),
                outcome: Ok(Value::Null)
            }
        );
    }

    #[test]
    fn classify_error_response() {
        let msg = Message::from_value(json!({
            "jsonrpc":"2.0","id":3,
            "error":{"code":-32601,"message":"Method not found"}
        }))
        .unwrap();
        match msg {
            Message::Response { outcome: Err(e), .. } => assert_eq!(e.code, -32601),
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn rejects_wrong_version_and_shapeless() {
        assert_eq!(
            Message::from_value(json!({"jsonrpc":"1.0","method":"x"})),
            Err(InvalidMessage::WrongVersion)
        );
        assert_eq!(
            Message::from_value(json!({"method":"x"})),
            Err(InvalidMessage::WrongVersion)
        );
        assert_eq!(
            Message::from_value(json!({"jsonrpc":"2.0","id":1})),
            Err(InvalidMessage::MissingMember)
        );
        assert_eq!(Message::from_value(json!([1, 2])), Err(InvalidMessage::NotAnObject));
    }

    #[test]
    fn rejects_bad_id_and_method() {
        assert_eq!(
            Message::from_value(json!({"jsonrpc":"2.0","id":{},"method":"x"})),
            Err(InvalidMessage::BadId)
        );
        assert_eq!(
            Message::from_value(json!({"jsonrpc":"2.0","method":5})),
            Err(InvalidMessage::BadMethod)
        );
    }

    #[test]
    fn jsonrpc_error_display() {
        let err = JsonRpcError::new(error_codes::METHOD_NOT_FOUND, "Method not found");
        assert_eq!(format!("{err}"), "JSON-RPC error -32601: Method not found");
    }

    #[test]
    fn internal_error_carries_detail_as_data() {
        let err = JsonRpcError::internal("boom");
        assert_eq!(err.code, error_codes::INTERNAL_ERROR);
        assert_eq!(err.data, Some(json!("boom")));
    }
}
