//! JSON-RPC 2.0 message model.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// Generic error surfaced by the transport.
pub const SERVER_ERROR: i32 = -32000;

/// JSON-RPC 2.0 request or notification envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Option<Value>, id: Option<u32>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
            id: id.map(|id| Value::Number(id.into())),
        }
    }
}

/// JSON-RPC 2.0 response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorObject>,
    /// Echo of the request id, `null` when none could be recovered.
    pub id: Value,
}

impl RpcResponse {
    /// Create a success response.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    /// Create an error response.
    pub fn error(id: Option<Value>, code: i32, message: String, data: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(RpcErrorObject {
                code,
                message,
                data,
            }),
            id: id.unwrap_or(Value::Null),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A validated incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcMessage {
    /// Request, or notification when `id` is absent.
    Request {
        method: String,
        id: Option<Value>,
        params: Option<Value>,
    },
    Response {
        id: Option<Value>,
        result: Value,
    },
    ErrorResponse {
        id: Option<Value>,
        code: i32,
        message: String,
        data: Option<Value>,
    },
}

/// Envelope rejected during validation, to be answered with `code`.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidEnvelope {
    /// Id recovered from the envelope, if any.
    pub id: Option<Value>,
    pub code: i32,
    pub message: String,
}

impl RpcMessage {
    /// Validate a decoded value as a JSON-RPC 2.0 message.
    pub fn from_value(value: Value) -> Result<Self, InvalidEnvelope> {
        let Value::Object(mut obj) = value else {
            return Err(InvalidEnvelope {
                id: None,
                code: INVALID_REQUEST,
                message: "Invalid Request - not a JSON object".to_string(),
            });
        };
        let id = obj.remove("id").filter(|id| !id.is_null());
        let invalid = |id: Option<Value>, message: &str| InvalidEnvelope {
            id,
            code: INVALID_REQUEST,
            message: message.to_string(),
        };

        match obj.get("jsonrpc") {
            None => return Err(invalid(id, "Invalid Request - missing 'jsonrpc'")),
            Some(Value::String(v)) if v == JSONRPC_VERSION => {}
            Some(_) => return Err(invalid(id, "Invalid Request - wrong version in 'jsonrpc'")),
        }

        if let Some(method) = obj.remove("method") {
            let Value::String(method) = method else {
                return Err(invalid(id, "Invalid Request - 'method' is not a string"));
            };
            if method.is_empty() {
                return Err(invalid(id, "Invalid Request - empty 'method'"));
            }
            return Ok(RpcMessage::Request {
                method,
                id,
                params: obj.remove("params"),
            });
        }

        if let Some(result) = obj.remove("result") {
            return Ok(RpcMessage::Response { id, result });
        }

        match obj.remove("error") {
            Some(error) => {
                let code = error
                    .get("code")
                    .and_then(Value::as_i64)
                    .and_then(|c| i32::try_from(c).ok());
                let message = error.get("message").and_then(Value::as_str);
                let (code, message) = match (code, message) {
                    (Some(code), Some(message)) => (code, message.to_string()),
                    (Some(code), None) => (code, format_error_code(code)),
                    _ => (INTERNAL_ERROR, "malformed Error response".to_string()),
                };
                Ok(RpcMessage::ErrorResponse {
                    id,
                    code,
                    message,
                    data: error.get("data").cloned(),
                })
            }
            None => Ok(RpcMessage::ErrorResponse {
                id,
                code: INTERNAL_ERROR,
                message: "Internal JSON-RPC error - response with neither 'result' nor 'error'"
                    .to_string(),
                data: None,
            }),
        }
    }

    /// Encode as a wire envelope.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        match self {
            RpcMessage::Request { method, id, params } => {
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(params) = params {
                    obj.insert("params".into(), params.clone());
                }
                if let Some(id) = id {
                    obj.insert("id".into(), id.clone());
                }
            }
            RpcMessage::Response { id, result } => {
                obj.insert("result".into(), result.clone());
                obj.insert("id".into(), id.clone().unwrap_or(Value::Null));
            }
            RpcMessage::ErrorResponse {
                id,
                code,
                message,
                data,
            } => {
                let mut error = Map::new();
                error.insert("code".into(), Value::from(*code));
                error.insert("message".into(), Value::String(message.clone()));
                if let Some(data) = data {
                    error.insert("data".into(), data.clone());
                }
                obj.insert("error".into(), Value::Object(error));
                obj.insert("id".into(), id.clone().unwrap_or(Value::Null));
            }
        }
        Value::Object(obj)
    }
}

/// Message used when an error carries only a code.
pub fn format_error_code(code: i32) -> String {
    format!("Error code {} (0x{:X})", code, code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = RpcRequest::new("ping", None, Some(1));
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, json!({"jsonrpc": "2.0", "method": "ping", "id": 1}));

        let note = RpcRequest::new("status", Some(json!([1, 2])), None);
        let json = serde_json::to_string(&note).unwrap();
        assert!(!json.contains("\"id\""));
    }

    #[test]
    fn test_error_response_serialization() {
        let resp = RpcResponse::error(None, METHOD_NOT_FOUND, "Method not found".into(), None);
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            json,
            json!({"jsonrpc": "2.0", "error": {"code": -32601, "message": "Method not found"}, "id": null})
        );
    }

    #[test]
    fn test_version_is_checked_first() {
        let err = RpcMessage::from_value(json!({"method": "ping", "id": 4})).unwrap_err();
        assert_eq!(err.code, INVALID_REQUEST);
        assert_eq!(err.id, Some(json!(4)));

        let err = RpcMessage::from_value(json!({"jsonrpc": "1.0", "result": 1, "id": 4})).unwrap_err();
        assert_eq!(err.code, INVALID_REQUEST);
    }

    #[test]
    fn test_empty_method_is_invalid() {
        let err = RpcMessage::from_value(json!({"jsonrpc": "2.0", "method": ""})).unwrap_err();
        assert_eq!(err.code, INVALID_REQUEST);
        assert_eq!(err.id, None);
    }

    #[test]
    fn test_notification_has_no_id() {
        let msg = RpcMessage::from_value(json!({"jsonrpc": "2.0", "method": "tick", "params": {"n": 1}}))
            .unwrap();
        assert_eq!(
            msg,
            RpcMessage::Request {
                method: "tick".into(),
                id: None,
                params: Some(json!({"n": 1}))
            }
        );
    }

    #[test]
    fn test_malformed_error_response_defaults() {
        let msg = RpcMessage::from_value(json!({"jsonrpc": "2.0", "error": {"data": 5}, "id": 2})).unwrap();
        assert_eq!(
            msg,
            RpcMessage::ErrorResponse {
                id: Some(json!(2)),
                code: INTERNAL_ERROR,
                message: "malformed Error response".into(),
                data: Some(json!(5)),
            }
        );
    }

    #[test]
    fn test_response_without_result_or_error() {
        let msg = RpcMessage::from_value(json!({"jsonrpc": "2.0", "id": 9})).unwrap();
        assert!(matches!(msg, RpcMessage::ErrorResponse { code: INTERNAL_ERROR, .. }));
    }

    #[test]
    fn test_to_value_echoes_id() {
        let msg = RpcMessage::Response {
            id: Some(json!("abc")),
            result: json!("pong"),
        };
        assert_eq!(msg.to_value(), json!({"jsonrpc": "2.0", "result": "pong", "id": "abc"}));
        assert_eq!(RpcMessage::from_value(msg.to_value()).unwrap(), msg);
    }

    #[test]
    fn test_format_error_code() {
        assert_eq!(format_error_code(-32000), "Error code -32000 (0xFFFF8300)");
        assert_eq!(format_error_code(42), "Error code 42 (0x2A)");
    }
}
