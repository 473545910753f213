//! Wire types for the provider protocol.
//!
//! JSON-RPC 2.0 message types and the handshake / enumeration payloads.

use serde::{Deserialize, Serialize};

use crate::value::Value;

// ─── Protocol Constants ─────────────────────────────────────────────────────

/// Protocol version offered in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Versions a provider may answer with and still be accepted.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

/// Client identity sent during `initialize`.
pub const CLIENT_NAME: &str = "capstack";

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const INITIALIZED: &str = "notifications/initialized";
    pub const TOOLS_LIST: &str = "tools/list";
    pub const TOOLS_CALL: &str = "tools/call";
}

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no id, no response).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// An incoming frame, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A response correlated to one of our requests.
    Response {
        id: u64,
        outcome: Result<serde_json::Value, JsonRpcError>,
    },
    /// A response whose id is not one we could have issued (string ids, etc.).
    UncorrelatedResponse { id: serde_json::Value },
    /// A server-initiated request; it expects an answer.
    Request { id: serde_json::Value, method: String },
    /// A server notification.
    Notification { method: String },
    /// Valid JSON that is not a JSON-RPC message.
    Unrecognized,
}

impl Incoming {
    /// Classify a decoded frame.
    pub fn classify(frame: serde_json::Value) -> Self {
        let serde_json::Value::Object(mut map) = frame else {
            return Incoming::Unrecognized;
        };

        let method = map
            .get("method")
            .and_then(|m| m.as_str())
            .map(str::to_string);
        let id = map.remove("id");

        match (id, method) {
            (Some(id), Some(method)) => Incoming::Request { id, method },
            (None, Some(method)) => Incoming::Notification { method },
            (Some(id), None) => {
                let Some(numeric) = id.as_u64() else {
                    return Incoming::UncorrelatedResponse { id };
                };
                let outcome = match map.remove("error") {
                    Some(err) if !err.is_null() => match serde_json::from_value(err) {
                        Ok(err) => Err(err),
                        Err(e) => Err(JsonRpcError {
                            code: error_codes::INTERNAL_ERROR,
                            message: format!("malformed error object: {e}"),
                            data: None,
                        }),
                    },
                    _ => Ok(map.remove("result").unwrap_or(serde_json::Value::Null)),
                };
                Incoming::Response { id: numeric, outcome }
            }
            (None, None) => Incoming::Unrecognized,
        }
    }
}

// ─── Handshake & Enumeration ────────────────────────────────────────────────

/// An invocable operation exposed by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: serde_json::Value,
    #[serde(default, alias = "outputSchema", skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// `initialize` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ListOperationsResult {
    #[serde(default)]
    pub tools: Vec<OperationDescriptor>,
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, Serialize)]
pub struct HandshakeSummary {
    pub protocol_version: String,
    pub server_info: ServerInfo,
    pub operations: Vec<OperationDescriptor>,
}

/// Build the `initialize` params.
pub fn initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": CLIENT_NAME,
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

// ─── Call Output ────────────────────────────────────────────────────────────

/// Convert a `tools/call` result into a structured value.
///
/// `structuredContent` wins when present. Otherwise the `content` list is
/// collapsed: text items are parsed as JSON when they hold a document and kept
/// as strings otherwise; a single item is unwrapped. A result flagged with
/// `isError` is returned as `Err` carrying the joined text.
pub fn extract_call_output(result: serde_json::Value) -> Result<Value, String> {
    let serde_json::Value::Object(mut map) = result else {
        return Ok(Value::from(result));
    };

    let is_error = map
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if is_error {
        let text = map
            .get("content")
            .and_then(|c| c.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "operation reported an error".to_string());
        return Err(text);
    }

    if let Some(structured) = map.remove("structuredContent") {
        return Ok(Value::from(structured));
    }

    let Some(serde_json::Value::Array(content)) = map.remove("content") else {
        return Ok(Value::from(serde_json::Value::Object(map)));
    };

    let mut items: Vec<Value> = content.into_iter().map(content_item).collect();
    if items.len() == 1 {
        return Ok(items.remove(0));
    }
    Ok(Value::Array(items))
}

fn content_item(item: serde_json::Value) -> Value {
    let is_text = item.get("type").and_then(|t| t.as_str()) == Some("text");
    if !is_text {
        return Value::from(item);
    }
    let text = item.get("text")
        .and_then(|t| t.as_str())
        .unwrap_or_default();
    let trimmed = text.trim_start();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<serde_json::Value>(text) {
            return Value::from(parsed);
        }
    }
    Value::String(text.to_string())
}

// ─── Standard Error Codes ───────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_rpc_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        // params omitted when None
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_classify_success_response() {
        let frame = json!({"jsonrpc": "2.0", "id": 7, "result": {"ok": true}});
        assert_eq!(
            Incoming::classify(frame),
            Incoming::Response { id: 7, outcome: Ok(json!({"ok": true})) }
        );
    }

    #[test]
    fn test_classify_error_response() {
        let frame = json!({
            "jsonrpc": "2.0",
            "id": 2,
            "result": null,
            "error": {"code": -32601, "message": "Method not found"}
        });
        match Incoming::classify(frame) {
            Incoming::Response { id, outcome: Err(err) } => {
                assert_eq!(id, 2);
                assert_eq!(err.code, error_codes::METHOD_NOT_FOUND);
            }
            other => panic!("expected error response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification_and_request() {
        assert_eq!(
            Incoming::classify(json!({"jsonrpc": "2.0", "method": "notifications/progress"})),
            Incoming::Notification { method: "notifications/progress".into() }
        );
        assert!(matches!(
            Incoming::classify(json!({"jsonrpc": "2.0", "id": "abc", "method": "roots/list"})),
            Incoming::Request { .. }
        ));
        assert!(matches!(
            Incoming::classify(json!({"jsonrpc": "2.0", "id": "abc", "result": {}})),
            Incoming::UncorrelatedResponse { .. }
        ));
        assert_eq!(Incoming::classify(json!([1, 2])), Incoming::Unrecognized);
    }

    #[test]
    fn test_operation_descriptor_aliases() {
        let json = r#"{"name": "search", "inputSchema": {"type": "object"}}"#;
        let op: OperationDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(op.name, "search");
        assert_eq!(op.input_schema["type"], "object");
        assert!(op.description.is_empty());
        assert!(op.output_schema.is_none());
    }

    #[test]
    fn test_extract_prefers_structured_content() {
        let result = json!({
            "content": [{"type": "text", "text": "ignored"}],
            "structuredContent": {"results": [1, 2]}
        });
        let out = extract_call_output(result).unwrap();
        assert_eq!(
            out.field("results")
                .and_then(Value::as_array)
                .map(|a| a.len()),
            Some(2)
        );
    }

    #[test]
    fn test_extract_parses_json_text() {
        let result = json!({"content": [{"type": "text", "text": "{\"url\": \"a\"}"}]});
        let out = extract_call_output(result).unwrap();
        assert_eq!(out.field("url").and_then(Value::as_str), Some("a"));
    }

    #[test]
    fn test_extract_plain_text_and_multiple_items() {
        let single = json!({"content": [{"type": "text", "text": "hello"}]});
        assert_eq!(extract_call_output(single).unwrap(), Value::from("hello"));

        let multi = json!({"content": [
            {"type": "text", "text": "one"},
            {"type": "image", "data": "..."}
        ]});
        let out = extract_call_output(multi).unwrap();
        assert_eq!(out.as_array().map(|a| a.len()), Some(2));
    }

    #[test]
    fn test_extract_is_error() {
        let result = json!({
            "isError": true,
            "content": [{"type": "text", "text": "quota exceeded"}]
        });
        assert_eq!(extract_call_output(result).unwrap_err(), "quota exceeded");
    }
}
