//! Shared types for the MCP client.
//!
//! JSON-RPC message types and MCP protocol structures.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Largest id a JavaScript peer can represent exactly (2^53 - 1).
pub const MAX_SAFE_ID: u64 = 9_007_199_254_740_991;

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
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
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
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
    pub data: Option<Value>,
}

/// Outgoing response to a server-initiated request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcReply {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcReply {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i32, message: &str) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.to_string(),
                data: None,
            }),
        }
    }
}

/// Any message a server may put on the wire, before classification.
#[derive(Debug, Clone, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

/// A classified incoming JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Response to one of our requests. `id` is `None` when the server
    /// answered with `"id": null` (it could not parse what we sent).
    Response {
        id: Option<u64>,
        outcome: Result<Value, JsonRpcError>,
    },
    /// Server-initiated request that expects a reply.
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    /// Server-initiated notification.
    Notification { method: String, params: Option<Value> },
}

impl Incoming {
    /// Parse and classify one JSON payload.
    pub fn parse(payload: &str) -> Result<Self, serde_json::Error> {
        let raw: RawMessage = serde_json::from_str(payload)?;
        Ok(Self::classify(raw))
    }

    /// Classify an already-parsed JSON value.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let raw: RawMessage = serde_json::from_value(value)?;
        Ok(Self::classify(raw))
    }

    fn classify(raw: RawMessage) -> Self {
        match (raw.method, raw.id) {
            (Some(method), Some(id)) => Incoming::Request {
                id,
                method,
                params: raw.params,
            },
            (Some(method), None) => Incoming::Notification {
                method,
                params: raw.params,
            },
            (None, id) => {
                let outcome = match raw.error {
                    Some(err) => Err(err),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Incoming::Response {
                    id: id.as_ref().and_then(id_as_u64),
                    outcome,
                }
            }
        }
    }
}

/// Accept numeric ids and numeric strings (some servers echo ids as strings).
fn id_as_u64(id: &Value) -> Option<u64> {
    match id {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// MCP tool definition as returned by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, alias = "input_schema")]
    pub input_schema: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Value>,
}

/// A declared prompt argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptArgument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

/// MCP prompt definition as returned by `prompts/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpPromptDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub arguments: Vec<PromptArgument>,
}

/// MCP resource as returned by `resources/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResource {
    pub uri: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// MCP resource template as returned by `resources/templates/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpResourceTemplate {
    pub uri_template: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// MCP initialize response payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    #[serde(default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: Value,
    #[serde(default, alias = "server_info")]
    pub server_info: Option<ServerInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

impl InitializeResult {
    /// Whether the server advertised an optional capability (`prompts`,
    /// `resources`). Servers that send no capability object at all are given
    /// the benefit of the doubt.
    pub fn advertises(&self, capability: &str) -> bool {
        match self.capabilities.as_object() {
            Some(caps) if !caps.is_empty() => caps.contains_key(capability),
            _ => true,
        }
    }
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// Normalized result of a `tools/call`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolOutput {
    /// Text content blocks joined with newlines.
    pub output: String,
    /// `structuredContent`, when the server sent one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    /// The full, untouched result object.
    pub raw: Value,
}

impl ToolOutput {
    /// Concatenate a `tools/call` result's content blocks into one string.
    ///
    /// Text blocks contribute their text, embedded text resources their
    /// resource text; anything else is rendered as compact JSON so nothing
    /// is silently lost.
    pub fn content_text(result: &Value) -> String {
        let Some(blocks) = result.get("content").and_then(Value::as_array) else {
            return match result.get("content") {
                Some(Value::String(s)) => s.clone(),
                _ => String::new(),
            };
        };

        blocks
            .iter()
            .map(|block| {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => block
                        .get("text")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    Some("resource") => block
                        .pointer("/resource/text")
                        .and_then(Value::as_str)
                        .map(String::from)
                        .unwrap_or_else(|| block.to_string()),
                    _ => block.to_string(),
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn from_result(result: Value) -> Self {
        Self {
            output: Self::content_text(&result),
            structured: result.get("structuredContent").cloned(),
            raw: result,
        }
    }
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC / MCP error codes.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
