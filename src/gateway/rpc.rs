//! JSON-RPC 2.0 framing shared by the HTTP and stdio transports.

use crate::runtime::CoreRuntime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

pub const PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<Value>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// Parse one raw frame and dispatch it.
pub async fn handle_frame(runtime: &Arc<CoreRuntime>, identity: &str, raw: &[u8]) -> JsonRpcResponse {
    let request: JsonRpcRequest = match serde_json::from_slice(raw) {
        Ok(request) => request,
        Err(e) => return JsonRpcResponse::failure(None, PARSE_ERROR, format!("parse error: {e}")),
    };
    dispatch(runtime, identity, request).await
}

pub async fn dispatch(
    runtime: &Arc<CoreRuntime>,
    identity: &str,
    request: JsonRpcRequest,
) -> JsonRpcResponse {
    if let Some(version) = &request.jsonrpc {
        if version != "2.0" {
            return JsonRpcResponse::failure(
                request.id,
                INVALID_REQUEST,
                format!("unsupported jsonrpc version '{version}'"),
            );
        }
    }
    let id = request.id.clone();
    match request.method.as_str() {
        "initialize" => JsonRpcResponse::success(
            id,
            serde_json::json!({
                "protocol_version": PROTOCOL_VERSION,
                "capabilities": { "tools": {} },
                "server_info": {
                    "name": "toolweave",
                    "version": crate::VERSION,
                },
            }),
        ),
        "tools/list" => JsonRpcResponse::success(
            id,
            serde_json::json!({ "tools": super::meta::tool_definitions() }),
        ),
        "tools/call" => {
            let name = request.params.get("name").and_then(Value::as_str);
            let arguments = request
                .params
                .get("arguments")
                .cloned()
                .unwrap_or(Value::Object(serde_json::Map::new()));
            let Some(name) = name else {
                return JsonRpcResponse::failure(id, INVALID_PARAMS, "missing tool name");
            };
            match super::meta::call(runtime, identity, name, arguments).await {
                Ok(result) => JsonRpcResponse::success(id, result),
                Err(e) => JsonRpcResponse::failure(id, e.rpc_code(), e.to_string()),
            }
        }
        other => {
            JsonRpcResponse::failure(id, METHOD_NOT_FOUND, format!("unknown method '{other}'"))
        }
    }
}
