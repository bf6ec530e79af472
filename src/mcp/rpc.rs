//! JSON-RPC envelopes shared by every binding.

use rust_mcp_sdk::schema::{
    JsonrpcErrorResponse, JsonrpcResultResponse, RequestId, Result as McpResult, RpcError,
};
use serde_json::{json, Value};

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
/// Transport-level rejection (session not initialized, duplicate initialize).
pub const SERVER_ERROR: i32 = -32000;

pub fn is_json_rpc_error(value: &Value) -> bool {
    value.get("error").is_some()
}

pub fn json_rpc_error(id: Option<Value>, code: i32, message: &str) -> Value {
    let Some(request_id) = id.as_ref().and_then(value_to_request_id) else {
        return json!({
            "jsonrpc": "2.0",
            "id": Value::Null,
            "error": error_object(code, message),
        });
    };

    let response = JsonrpcErrorResponse::new(
        RpcError {
            code: i64::from(code),
            data: None,
            message: message.to_string(),
        },
        Some(request_id.clone()),
    );
    serde_json::to_value(response).unwrap_or_else(|_| {
        json!({
            "jsonrpc": "2.0",
            "id": request_id_to_value(request_id),
            "error": error_object(code, message),
        })
    })
}

fn error_object(code: i32, message: &str) -> Value {
    json!({ "code": code, "message": message })
}

pub fn json_rpc_result(id: Option<Value>, result: Value) -> Value {
    if let Some(request_id) = id.as_ref().and_then(value_to_request_id) {
        let extra = result.as_object().cloned();
        let response =
            JsonrpcResultResponse::new(request_id, McpResult { meta: None, extra });
        if let Ok(value) = serde_json::to_value(response) {
            return value;
        }
    }

    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result
    })
}

pub fn value_to_request_id(value: &Value) -> Option<RequestId> {
    if let Some(string_id) = value.as_str() {
        return Some(RequestId::String(string_id.to_string()));
    }

    value.as_i64().map(RequestId::Integer)
}

pub fn request_id_to_value(id: RequestId) -> Value {
    match id {
        RequestId::String(value) => Value::String(value),
        RequestId::Integer(value) => Value::Number(value.into()),
    }
}

/// True when the message is a JSON-RPC request (has both `method` and `id`).
pub fn is_request(message: &Value) -> bool {
    message.get("method").is_some() && message.get("id").is_some_and(|id| !id.is_null())
}

pub fn is_initialize_request(message: &Value) -> bool {
    is_request(message) && message.get("method").and_then(Value::as_str) == Some("initialize")
}
