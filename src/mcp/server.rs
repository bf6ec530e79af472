//! The protocol server bound to each transport
//!
//! Decodes JSON-RPC messages, negotiates the protocol version on `initialize` and routes
//! `tools/list` / `tools/call` to the AgentMail tools. The transports only see the
//! `ProtocolServer` trait.

use std::sync::Arc;

use async_trait::async_trait;
use rust_mcp_sdk::schema::{
    Implementation, InitializeResult, JsonrpcMessage, ListToolsResult, ServerCapabilities,
    ServerCapabilitiesTools,
};
use serde_json::{json, Value};
use tracing::info;

use crate::domain::tools::{build_tools_list, handle_tools_call};
use crate::errors::AppError;
use crate::mail_client::MailProvider;
use crate::mcp::rpc::{
    is_json_rpc_error, json_rpc_error, json_rpc_result, request_id_to_value, INTERNAL_ERROR,
    INVALID_REQUEST, METHOD_NOT_FOUND,
};

pub const SERVER_NAME: &str = "org/agentmail";
pub const SUPPORTED_PROTOCOL_VERSIONS: [&str; 3] = ["2025-06-18", "2025-03-26", "2024-11-05"];
pub const LATEST_PROTOCOL_VERSION: &str = SUPPORTED_PROTOCOL_VERSIONS[0];

/// Answers protocol messages for one transport.
///
/// Returns `None` for messages that require no reply (notifications, responses).
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    async fn handle_message(&self, message: Value) -> Option<Value>;
}

/// Produces a dedicated protocol server for every session or legacy connection.
pub trait ServerFactory: Send + Sync {
    fn create_server(&self) -> Result<Arc<dyn ProtocolServer>, AppError>;
}

pub struct McpServer {
    provider: Arc<dyn MailProvider>,
}

impl McpServer {
    pub fn new(provider: Arc<dyn MailProvider>) -> Self {
        Self { provider }
    }

    async fn handle_request(&self, id: Option<Value>, method: &str, params: Option<Value>) -> Value {
        let audit_params = redact_audit_params(params.as_ref());

        let response = match method {
            "initialize" => initialize_response(id, params.as_ref()),
            "ping" => json_rpc_result(id, json!({})),
            "tools/list" => {
                let result = ListToolsResult {
                    meta: None,
                    next_cursor: None,
                    tools: build_tools_list(),
                };
                match serde_json::to_value(result) {
                    Ok(value) => json_rpc_result(id, value),
                    Err(_) => json_rpc_error(id, INTERNAL_ERROR, "Internal error"),
                }
            }
            "tools/call" => handle_tools_call(self.provider.as_ref(), id, params).await,
            _ => json_rpc_error(id, METHOD_NOT_FOUND, "Method not found"),
        };

        info!(
            method = %method,
            params = %audit_params,
            outcome = if is_json_rpc_error(&response) { "failure" } else { "success" },
            "mcp action audited"
        );

        response
    }

    fn handle_notification(&self, method: &str) {
        match method {
            "notifications/initialized" => info!("AgentMail MCP client initialized"),
            other => tracing::debug!(method = %other, "ignoring notification"),
        }
    }
}

#[async_trait]
impl ProtocolServer for McpServer {
    async fn handle_message(&self, payload: Value) -> Option<Value> {
        if let Some(batch) = payload.as_array() {
            if batch.is_empty() {
                return Some(json_rpc_error(None, INVALID_REQUEST, "Invalid Request"));
            }

            let mut responses = Vec::new();
            for item in batch {
                if let Some(response) = self.handle_single(item.clone()).await {
                    responses.push(response);
                }
            }

            return (!responses.is_empty()).then_some(Value::Array(responses));
        }

        self.handle_single(payload).await
    }
}

impl McpServer {
    async fn handle_single(&self, payload: Value) -> Option<Value> {
        if !payload.is_object() {
            return Some(json_rpc_error(None, INVALID_REQUEST, "Invalid Request"));
        }

        let request_id = payload.get("id").cloned();
        let parsed: JsonrpcMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(_) => return Some(json_rpc_error(request_id, INVALID_REQUEST, "Invalid Request")),
        };

        match parsed {
            JsonrpcMessage::Request(request) => {
                let request_id = request_id_to_value(request.id);
                if request.method.trim().is_empty() {
                    return Some(json_rpc_error(Some(request_id), INVALID_REQUEST, "Invalid Request"));
                }

                Some(
                    self.handle_request(
                        Some(request_id),
                        &request.method,
                        request.params.map(Value::Object),
                    )
                    .await,
                )
            }
            JsonrpcMessage::Notification(notification) => {
                self.handle_notification(&notification.method);
                None
            }
            JsonrpcMessage::ResultResponse(_) | JsonrpcMessage::ErrorResponse(_) => None,
        }
    }
}

fn initialize_response(id: Option<Value>, params: Option<&Value>) -> Value {
    let protocol_version = negotiate_protocol_version(params);

    let initialize_result = InitializeResult {
        server_info: Implementation {
            name: SERVER_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: None,
            description: None,
            icons: vec![],
            website_url: None,
        },
        capabilities: ServerCapabilities {
            tools: Some(ServerCapabilitiesTools {
                list_changed: Some(false),
            }),
            ..Default::default()
        },
        protocol_version: protocol_version.to_string(),
        instructions: None,
        meta: None,
    };

    match serde_json::to_value(initialize_result) {
        Ok(value) => json_rpc_result(id, value),
        Err(_) => json_rpc_error(id, INTERNAL_ERROR, "Internal error"),
    }
}

/// Echoes the client's version when supported, otherwise offers the latest one.
pub fn negotiate_protocol_version(params: Option<&Value>) -> &'static str {
    let offered = params
        .and_then(Value::as_object)
        .and_then(|object| object.get("protocolVersion"))
        .and_then(Value::as_str)
        .map(str::trim);

    offered
        .and_then(|offered| {
            SUPPORTED_PROTOCOL_VERSIONS
                .into_iter()
                .find(|supported| *supported == offered)
        })
        .unwrap_or(LATEST_PROTOCOL_VERSION)
}

pub fn redact_audit_params(params: Option<&Value>) -> Value {
    params.map(redact_audit_value).unwrap_or(Value::Null)
}

pub fn redact_audit_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_audit_value(item))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_audit_value).collect()),
        _ => value.clone(),
    }
}

/// Message bodies are user content; keys that look like credentials are always hidden.
pub fn is_sensitive_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    matches!(
        normalized.as_str(),
        "authorization" | "api_key" | "apikey" | "text" | "html"
    ) || normalized.contains("token")
        || normalized.contains("secret")
        || normalized.contains("password")
        || normalized.contains("credential")
}

pub struct McpServerFactory {
    provider: Arc<dyn MailProvider>,
}

impl McpServerFactory {
    pub fn new(provider: Arc<dyn MailProvider>) -> Self {
        Self { provider }
    }
}

impl ServerFactory for McpServerFactory {
    fn create_server(&self) -> Result<Arc<dyn ProtocolServer>, AppError> {
        Ok(Arc::new(McpServer::new(self.provider.clone())))
    }
}
