//! AgentMail tools exposed via Model Context Protocol
//!
//! Each tool checks only the shape of its arguments and forwards to the `MailProvider`.
//! Provider responses are returned verbatim as pretty-printed JSON text.

use rust_mcp_sdk::{
    macros,
    schema::{CallToolRequestParams, CallToolResult, ContentBlock, TextContent, Tool},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::AppError;
use crate::mail_client::{CreateInbox, MailProvider, OutgoingMessage, Page};
use crate::mcp::rpc::{json_rpc_error, json_rpc_result, INTERNAL_ERROR, INVALID_PARAMS};

#[macros::mcp_tool(
    name = "agentmail_list_inboxes",
    description = "List all available inboxes in the AgentMail account"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct ListInboxesTool {}

#[macros::mcp_tool(
    name = "agentmail_get_inbox",
    description = "Get details of a specific inbox by ID"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetInboxTool {
    /// The ID of the inbox to retrieve
    pub inbox_id: String,
}

#[macros::mcp_tool(
    name = "agentmail_create_inbox",
    description = "Create a new inbox; every field is optional and defaults are chosen by AgentMail"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct CreateInboxTool {
    /// Local part of the new address
    pub username: Option<String>,
    /// Domain of the new address
    pub domain: Option<String>,
    /// Human readable inbox name
    pub display_name: Option<String>,
    /// Client supplied idempotency key
    pub client_id: Option<String>,
}

#[macros::mcp_tool(
    name = "agentmail_get_messages",
    description = "Get messages from a specific inbox with optional pagination"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetMessagesTool {
    /// The ID of the inbox to get messages from
    pub inbox_id: String,
    /// Maximum number of messages to retrieve
    pub limit: Option<u64>,
    /// Number of messages to skip for pagination
    pub offset: Option<u64>,
}

#[macros::mcp_tool(
    name = "agentmail_get_message",
    description = "Get a specific message by ID from an inbox"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct GetMessageTool {
    /// The ID of the inbox containing the message
    pub inbox_id: String,
    /// The ID of the message to retrieve
    pub message_id: String,
}

#[macros::mcp_tool(
    name = "agentmail_send_message",
    description = "Send an email message from a specific inbox"
)]
#[derive(Debug, Deserialize, Serialize, macros::JsonSchema)]
pub struct SendMessageTool {
    /// The ID of the inbox to send from
    pub inbox_id: String,
    /// Recipient email address(es)
    pub to: Recipients,
    /// Email subject line
    pub subject: String,
    /// Plain text email content
    pub text: Option<String>,
    /// HTML email content
    pub html: Option<String>,
    /// CC recipient email address(es)
    pub cc: Option<Recipients>,
    /// BCC recipient email address(es)
    pub bcc: Option<Recipients>,
}

/// A single address or a list of addresses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, macros::JsonSchema)]
#[serde(untagged)]
pub enum Recipients {
    One(String),
    Many(Vec<String>),
}

impl From<Recipients> for Vec<String> {
    fn from(value: Recipients) -> Self {
        match value {
            Recipients::One(address) => vec![address],
            Recipients::Many(addresses) => addresses,
        }
    }
}

impl From<SendMessageTool> for OutgoingMessage {
    fn from(args: SendMessageTool) -> Self {
        OutgoingMessage {
            to: args.to.into(),
            subject: args.subject,
            text: args.text,
            html: args.html,
            cc: args.cc.map(Into::into),
            bcc: args.bcc.map(Into::into),
        }
    }
}

pub fn build_tools_list() -> Vec<Tool> {
    vec![
        ListInboxesTool::tool(),
        GetInboxTool::tool(),
        CreateInboxTool::tool(),
        GetMessagesTool::tool(),
        GetMessageTool::tool(),
        SendMessageTool::tool(),
    ]
}

#[derive(Debug)]
enum ToolFailure {
    MissingArguments,
    InvalidArguments(&'static str),
    Provider(AppError),
}

impl ToolFailure {
    fn message(&self) -> String {
        match self {
            Self::MissingArguments => "No arguments provided".to_string(),
            Self::InvalidArguments(tool) => format!("Invalid arguments for {tool}"),
            Self::Provider(AppError::Internal { message, .. }) => message.clone(),
            Self::Provider(err) => err.to_string(),
        }
    }
}

fn parse_arguments<T: DeserializeOwned>(
    tool: &'static str,
    arguments: Option<Map<String, Value>>,
) -> Result<T, ToolFailure> {
    let arguments = arguments.ok_or(ToolFailure::MissingArguments)?;
    serde_json::from_value(Value::Object(arguments))
        .map_err(|_| ToolFailure::InvalidArguments(tool))
}

async fn run_tool(
    provider: &dyn MailProvider,
    name: &str,
    arguments: Option<Map<String, Value>>,
) -> Option<Result<Value, ToolFailure>> {
    let outcome = match name {
        "agentmail_list_inboxes" => provider.list_inboxes().await.map_err(ToolFailure::Provider),
        "agentmail_get_inbox" => {
            match parse_arguments::<GetInboxTool>("agentmail_get_inbox", arguments) {
                Ok(args) => provider
                    .get_inbox(&args.inbox_id)
                    .await
                    .map_err(ToolFailure::Provider),
                Err(failure) => Err(failure),
            }
        }
        "agentmail_create_inbox" => {
            match parse_arguments::<CreateInboxTool>("agentmail_create_inbox", arguments) {
                Ok(args) => provider
                    .create_inbox(&CreateInbox {
                        username: args.username,
                        domain: args.domain,
                        display_name: args.display_name,
                        client_id: args.client_id,
                    })
                    .await
                    .map_err(ToolFailure::Provider),
                Err(failure) => Err(failure),
            }
        }
        "agentmail_get_messages" => {
            match parse_arguments::<GetMessagesTool>("agentmail_get_messages", arguments) {
                Ok(args) => provider
                    .list_messages(
                        &args.inbox_id,
                        Page {
                            limit: args.limit,
                            offset: args.offset,
                        },
                    )
                    .await
                    .map_err(ToolFailure::Provider),
                Err(failure) => Err(failure),
            }
        }
        "agentmail_get_message" => {
            match parse_arguments::<GetMessageTool>("agentmail_get_message", arguments) {
                Ok(args) => provider
                    .get_message(&args.inbox_id, &args.message_id)
                    .await
                    .map_err(ToolFailure::Provider),
                Err(failure) => Err(failure),
            }
        }
        "agentmail_send_message" => {
            match parse_arguments::<SendMessageTool>("agentmail_send_message", arguments) {
                Ok(args) => {
                    let inbox_id = args.inbox_id.clone();
                    provider
                        .send_message(&inbox_id, &OutgoingMessage::from(args))
                        .await
                        .map_err(ToolFailure::Provider)
                }
                Err(failure) => Err(failure),
            }
        }
        _ => return None,
    };

    Some(outcome)
}

fn text_result(text: String, is_error: bool) -> CallToolResult {
    CallToolResult {
        content: vec![ContentBlock::from(TextContent::new(text, None, None))],
        is_error: Some(is_error),
        meta: None,
        structured_content: None,
    }
}

pub async fn handle_tools_call(
    provider: &dyn MailProvider,
    id: Option<Value>,
    params: Option<Value>,
) -> Value {
    let Some(raw_params) = params else {
        return json_rpc_error(id, INVALID_PARAMS, "Invalid params");
    };

    let tool_call: CallToolRequestParams = match serde_json::from_value(raw_params) {
        Ok(value) => value,
        Err(_) => return json_rpc_error(id, INVALID_PARAMS, "Invalid params"),
    };

    let result = match run_tool(provider, &tool_call.name, tool_call.arguments).await {
        Some(Ok(payload)) => match serde_json::to_string_pretty(&payload) {
            Ok(text) => text_result(text, false),
            Err(err) => {
                tracing::error!(error = %err, "failed to render tool payload");
                return json_rpc_error(id, INTERNAL_ERROR, "Internal error");
            }
        },
        Some(Err(failure)) => {
            debug!(tool = %tool_call.name, error = %failure.message(), "tool call failed");
            text_result(format!("Error: {}", failure.message()), true)
        }
        None => text_result(format!("Unknown tool: {}", tool_call.name), true),
    };

    match serde_json::to_value(result) {
        Ok(value) => json_rpc_result(id, value),
        Err(_) => json_rpc_error(id, INTERNAL_ERROR, "Internal error"),
    }
}
