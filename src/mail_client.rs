use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::Serialize;
use serde_json::Value;

use crate::errors::AppError;

pub const DEFAULT_BASE_URL: &str = "https://api.agentmail.to/v0";

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct CreateInbox {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub to: Vec<String>,
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cc: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bcc: Option<Vec<String>>,
}

/// Page selection for message listing; forwarded as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

/// The mail backend behind the tools. Payloads are the provider's JSON, untouched.
#[async_trait]
pub trait MailProvider: Send + Sync {
    async fn list_inboxes(&self) -> Result<Value, AppError>;
    async fn get_inbox(&self, inbox_id: &str) -> Result<Value, AppError>;
    async fn create_inbox(&self, request: &CreateInbox) -> Result<Value, AppError>;
    async fn list_messages(&self, inbox_id: &str, page: Page) -> Result<Value, AppError>;
    async fn get_message(&self, inbox_id: &str, message_id: &str) -> Result<Value, AppError>;
    async fn send_message(
        &self,
        inbox_id: &str,
        message: &OutgoingMessage,
    ) -> Result<Value, AppError>;
}

#[derive(Debug, Clone)]
pub struct AgentMailClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl AgentMailClient {
    pub fn new(api_key: impl Into<String>, base_url: &str) -> Result<Self, AppError> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(AppError::internal("mail provider api key must not be empty"));
        }

        let base_url = Url::parse(base_url)
            .map_err(|err| AppError::internal(format!("invalid mail provider url: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::internal("mail provider url cannot be a base url"));
        }

        let http = Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|err| AppError::internal(format!("failed to build http client: {err}")))?;

        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<Value, AppError> {
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .bearer_auth(&self.api_key);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(|err| {
            AppError::internal(format!("mail provider request failed: {err}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let excerpt: String = detail.chars().take(200).collect();
            tracing::warn!(
                method = %method,
                path = %url.path(),
                status = status.as_u16(),
                "mail provider returned an error status"
            );
            return Err(AppError::internal(format!(
                "mail provider returned {status}: {excerpt}"
            )));
        }

        response.json::<Value>().await.map_err(|err| {
            AppError::internal(format!("mail provider returned invalid json: {err}"))
        })
    }
}

fn to_body<T: Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|err| AppError::internal(format!("failed to encode request body: {err}")))
}

#[async_trait]
impl MailProvider for AgentMailClient {
    async fn list_inboxes(&self) -> Result<Value, AppError> {
        self.send(Method::GET, self.endpoint(&["inboxes"]), None)
            .await
    }

    async fn get_inbox(&self, inbox_id: &str) -> Result<Value, AppError> {
        self.send(Method::GET, self.endpoint(&["inboxes", inbox_id]), None)
            .await
    }

    async fn create_inbox(&self, request: &CreateInbox) -> Result<Value, AppError> {
        let body = to_body(request)?;
        self.send(Method::POST, self.endpoint(&["inboxes"]), Some(body))
            .await
    }

    async fn list_messages(&self, inbox_id: &str, page: Page) -> Result<Value, AppError> {
        let mut url = self.endpoint(&["inboxes", inbox_id, "messages"]);
        {
            let mut query = url.query_pairs_mut();
            if let Some(limit) = page.limit {
                query.append_pair("limit", &limit.to_string());
            }
            if let Some(offset) = page.offset {
                query.append_pair("offset", &offset.to_string());
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        self.send(Method::GET, url, None).await
    }

    async fn get_message(&self, inbox_id: &str, message_id: &str) -> Result<Value, AppError> {
        self.send(
            Method::GET,
            self.endpoint(&["inboxes", inbox_id, "messages", message_id]),
            None,
        )
        .await
    }

    async fn send_message(
        &self,
        inbox_id: &str,
        message: &OutgoingMessage,
    ) -> Result<Value, AppError> {
        let body = to_body(message)?;
        self.send(
            Method::POST,
            self.endpoint(&["inboxes", inbox_id, "messages", "send"]),
            Some(body),
        )
        .await
    }
}
