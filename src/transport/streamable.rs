//! Per-session Streamable HTTP binding.
//!
//! Each session owns one `SessionTransport`, which forwards the session's HTTP exchanges
//! to its dedicated protocol server and reports its own closure through a callback.

use std::{
    convert::Infallible,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use axum::{
    body::Bytes,
    http::{HeaderName, HeaderValue, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures_util::stream;
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::errors::AppError;
use crate::logging::redact_session_id;
use crate::mcp::rpc::{
    is_initialize_request, json_rpc_error, INVALID_REQUEST, PARSE_ERROR, SERVER_ERROR,
};
use crate::mcp::server::ProtocolServer;

pub const SESSION_HEADER: &str = "mcp-session-id";

pub type CloseCallback = Box<dyn Fn(&str) + Send + Sync>;

pub struct SessionTransport {
    session_id: String,
    server: Arc<dyn ProtocolServer>,
    closed: watch::Sender<bool>,
    inflight: tokio::sync::Mutex<()>,
    on_close: Mutex<Option<CloseCallback>>,
}

impl SessionTransport {
    pub fn new(session_id: String, server: Arc<dyn ProtocolServer>) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            session_id,
            server,
            closed,
            inflight: tokio::sync::Mutex::new(()),
            on_close: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn set_on_close(&self, callback: CloseCallback) {
        *self.on_close.lock().unwrap_or_else(PoisonError::into_inner) = Some(callback);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Marks the transport closed and fires the close callback. Only the first call has an effect.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }

        let callback = self
            .on_close
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(&self.session_id);
        }
    }

    /// Runs the `initialize` exchange that establishes the session.
    ///
    /// `Err` carries the response to send when the server refused the handshake.
    pub async fn handshake(&self, message: Value) -> Result<Response, Response> {
        let _turn = self.inflight.lock().await;
        match self.server.handle_message(message).await {
            Some(reply) if reply.get("result").is_some() => {
                Ok(self.with_session_header((StatusCode::OK, Json(reply)).into_response()))
            }
            Some(reply) => Err((StatusCode::BAD_REQUEST, Json(reply)).into_response()),
            None => Err(AppError::internal("initialize produced no response").into_response()),
        }
    }

    pub async fn handle_request(&self, method: &Method, body: Bytes) -> Response {
        if self.is_closed() {
            return AppError::not_found("session_not_found", "Session not found").into_response();
        }

        match *method {
            Method::POST => self.handle_post(body).await,
            Method::GET => self.open_standby_stream(),
            Method::DELETE => {
                debug!(session = %redact_session_id(&self.session_id), "client terminated session");
                self.close();
                StatusCode::OK.into_response()
            }
            _ => AppError::MethodNotAllowed.into_response(),
        }
    }

    async fn handle_post(&self, body: Bytes) -> Response {
        let payload: Value = match serde_json::from_slice(&body) {
            Ok(value) => value,
            Err(_) => {
                return self.with_session_header(
                    (
                        StatusCode::BAD_REQUEST,
                        Json(json_rpc_error(None, PARSE_ERROR, "Parse error")),
                    )
                        .into_response(),
                )
            }
        };

        let reinitializes = match &payload {
            Value::Array(batch) => batch.iter().any(is_initialize_request),
            single => is_initialize_request(single),
        };
        if reinitializes {
            return self.with_session_header(
                (
                    StatusCode::BAD_REQUEST,
                    Json(json_rpc_error(
                        None,
                        INVALID_REQUEST,
                        "Invalid Request: Server already initialized",
                    )),
                )
                    .into_response(),
            );
        }

        let _turn = self.inflight.lock().await;
        let response = match self.server.handle_message(payload).await {
            Some(reply) => (StatusCode::OK, Json(reply)).into_response(),
            None => StatusCode::ACCEPTED.into_response(),
        };
        self.with_session_header(response)
    }

    /// Stream for server-initiated messages. It carries only keep-alives and ends on closure.
    fn open_standby_stream(&self) -> Response {
        let closed = self.closed.subscribe();
        let events = stream::unfold(closed, |mut closed| async move {
            let _ = closed.wait_for(|closed| *closed).await;
            None::<(Result<Event, Infallible>, watch::Receiver<bool>)>
        });

        let response = Sse::new(events)
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
            .into_response();
        self.with_session_header(response)
    }

    fn with_session_header(&self, mut response: Response) -> Response {
        if let Ok(value) = HeaderValue::from_str(&self.session_id) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(SESSION_HEADER), value);
        }
        response
    }
}

/// Body of a session-establishing POST, accepted only when it is a lone `initialize` request.
pub fn initialize_message(body: &[u8]) -> Result<Value, Response> {
    let not_initialized = || {
        (
            StatusCode::BAD_REQUEST,
            Json(json_rpc_error(
                None,
                SERVER_ERROR,
                "Bad Request: Server not initialized",
            )),
        )
            .into_response()
    };

    let payload: Value = serde_json::from_slice(body).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json_rpc_error(None, PARSE_ERROR, "Parse error")),
        )
            .into_response()
    })?;

    let message = match payload {
        Value::Array(mut batch) if batch.len() == 1 => batch.remove(0),
        Value::Array(batch) if batch.iter().any(is_initialize_request) => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json_rpc_error(
                    None,
                    INVALID_REQUEST,
                    "Invalid Request: Only one initialization request is allowed",
                )),
            )
                .into_response())
        }
        other => other,
    };

    if is_initialize_request(&message) {
        Ok(message)
    } else {
        Err(not_initialized())
    }
}
