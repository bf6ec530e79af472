//! Axum handlers behind the four fixed routes.

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, Method},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::AppError;
use crate::logging::redact_session_id;
use crate::session::store::at_capacity;
use crate::transport::streamable::{initialize_message, SESSION_HEADER};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub service: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Deserialize)]
pub struct LegacyQuery {
    #[serde(rename = "sessionId")]
    pub session_id: Option<String>,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

pub async fn not_found() -> AppError {
    AppError::not_found("not_found", "Not Found")
}

pub async fn mcp_endpoint(
    State(state): State<AppState>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(session_id) = headers.get(SESSION_HEADER) {
        let Some(transport) = session_id
            .to_str()
            .ok()
            .and_then(|session_id| state.sessions.touch(session_id))
        else {
            return AppError::not_found("session_not_found", "Session not found").into_response();
        };
        return transport.handle_request(&method, body).await;
    }

    if method == Method::POST {
        return create_session(&state, body).await;
    }

    AppError::bad_request("invalid_request", "Invalid request").into_response()
}

async fn create_session(state: &AppState, body: Bytes) -> Response {
    if !state.sessions.has_capacity() {
        return at_capacity().into_response();
    }

    let message = match initialize_message(&body) {
        Ok(message) => message,
        Err(response) => return response,
    };

    let server = match state.server_factory.create_server() {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, "Streamable HTTP connection error");
            return AppError::internal("failed to create protocol server").into_response();
        }
    };

    let transport = match state.sessions.open(server) {
        Ok(transport) => transport,
        Err(err) => return err.into_response(),
    };

    match transport.handshake(message).await {
        Ok(response) => response,
        Err(response) => {
            error!(
                session = %redact_session_id(transport.session_id()),
                status = response.status().as_u16(),
                "session handshake refused"
            );
            state.sessions.close(transport.session_id());
            response
        }
    }
}

pub async fn sse_endpoint(
    State(state): State<AppState>,
    method: Method,
    Query(query): Query<LegacyQuery>,
    body: Bytes,
) -> Response {
    match method {
        Method::GET => match state.server_factory.create_server() {
            Ok(server) => state.legacy.open_stream(server),
            Err(err) => {
                error!(error = %err, "SSE connection error");
                AppError::Internal {
                    code: "sse_failed",
                    message: "SSE connection failed".to_string(),
                }
                .into_response()
            }
        },
        Method::POST => {
            let Some(connection_id) = query.session_id else {
                return AppError::bad_request("missing_session_id", "Missing sessionId parameter")
                    .into_response();
            };
            match state.legacy.deliver(&connection_id, &body).await {
                Ok(response) => response,
                Err(err) => err.into_response(),
            }
        }
        _ => AppError::MethodNotAllowed.into_response(),
    }
}
