//! Legacy HTTP+SSE binding.
//!
//! `GET /sse` opens an event stream and announces where to POST messages; replies are pushed
//! back over that stream. A connection lives exactly as long as its stream and never enters
//! the session store.

use std::{
    collections::HashMap,
    convert::Infallible,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use axum::{
    body::Bytes,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
};
use futures_util::{future, stream, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::AppError;
use crate::logging::redact_session_id;
use crate::mcp::server::ProtocolServer;

pub const SSE_PATH: &str = "/sse";
const OUTBOUND_BUFFER: usize = 64;

struct LegacyConnection {
    server: Arc<dyn ProtocolServer>,
    outbound: mpsc::Sender<Value>,
}

#[derive(Default)]
pub struct LegacyConnections {
    connections: Mutex<HashMap<String, LegacyConnection>>,
}

/// Deregisters the connection when the client drops the stream.
struct ConnectionGuard {
    connection_id: String,
    registry: Weak<LegacyConnections>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.disconnect(&self.connection_id);
        }
    }
}

impl LegacyConnections {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Registers a connection for `server` and returns its id and event stream.
    pub fn connect(
        self: &Arc<Self>,
        server: Arc<dyn ProtocolServer>,
    ) -> (String, impl Stream<Item = Result<Event, Infallible>> + Send + 'static) {
        let connection_id = Uuid::new_v4().to_string();
        let (outbound, inbound) = mpsc::channel(OUTBOUND_BUFFER);
        self.lock()
            .insert(connection_id.clone(), LegacyConnection { server, outbound });
        info!(connection = %redact_session_id(&connection_id), "SSE connection established");

        let guard = ConnectionGuard {
            connection_id: connection_id.clone(),
            registry: Arc::downgrade(self),
        };
        let endpoint = Event::default()
            .event("endpoint")
            .data(format!("{SSE_PATH}?sessionId={connection_id}"));

        let messages = ReceiverStream::new(inbound).map(move |message: Value| {
            let _ = &guard;
            Ok(Event::default().event("message").data(message.to_string()))
        });

        (
            connection_id,
            stream::once(future::ready(Ok(endpoint))).chain(messages),
        )
    }

    pub fn open_stream(self: &Arc<Self>, server: Arc<dyn ProtocolServer>) -> Response {
        let (_, events) = self.connect(server);
        Sse::new(events)
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
            .into_response()
    }

    /// Hands a client message to the connection's server and queues any reply on its stream.
    pub async fn deliver(&self, connection_id: &str, body: &Bytes) -> Result<Response, AppError> {
        let (server, outbound) = {
            let connections = self.lock();
            let connection = connections
                .get(connection_id)
                .ok_or_else(|| AppError::not_found("connection_not_found", "Connection not found"))?;
            (connection.server.clone(), connection.outbound.clone())
        };

        let payload: Value = serde_json::from_slice(body)
            .map_err(|_| AppError::bad_request("invalid_json", "Invalid message"))?;

        if let Some(reply) = server.handle_message(payload).await {
            outbound.send(reply).await.map_err(|_| {
                AppError::not_found("connection_not_found", "Connection not found")
            })?;
        }

        Ok((StatusCode::ACCEPTED, "Accepted").into_response())
    }

    fn disconnect(&self, connection_id: &str) {
        if self.lock().remove(connection_id).is_some() {
            debug!(connection = %redact_session_id(connection_id), "SSE connection closed");
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, LegacyConnection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::mcp::rpc::json_rpc_result;

    struct PongServer;

    #[async_trait]
    impl ProtocolServer for PongServer {
        async fn handle_message(&self, message: Value) -> Option<Value> {
            message
                .get("id")
                .cloned()
                .map(|id| json_rpc_result(Some(id), json!({})))
        }
    }

    #[tokio::test]
    async fn connection_lives_as_long_as_its_stream() {
        let registry = Arc::new(LegacyConnections::new());
        let (connection_id, events) = registry.connect(Arc::new(PongServer));
        assert_eq!(registry.len(), 1);

        let response = registry
            .deliver(
                &connection_id,
                &Bytes::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#),
            )
            .await
            .expect("message delivered");
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let delivered: Vec<_> = events.take(2).collect().await;
        assert_eq!(delivered.len(), 2);
        assert!(registry.is_empty(), "dropping the stream disconnects");
    }

    #[tokio::test]
    async fn unknown_connection_is_not_found() {
        let registry = Arc::new(LegacyConnections::new());
        let err = registry
            .deliver("missing", &Bytes::from("{}"))
            .await
            .expect_err("no such connection");
        assert!(matches!(err, AppError::NotFound { .. }));
    }

    #[tokio::test]
    async fn invalid_json_is_a_bad_request() {
        let registry = Arc::new(LegacyConnections::new());
        let (connection_id, _events) = registry.connect(Arc::new(PongServer));

        let err = registry
            .deliver(&connection_id, &Bytes::from("{"))
            .await
            .expect_err("invalid json");
        assert!(matches!(err, AppError::BadRequest { .. }));
    }
}
