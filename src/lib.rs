use std::sync::Arc;

use axum::{middleware, routing::any, Router};

pub mod cli;
pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod http;
pub mod lifecycle;
pub mod logging;
pub mod mail_client;
pub mod mcp;
pub mod security;
pub mod session;
pub mod transport;

use mcp::server::ServerFactory;
use security::rate_limit::RateLimiter;
use session::store::SessionStore;
use transport::sse::{LegacyConnections, SSE_PATH};

#[derive(Clone)]
pub struct AppState {
    pub port: u16,
    pub sessions: Arc<SessionStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub legacy: Arc<LegacyConnections>,
    pub server_factory: Arc<dyn ServerFactory>,
}

impl AppState {
    pub fn new(
        port: u16,
        sessions: Arc<SessionStore>,
        rate_limiter: Arc<RateLimiter>,
        server_factory: Arc<dyn ServerFactory>,
    ) -> Self {
        Self {
            port,
            sessions,
            rate_limiter,
            legacy: Arc::new(LegacyConnections::new()),
            server_factory,
        }
    }
}

/// Host normalization runs before the rate limit gate; routing happens only after admission.
pub fn build_app(state: AppState) -> Router {
    let router = Router::new()
        .route("/mcp", any(http::handlers::mcp_endpoint))
        .route(SSE_PATH, any(http::handlers::sse_endpoint))
        .route("/health", any(http::handlers::health))
        .fallback(http::handlers::not_found)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::rate_limit::enforce_rate_limit,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            security::host::normalize_host,
        ))
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state);

    security::headers::apply_security_headers(router)
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use axum::{
        body::Body,
        extract::connect_info::ConnectInfo,
        http::{header, request::Builder as RequestBuilder, Request, StatusCode},
        response::Response,
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::AppError;
    use crate::mcp::server::{tests::StaticProvider, McpServerFactory, ProtocolServer};
    use crate::security::rate_limit::RateLimitSettings;
    use crate::session::store::SessionLimits;
    use crate::transport::streamable::SESSION_HEADER;

    struct Fixture {
        state: AppState,
        clock: Arc<ManualClock>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_limits(SessionLimits::default(), RateLimitSettings::default())
        }

        fn with_limits(session_limits: SessionLimits, rate_limits: RateLimitSettings) -> Self {
            let clock = Arc::new(ManualClock::new());
            let state = AppState::new(
                8080,
                Arc::new(SessionStore::new(session_limits, clock.clone())),
                Arc::new(RateLimiter::new(rate_limits, clock.clone())),
                Arc::new(McpServerFactory::new(Arc::new(StaticProvider))),
            );
            Self { state, clock }
        }

        async fn send(&self, request: Request<Body>) -> Response {
            build_app(self.state.clone())
                .oneshot(request)
                .await
                .expect("router response")
        }

        async fn initialize(&self) -> String {
            let response = self.send(post_mcp(None, initialize_body())).await;
            assert_eq!(response.status(), StatusCode::OK);
            response
                .headers()
                .get(SESSION_HEADER)
                .and_then(|value| value.to_str().ok())
                .expect("session header")
                .to_string()
        }
    }

    fn initialize_body() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {
                "protocolVersion": "2025-03-26",
                "clientInfo": { "name": "router-test", "version": "1.0.0" },
                "capabilities": {}
            }
        })
    }

    fn from_client(builder: RequestBuilder, ip: [u8; 4]) -> RequestBuilder {
        builder.extension(ConnectInfo(SocketAddr::from((ip, 40_000))))
    }

    fn post_mcp(session_id: Option<&str>, body: Value) -> Request<Body> {
        let mut builder = from_client(Request::builder(), [127, 0, 0, 1])
            .method("POST")
            .uri("/mcp")
            .header(header::HOST, "localhost:8080")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::ACCEPT, "application/json, text/event-stream");
        if let Some(session_id) = session_id {
            builder = builder.header(SESSION_HEADER, session_id);
        }
        builder
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    fn simple(method: &str, uri: &str) -> Request<Body> {
        from_client(Request::builder(), [127, 0, 0, 1])
            .method(method)
            .uri(uri)
            .header(header::HOST, "localhost:8080")
            .body(Body::empty())
            .expect("request")
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn health_reports_service_identity() {
        let fixture = Fixture::new();
        let response = fixture.send(simple("GET", "/health")).await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], "agentmail-mcp");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body["timestamp"].as_str().is_some_and(|ts| ts.ends_with('Z')));
    }

    #[tokio::test]
    async fn every_response_carries_security_headers() {
        let fixture = Fixture::new();
        for uri in ["/health", "/nowhere"] {
            let response = fixture.send(simple("GET", uri)).await;
            assert_security_headers(&response);
        }
    }

    fn assert_security_headers(response: &Response) {
        let headers = response.headers();
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["x-xss-protection"], "1; mode=block");
    }

    fn with_host(host: &str) -> Request<Body> {
        from_client(Request::builder(), [127, 0, 0, 1])
            .uri("/health")
            .header(header::HOST, host)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn unparseable_request_url_is_bad_request_with_security_headers() {
        let fixture = Fixture::new();
        for host in ["localhost:99999", "1.2.3.999"] {
            let response = fixture.send(with_host(host)).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{host}");
            assert_security_headers(&response);

            let body = json_body(response).await;
            assert_eq!(body["code"], "invalid_url");
            assert_eq!(body["message"], "Invalid URL");
        }
    }

    #[tokio::test]
    async fn rate_limited_response_carries_security_headers() {
        let fixture = Fixture::with_limits(
            SessionLimits::default(),
            RateLimitSettings {
                window: Duration::from_secs(60),
                max_requests: 1,
            },
        );

        let response = fixture.send(simple("GET", "/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = fixture.send(simple("GET", "/health")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_security_headers(&response);
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let fixture = Fixture::new();
        let response = fixture.send(simple("POST", "/tools")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn invalid_host_header_falls_back_to_localhost() {
        let fixture = Fixture::new();
        let request = from_client(Request::builder(), [127, 0, 0, 1])
            .uri("/health")
            .header(header::HOST, "evil.com/path")
            .body(Body::empty())
            .expect("request");

        let response = fixture.send(request).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn rate_limit_rejects_after_budget_and_recovers_next_window() {
        let fixture = Fixture::with_limits(
            SessionLimits::default(),
            RateLimitSettings {
                window: Duration::from_secs(60),
                max_requests: 3,
            },
        );

        for _ in 0..3 {
            let response = fixture.send(simple("GET", "/health")).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = fixture.send(simple("GET", "/health")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let other_client = from_client(Request::builder(), [10, 0, 0, 2])
            .uri("/health")
            .header(header::HOST, "localhost:8080")
            .body(Body::empty())
            .expect("request");
        assert_eq!(fixture.send(other_client).await.status(), StatusCode::OK);

        fixture.clock.advance(Duration::from_secs(61));
        let response = fixture.send(simple("GET", "/health")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn initialize_creates_session_and_returns_its_id() {
        let fixture = Fixture::new();
        let response = fixture.send(post_mcp(None, initialize_body())).await;

        assert_eq!(response.status(), StatusCode::OK);
        let session_id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .expect("session header")
            .to_string();
        assert!(fixture.state.sessions.contains(&session_id));

        let body = json_body(response).await;
        assert_eq!(body["id"], 1);
        assert_eq!(body["result"]["protocolVersion"], "2025-03-26");
    }

    #[tokio::test]
    async fn session_requests_reach_the_bound_server() {
        let fixture = Fixture::new();
        let session_id = fixture.initialize().await;

        let response = fixture
            .send(post_mcp(
                Some(&session_id),
                json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        let tools = body["result"]["tools"].as_array().expect("tools");
        assert_eq!(tools.len(), 6);

        let response = fixture
            .send(post_mcp(
                Some(&session_id),
                json!({ "jsonrpc": "2.0", "method": "notifications/initialized" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found_and_store_is_untouched() {
        let fixture = Fixture::new();
        let session_id = fixture.initialize().await;

        let response = fixture
            .send(post_mcp(
                Some("00000000-0000-4000-8000-000000000000"),
                json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
            ))
            .await;

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(fixture.state.sessions.len(), 1);
        assert!(fixture.state.sessions.contains(&session_id));
    }

    #[tokio::test]
    async fn non_post_without_session_is_bad_request() {
        let fixture = Fixture::new();
        for method in ["GET", "DELETE", "PUT"] {
            let response = fixture.send(simple(method, "/mcp")).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{method}");
        }
        assert!(fixture.state.sessions.is_empty());
    }

    #[tokio::test]
    async fn first_post_must_be_initialize() {
        let fixture = Fixture::new();
        let response = fixture
            .send(post_mcp(
                None,
                json!({ "jsonrpc": "2.0", "id": 1, "method": "tools/list" }),
            ))
            .await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get(SESSION_HEADER).is_none());
        assert!(fixture.state.sessions.is_empty());
    }

    #[tokio::test]
    async fn capacity_exhaustion_returns_service_unavailable() {
        let fixture = Fixture::with_limits(
            SessionLimits {
                max_sessions: 1,
                ..SessionLimits::default()
            },
            RateLimitSettings::default(),
        );
        fixture.initialize().await;

        let response = fixture.send(post_mcp(None, initialize_body())).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_security_headers(&response);
        assert_eq!(fixture.state.sessions.len(), 1);

        let body = json_body(response).await;
        assert_eq!(body["code"], "at_capacity");
        assert_eq!(
            body["message"],
            "Server at capacity - too many active sessions"
        );
    }

    #[tokio::test]
    async fn delete_closes_session() {
        let fixture = Fixture::new();
        let session_id = fixture.initialize().await;

        let response = fixture
            .send(
                from_client(Request::builder(), [127, 0, 0, 1])
                    .method("DELETE")
                    .uri("/mcp")
                    .header(header::HOST, "localhost:8080")
                    .header(SESSION_HEADER, &session_id)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!fixture.state.sessions.contains(&session_id));

        let response = fixture
            .send(post_mcp(
                Some(&session_id),
                json!({ "jsonrpc": "2.0", "id": 3, "method": "ping" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn session_request(method: &str, session_id: &str) -> Request<Body> {
        from_client(Request::builder(), [127, 0, 0, 1])
            .method(method)
            .uri("/mcp")
            .header(header::HOST, "localhost:8080")
            .header(header::ACCEPT, "text/event-stream")
            .header(SESSION_HEADER, session_id)
            .body(Body::empty())
            .expect("request")
    }

    #[tokio::test]
    async fn standby_stream_opens_and_ends_when_session_is_deleted() {
        let fixture = Fixture::new();
        let session_id = fixture.initialize().await;

        let stream = fixture.send(session_request("GET", &session_id)).await;
        assert_eq!(stream.status(), StatusCode::OK);
        assert_eq!(stream.headers()[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(stream.headers()[SESSION_HEADER], session_id.as_str());

        let response = fixture.send(session_request("DELETE", &session_id)).await;
        assert_eq!(response.status(), StatusCode::OK);

        tokio::time::timeout(Duration::from_secs(2), stream.into_body().collect())
            .await
            .expect("stream ends once the session is closed")
            .expect("stream body");
        assert!(!fixture.state.sessions.contains(&session_id));
    }

    #[tokio::test]
    async fn expired_session_is_not_found_after_sweep() {
        let fixture = Fixture::new();
        let session_id = fixture.initialize().await;

        fixture.clock.advance(Duration::from_secs(31 * 60));
        assert_eq!(fixture.state.sessions.sweep(), vec![session_id.clone()]);

        let response = fixture
            .send(post_mcp(
                Some(&session_id),
                json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" }),
            ))
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    struct FailingFactory;

    impl ServerFactory for FailingFactory {
        fn create_server(&self) -> Result<Arc<dyn ProtocolServer>, AppError> {
            Err(AppError::internal("mail provider unavailable"))
        }
    }

    #[tokio::test]
    async fn server_creation_failure_is_internal_error() {
        let mut fixture = Fixture::new();
        fixture.state.server_factory = Arc::new(FailingFactory);

        let response = fixture.send(post_mcp(None, initialize_body())).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(fixture.state.sessions.is_empty());

        let response = fixture.send(simple("GET", "/sse")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn legacy_post_requires_known_connection() {
        let fixture = Fixture::new();

        let response = fixture.send(simple("POST", "/sse")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let request = from_client(Request::builder(), [127, 0, 0, 1])
            .method("POST")
            .uri("/sse?sessionId=missing")
            .header(header::HOST, "localhost:8080")
            .body(Body::from(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#))
            .expect("request");
        let response = fixture.send(request).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn legacy_stream_opens_as_event_stream() {
        let fixture = Fixture::new();
        let response = fixture.send(simple("GET", "/sse")).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/event-stream"
        );
        assert!(fixture.state.sessions.is_empty());
    }
}
