use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

/// Logs go to stderr so the stdio binding owns stdout.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Session tokens are bearer credentials; only their first eight characters are ever logged.
pub fn redact_session_id(session_id: &str) -> String {
    let prefix: String = session_id.chars().take(8).collect();
    format!("{prefix}...")
}

pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis();

    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        duration_ms = elapsed_ms,
        "request summary"
    );

    match status.as_u16() {
        429 => warn!(method = %method, path = %path, "request rejected by rate limit"),
        503 => warn!(method = %method, path = %path, "session capacity exhausted"),
        _ => {}
    }

    response
}
