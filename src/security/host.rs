//! Host header normalization.
//!
//! The peer-supplied `Host` is only trusted when it looks like `hostname[:port]`; anything
//! else is replaced before it is used to build the absolute request URL.

use std::sync::OnceLock;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use regex::Regex;
use url::Url;

use crate::{errors::AppError, AppState};

fn host_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9.-]+(:[0-9]+)?$").expect("host pattern is a valid regex")
    })
}

pub fn fallback_host(port: u16) -> String {
    format!("localhost:{port}")
}

pub fn validate_host(raw: Option<&str>, port: u16) -> String {
    match raw {
        Some(host) if host_pattern().is_match(host) => host.to_string(),
        _ => fallback_host(port),
    }
}

/// Absolute URL of the request, built from the validated host.
#[derive(Debug, Clone)]
pub struct RequestUrl(pub Url);

pub fn build_request_url(host: &str, path_and_query: &str) -> Result<Url, AppError> {
    Url::parse(&format!("http://{host}{path_and_query}"))
        .map_err(|_| AppError::bad_request("invalid_url", "Invalid URL"))
}

pub async fn normalize_host(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let raw_host = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok());
    let host = validate_host(raw_host, state.port);

    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|value| value.as_str())
        .unwrap_or("/");
    let url = build_request_url(&host, path_and_query)?;

    request.extensions_mut().insert(RequestUrl(url));
    Ok(next.run(request).await)
}
