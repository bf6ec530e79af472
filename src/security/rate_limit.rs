//! Per-client fixed-window request limiting.
//!
//! A window opens on the first request from a client and rolls over once its reset time has
//! passed. Bursts straddling a rollover can admit up to twice the maximum.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use crate::{clock::Clock, errors::AppError, AppState};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub window: Duration,
    pub max_requests: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    requests: u32,
    reset_time: Instant,
}

pub struct RateLimiter {
    entries: Mutex<HashMap<String, RateLimitEntry>>,
    settings: RateLimitSettings,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            settings,
            clock,
        }
    }

    /// Records a request from `client_key` and reports whether it is admitted.
    pub fn check(&self, client_key: &str) -> bool {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        match entries.get_mut(client_key) {
            Some(entry) if now <= entry.reset_time => {
                if entry.requests >= self.settings.max_requests {
                    return false;
                }
                entry.requests += 1;
                true
            }
            _ => {
                entries.insert(
                    client_key.to_string(),
                    RateLimitEntry {
                        requests: 1,
                        reset_time: now + self.settings.window,
                    },
                );
                true
            }
        }
    }

    /// Drops entries whose window has already rolled over. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| now <= entry.reset_time);
        before - entries.len()
    }

    pub fn tracked_clients(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

pub fn client_key(request: &Request) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn enforce_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let key = client_key(&request);
    if !state.rate_limiter.check(&key) {
        warn!(client = %key, "rate limit exceeded");
        return Err(AppError::TooManyRequests);
    }

    Ok(next.run(request).await)
}
