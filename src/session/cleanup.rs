//! Periodic eviction of idle sessions.

use std::{sync::Arc, time::Duration};

use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

use crate::security::rate_limit::RateLimiter;
use crate::session::store::SessionStore;

pub struct CleanupScheduler {
    sessions: Arc<SessionStore>,
    rate_limiter: Arc<RateLimiter>,
    interval: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions_evicted: usize,
    pub rate_limits_purged: usize,
}

impl CleanupScheduler {
    pub fn new(sessions: Arc<SessionStore>, rate_limiter: Arc<RateLimiter>) -> Self {
        let interval = sessions.limits().sweep_interval;
        Self {
            sessions,
            rate_limiter,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One pass over the session store and the rate-limit table.
    pub fn run_once(&self) -> SweepReport {
        let report = SweepReport {
            sessions_evicted: self.sessions.sweep().len(),
            rate_limits_purged: self.rate_limiter.purge_expired(),
        };

        if report.sessions_evicted > 0 {
            info!(
                evicted = report.sessions_evicted,
                remaining = self.sessions.len(),
                "idle sessions evicted"
            );
        }
        debug!(purged = report.rate_limits_purged, "stale rate limit windows purged");
        report
    }

    /// Runs the sweep every interval until the shutdown signal fires.
    pub fn spawn(self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; nothing can be idle yet.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once();
                    }
                    _ = shutdown.recv() => {
                        debug!("session cleanup stopped");
                        break;
                    }
                }
            }
        })
    }
}
