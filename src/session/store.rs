//! Bounded registry of live Streamable HTTP sessions.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::{Duration, Instant},
};

use tracing::info;
use uuid::Uuid;

use crate::clock::Clock;
use crate::errors::AppError;
use crate::logging::redact_session_id;
use crate::mcp::server::ProtocolServer;
use crate::transport::streamable::SessionTransport;

#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: 1_000,
            idle_timeout: Duration::from_secs(30 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
        }
    }
}

pub struct Session {
    pub transport: Arc<SessionTransport>,
    pub server: Arc<dyn ProtocolServer>,
    pub last_activity: Instant,
}

pub struct SessionStore {
    sessions: Mutex<HashMap<String, Session>>,
    limits: SessionLimits,
    clock: Arc<dyn Clock>,
}

pub fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}

impl SessionStore {
    pub fn new(limits: SessionLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            limits,
            clock,
        }
    }

    pub fn limits(&self) -> SessionLimits {
        self.limits
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn has_capacity(&self) -> bool {
        self.len() < self.limits.max_sessions
    }

    /// Builds the transport for a new session and registers it.
    ///
    /// The capacity test and the insert happen under one lock. The transport's close
    /// callback removes the session again.
    pub fn open(
        self: &Arc<Self>,
        server: Arc<dyn ProtocolServer>,
    ) -> Result<Arc<SessionTransport>, AppError> {
        let session_id = new_session_id();
        let transport = Arc::new(SessionTransport::new(session_id.clone(), server.clone()));

        let store: Weak<SessionStore> = Arc::downgrade(self);
        transport.set_on_close(Box::new(move |session_id| {
            if let Some(store) = store.upgrade() {
                store.remove(session_id);
            }
        }));

        self.insert(session_id, transport.clone(), server)?;
        Ok(transport)
    }

    pub fn insert(
        &self,
        session_id: String,
        transport: Arc<SessionTransport>,
        server: Arc<dyn ProtocolServer>,
    ) -> Result<(), AppError> {
        let now = self.clock.now();
        let mut sessions = self.lock();
        if sessions.len() >= self.limits.max_sessions {
            return Err(at_capacity());
        }

        info!(
            session = %redact_session_id(&session_id),
            active = sessions.len() + 1,
            "AgentMail session created"
        );
        sessions.insert(
            session_id,
            Session {
                transport,
                server,
                last_activity: now,
            },
        );
        Ok(())
    }

    /// Looks up a session and refreshes its activity time. Unknown ids leave the store untouched.
    pub fn touch(&self, session_id: &str) -> Option<Arc<SessionTransport>> {
        let now = self.clock.now();
        let mut sessions = self.lock();
        let session = sessions.get_mut(session_id)?;
        session.last_activity = now;
        Some(session.transport.clone())
    }

    /// Removes a session from the registry. Returns whether this call removed it.
    pub fn remove(&self, session_id: &str) -> bool {
        let removed = self.lock().remove(session_id).is_some();
        if removed {
            info!(session = %redact_session_id(session_id), "AgentMail session closed");
        }
        removed
    }

    /// Closes a session: removes it and closes its transport. Idempotent.
    pub fn close(&self, session_id: &str) -> bool {
        let Some(session) = self.lock().remove(session_id) else {
            return false;
        };
        info!(session = %redact_session_id(session_id), "AgentMail session closed");
        session.transport.close();
        true
    }

    /// Evicts every session idle for longer than the timeout, judged against one `now`.
    ///
    /// Returns the evicted ids. Transports are closed after the lock is released.
    pub fn sweep(&self) -> Vec<String> {
        let now = self.clock.now();
        let timeout = self.limits.idle_timeout;

        let expired: Vec<Session> = {
            let mut sessions = self.lock();
            let expired_ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| now.saturating_duration_since(session.last_activity) > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            expired_ids
                .iter()
                .filter_map(|id| sessions.remove(id))
                .collect()
        };

        expired
            .into_iter()
            .map(|session| {
                let session_id = session.transport.session_id().to_string();
                info!(session = %redact_session_id(&session_id), "Cleaning up expired session");
                session.transport.close();
                session_id
            })
            .collect()
    }

    /// Closes every remaining session. Used on shutdown.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Session> = self.lock().drain().map(|(_, session)| session).collect();
        for session in &drained {
            session.transport.close();
        }
        drained.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub(crate) fn at_capacity() -> AppError {
    AppError::service_unavailable(
        "at_capacity",
        "Server at capacity - too many active sessions",
    )
}
