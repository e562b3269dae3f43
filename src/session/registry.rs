//! Registry of external long-lived package sessions.
//!
//! Each session is scoped to the identity that registered it; heartbeats and
//! unregisters from any other identity are rejected. Sessions that stop
//! heartbeating are swept on access.

use crate::errors::{GatewayError, GatewayResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_SESSION_TTL_SECS: i64 = 900;

#[derive(Debug, Clone, Serialize)]
pub struct PackageSession {
    pub session_id: String,
    pub identity: String,
    pub package: String,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

pub struct PackageSessionRegistry {
    ttl: chrono::Duration,
    sessions: Mutex<HashMap<String, PackageSession>>,
}

impl Default for PackageSessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL_SECS)
    }
}

impl PackageSessionRegistry {
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            ttl: chrono::Duration::seconds(ttl_secs),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(&self, identity: &str, package: &str) -> PackageSession {
        let session = PackageSession {
            session_id: Uuid::new_v4().to_string(),
            identity: identity.to_string(),
            package: package.to_string(),
            registered_at: Utc::now(),
            last_heartbeat: Utc::now(),
        };
        let mut sessions = self.guard();
        Self::sweep(&mut sessions, self.ttl);
        sessions.insert(session.session_id.clone(), session.clone());
        info!("package session registered: {} ({})", session.session_id, package);
        session
    }

    /// Refresh a session's liveness. Ownership is verified on every call.
    pub fn heartbeat(&self, session_id: &str, identity: &str) -> GatewayResult<()> {
        let mut sessions = self.guard();
        Self::sweep(&mut sessions, self.ttl);
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {session_id}")))?;
        if session.identity != identity {
            return Err(GatewayError::NotFound(format!("session {session_id}")));
        }
        session.last_heartbeat = Utc::now();
        debug!("heartbeat for session {}", session_id);
        Ok(())
    }

    pub fn unregister(&self, session_id: &str, identity: &str) -> GatewayResult<()> {
        let mut sessions = self.guard();
        let owned = sessions
            .get(session_id)
            .is_some_and(|s| s.identity == identity);
        if !owned {
            return Err(GatewayError::NotFound(format!("session {session_id}")));
        }
        sessions.remove(session_id);
        info!("package session unregistered: {}", session_id);
        Ok(())
    }

    pub fn active(&self) -> Vec<PackageSession> {
        let mut sessions = self.guard();
        Self::sweep(&mut sessions, self.ttl);
        sessions.values().cloned().collect()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<String, PackageSession>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sweep(sessions: &mut HashMap<String, PackageSession>, ttl: chrono::Duration) {
        let cutoff = Utc::now() - ttl;
        sessions.retain(|_, s| s.last_heartbeat > cutoff);
    }
}
