//! Session Store
//!
//! Maps opaque session ids to serialized socket state so a reconnecting
//! client resumes where it left off.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::SessionError;

/// Opaque session identifier; survives reconnects within the store's TTL.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.len() > 128 {
            return Err(SessionError::NotFound);
        }
        Ok(Self(s.to_string()))
    }
}

/// Storage for session state. Must tolerate concurrent use from many
/// connecting sockets.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Allocate a fresh session id.
    async fn create(&self) -> Result<SessionId, SessionError> {
        Ok(SessionId::generate())
    }

    /// Load the bytes saved for `id`. Expired or unknown ids are `NotFound`.
    async fn load(&self, id: &SessionId) -> Result<Vec<u8>, SessionError>;

    /// Persist `state` for `id`, refreshing its TTL.
    async fn save(&self, id: &SessionId, state: Vec<u8>) -> Result<(), SessionError>;

    /// Destroy the session (logout). Unknown ids are ignored.
    async fn expire(&self, id: &SessionId) -> Result<(), SessionError>;

    /// Drop every session past its TTL. Returns how many were removed.
    async fn purge_expired(&self) -> Result<usize, SessionError>;
}

struct StoredSession {
    data: Vec<u8>,
    touched_at: DateTime<Utc>,
}

/// In-process session store with a sliding time-to-live.
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionId, StoredSession>>,
    ttl: Duration,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(24 * 3600))
    }
}

impl MemorySessionStore {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            ttl: Duration::from_std(ttl).unwrap_or(Duration::MAX),
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    fn is_expired(&self, session: &StoredSession, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(session.touched_at) > self.ttl
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load(&self, id: &SessionId) -> Result<Vec<u8>, SessionError> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let expired = match sessions.get_mut(id) {
            None => return Err(SessionError::NotFound),
            Some(session) if self.is_expired(session, now) => true,
            Some(session) => {
                session.touched_at = now;
                return Ok(session.data.clone());
            }
        };
        if expired {
            debug!(session = %id, "Session expired on load");
            sessions.remove(id);
        }
        Err(SessionError::NotFound)
    }

    async fn save(&self, id: &SessionId, state: Vec<u8>) -> Result<(), SessionError> {
        self.sessions.write().await.insert(
            id.clone(),
            StoredSession {
                data: state,
                touched_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn expire(&self, id: &SessionId) -> Result<(), SessionError> {
        self.sessions.write().await.remove(id);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize, SessionError> {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, s| !self.is_expired(s, now));
        Ok(before - sessions.len())
    }
}
