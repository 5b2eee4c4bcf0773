//! Durable session store collaborator.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::models::Session;

/// Persistence contract for sessions. The manager keeps its own hot cache;
/// this store is the durable fallback and the refresh-hash index.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> Result<(), anyhow::Error>;

    async fn find_session(&self, id: Uuid) -> Result<Option<Session>, anyhow::Error>;

    /// Persist the mutable activity fields (last activity, risk, flags).
    async fn update_session_activity(&self, session: &Session) -> Result<(), anyhow::Error>;

    async fn mark_inactive(&self, id: Uuid) -> Result<(), anyhow::Error>;

    /// Active sessions for a user, most recently active first.
    async fn find_active_sessions_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Session>, anyhow::Error>;

    /// Look up an active session by the sha256 of its refresh credential.
    async fn find_session_by_refresh_hash(
        &self,
        refresh_hash: &str,
    ) -> Result<Option<Session>, anyhow::Error>;

    /// Swap in a new refresh hash. The old hash stops resolving immediately.
    async fn update_refresh_hash(
        &self,
        id: Uuid,
        refresh_hash: &str,
    ) -> Result<(), anyhow::Error>;
}

/// In-memory session store used by tests.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<Uuid, Session>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Uuid, Session>>, anyhow::Error> {
        self.sessions
            .lock()
            .map_err(|e| anyhow::anyhow!("session store mutex poisoned: {}", e))
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn insert_session(&self, session: &Session) -> Result<(), anyhow::Error> {
        self.lock()?.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_session(&self, id: Uuid) -> Result<Option<Session>, anyhow::Error> {
        Ok(self.lock()?.get(&id).cloned())
    }

    async fn update_session_activity(&self, session: &Session) -> Result<(), anyhow::Error> {
        let mut sessions = self.lock()?;
        if let Some(stored) = sessions.get_mut(&session.id) {
            stored.last_activity = session.last_activity;
            stored.risk_score = session.risk_score;
            stored.flags = session.flags.clone();
            stored.device.last_seen = session.device.last_seen;
        }
        Ok(())
    }

    async fn mark_inactive(&self, id: Uuid) -> Result<(), anyhow::Error> {
        let mut sessions = self.lock()?;
        if let Some(stored) = sessions.get_mut(&id) {
            stored.is_active = false;
        }
        Ok(())
    }

    async fn find_active_sessions_by_user(
        &self,
        user_id: &str,
    ) -> Result<Vec<Session>, anyhow::Error> {
        let sessions = self.lock()?;
        let mut active: Vec<Session> = sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(active)
    }

    async fn find_session_by_refresh_hash(
        &self,
        refresh_hash: &str,
    ) -> Result<Option<Session>, anyhow::Error> {
        let sessions = self.lock()?;
        Ok(sessions
            .values()
            .find(|s| s.is_active && s.refresh_hash == refresh_hash)
            .cloned())
    }

    async fn update_refresh_hash(
        &self,
        id: Uuid,
        refresh_hash: &str,
    ) -> Result<(), anyhow::Error> {
        let mut sessions = self.lock()?;
        if let Some(stored) = sessions.get_mut(&id) {
            stored.refresh_hash = refresh_hash.to_string();
        }
        Ok(())
    }
}
