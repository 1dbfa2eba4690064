//! In-memory session store.
//!
//! One mutex guards the whole map. Session counts are small next to
//! message volume, and every operation holds the lock only briefly.

use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use agent_hub_core::{
    AgentHandle, SessionAccess, SessionKey, SessionLease, SessionSnapshot, traits::StoreError,
};

/// Live session state. Owned exclusively by the [`SessionStore`].
#[derive(Debug)]
pub struct Session {
    key: SessionKey,
    epoch: u64,
    agent: AgentHandle,
    history: Vec<String>,
    created_at: i64,
    last_activity: Instant,
}

impl Session {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    #[must_use]
    pub fn agent(&self) -> &AgentHandle {
        &self.agent
    }

    /// Prior responses, oldest first.
    #[must_use]
    pub fn history(&self) -> &[String] {
        &self.history
    }

    /// Creation timestamp (Unix epoch seconds).
    #[must_use]
    pub const fn created_at(&self) -> i64 {
        self.created_at
    }

    #[must_use]
    pub const fn last_activity(&self) -> Instant {
        self.last_activity
    }

    #[must_use]
    pub fn lease(&self) -> SessionLease {
        SessionLease {
            key: self.key.clone(),
            epoch: self.epoch,
        }
    }

    /// Give up the session, keeping only its agent for cleanup.
    #[must_use]
    pub fn into_agent(self) -> AgentHandle {
        self.agent
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            lease: self.lease(),
            agent: AgentHandle::clone(&self.agent),
            history: self.history.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Thread-safe map from session key to session state.
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionKey, Session>>,
    next_epoch: AtomicU64,
}

impl SessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_epoch: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<SessionKey, Session>>, StoreError> {
        self.sessions
            .lock()
            .map_err(|e| StoreError::Internal(e.to_string()))
    }

    /// Insert a fresh session with empty history.
    ///
    /// Last create wins: an existing session under the same key is replaced
    /// and handed back so the caller can clean up its agent.
    ///
    /// # Errors
    /// Returns `Internal` if the lock is poisoned.
    pub fn create(
        &self,
        key: &str,
        agent: AgentHandle,
    ) -> Result<(SessionLease, Option<Session>), StoreError> {
        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            key: key.to_string(),
            epoch,
            agent,
            history: Vec::new(),
            created_at: now(),
            last_activity: Instant::now(),
        };
        let lease = session.lease();

        let displaced = self.lock()?.insert(key.to_string(), session);
        Ok((lease, displaced))
    }

    /// Snapshot a session.
    ///
    /// # Errors
    /// Returns `NotFound` if no session exists under `key`.
    pub fn get(&self, key: &str) -> Result<SessionSnapshot, StoreError> {
        self.with_session(key, Session::snapshot)
    }

    /// Run `f` against a session while holding the store lock.
    ///
    /// # Errors
    /// Returns `NotFound` if no session exists under `key`.
    pub fn with_session<R>(&self, key: &str, f: impl FnOnce(&Session) -> R) -> Result<R, StoreError> {
        let sessions = self.lock()?;
        sessions
            .get(key)
            .map(f)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    /// Append to history and refresh last activity, atomically.
    ///
    /// # Errors
    /// Returns `NotFound` if the session was closed or reaped meanwhile.
    pub fn append_and_touch(&self, key: &str, text: impl Into<String>) -> Result<(), StoreError> {
        let mut sessions = self.lock()?;
        let session = sessions
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        session.history.push(text.into());
        session.touch();
        Ok(())
    }

    /// Refresh last activity without other changes.
    ///
    /// # Errors
    /// Returns `NotFound` if no session exists under `key`.
    pub fn touch(&self, key: &str) -> Result<(), StoreError> {
        let mut sessions = self.lock()?;
        sessions
            .get_mut(key)
            .map(Session::touch)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    /// Refresh last activity only if the session is still the leased
    /// incarnation.
    ///
    /// # Errors
    /// Returns `NotFound` if the session is gone or was re-created.
    pub fn touch_lease(&self, lease: &SessionLease) -> Result<(), StoreError> {
        let mut sessions = self.lock()?;
        match sessions.get_mut(&lease.key) {
            Some(session) if session.epoch == lease.epoch => {
                session.touch();
                Ok(())
            }
            _ => Err(StoreError::NotFound(lease.key.clone())),
        }
    }

    /// Remove and return a session. Removing twice yields `NotFound`.
    ///
    /// # Errors
    /// Returns `NotFound` if no session exists under `key`.
    pub fn remove(&self, key: &str) -> Result<Session, StoreError> {
        self.lock()?
            .remove(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    /// Remove a session only if it is still the leased incarnation.
    ///
    /// # Errors
    /// Returns `NotFound` if the session is gone or was re-created.
    pub fn release(&self, lease: &SessionLease) -> Result<Session, StoreError> {
        let mut sessions = self.lock()?;
        match sessions.get(&lease.key) {
            Some(session) if session.epoch == lease.epoch => sessions
                .remove(&lease.key)
                .ok_or_else(|| StoreError::NotFound(lease.key.clone())),
            _ => Err(StoreError::NotFound(lease.key.clone())),
        }
    }

    /// Remove every session idle for longer than `threshold`.
    ///
    /// # Errors
    /// Returns `Internal` if the lock is poisoned.
    pub fn evict_older_than(&self, threshold: Duration) -> Result<Vec<Session>, StoreError> {
        let now = Instant::now();
        let mut sessions = self.lock()?;

        let stale: Vec<SessionKey> = sessions
            .values()
            .filter(|s| now.saturating_duration_since(s.last_activity) > threshold)
            .map(|s| s.key.clone())
            .collect();

        Ok(stale
            .into_iter()
            .filter_map(|key| sessions.remove(&key))
            .collect())
    }

    /// Remove every session.
    ///
    /// # Errors
    /// Returns `Internal` if the lock is poisoned.
    pub fn drain(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self.lock()?.drain().map(|(_, s)| s).collect())
    }

    /// Keys of live sessions, unordered.
    ///
    /// # Errors
    /// Returns `Internal` if the lock is poisoned.
    pub fn keys(&self) -> Result<Vec<SessionKey>, StoreError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    /// Number of live sessions. A poisoned lock counts as empty.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, key: &str, by: Duration) {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(key).unwrap();
        session.last_activity = session.last_activity.checked_sub(by).unwrap();
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionAccess for SessionStore {
    fn load(&self, lease: &SessionLease) -> Result<SessionSnapshot, StoreError> {
        let sessions = self.lock()?;
        match sessions.get(&lease.key) {
            Some(session) if session.epoch == lease.epoch => Ok(session.snapshot()),
            _ => Err(StoreError::NotFound(lease.key.clone())),
        }
    }

    fn record(&self, lease: &SessionLease, text: String) -> Result<(), StoreError> {
        let mut sessions = self.lock()?;
        match sessions.get_mut(&lease.key) {
            Some(session) if session.epoch == lease.epoch => {
                session.history.push(text);
                session.touch();
                Ok(())
            }
            _ => Err(StoreError::NotFound(lease.key.clone())),
        }
    }
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
