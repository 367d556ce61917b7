//! In-memory registry of live sessions.

use std::{
    collections::HashMap,
    sync::{
        RwLock,
        atomic::{AtomicI64, Ordering},
    },
};

use entity_bus_core::SessionId;

use crate::{SessionError, session::SessionPtr};

struct Entry {
    session: SessionPtr,
    verified: bool,
    name: String,
}

/// Live sessions of one session manager, keyed by id.
pub struct SessionList {
    sessions: RwLock<HashMap<SessionId, Entry>>,
    next_session_id: AtomicI64,
}

impl SessionList {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicI64::new(1),
        }
    }

    /// Hand out the next session id.
    pub fn allocate_id(&self) -> SessionId {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Add or replace a session.
    ///
    /// # Errors
    /// Returns error if the registry lock is poisoned.
    pub fn add(&self, session: SessionPtr, verified: bool) -> Result<(), SessionError> {
        let id = session.session_id();
        self.sessions
            .write()
            .map_err(|e| SessionError::Internal(e.to_string()))?
            .insert(
                id,
                Entry {
                    session,
                    verified,
                    name: String::new(),
                },
            );
        Ok(())
    }

    pub fn remove(&self, id: SessionId) -> Option<SessionPtr> {
        match self.sessions.write() {
            Ok(mut sessions) => sessions.remove(&id).map(|entry| entry.session),
            Err(e) => {
                tracing::error!("session list poisoned: {e}");
                None
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: SessionId) -> Option<SessionPtr> {
        self.sessions
            .read()
            .ok()?
            .get(&id)
            .map(|entry| entry.session.clone())
    }

    #[must_use]
    pub fn all(&self) -> Vec<SessionPtr> {
        self.sessions
            .read()
            .map(|sessions| sessions.values().map(|e| e.session.clone()).collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_verified(&self, id: SessionId, verified: bool) {
        if let Ok(mut sessions) = self.sessions.write() {
            if let Some(entry) = sessions.get_mut(&id) {
                entry.verified = verified;
            }
        }
    }

    /// Name a session so a later connection can rejoin it.
    pub fn set_session_name(&self, id: SessionId, name: &str) {
        if let Ok(mut sessions) = self.sessions.write() {
            if let Some(entry) = sessions.get_mut(&id) {
                entry.name = name.to_owned();
            }
        }
    }

    /// Find a verified session carrying `name`.
    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<SessionPtr> {
        if name.is_empty() {
            return None;
        }
        self.sessions
            .read()
            .ok()?
            .values()
            .find(|entry| entry.verified && entry.name == name)
            .map(|entry| entry.session.clone())
    }
}

impl Default for SessionList {
    fn default() -> Self {
        Self::new()
    }
}
