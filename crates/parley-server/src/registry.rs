use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use parley_core::{SessionId, SERVER_SENDER};

use crate::error::SessionError;
use crate::session::Session;

#[derive(Default)]
struct Members {
    sessions: HashMap<SessionId, Arc<Session>>,
    /// Client identifier (remote address or claimed sender name) → session.
    /// Every value is also in `sessions`.
    identifiers: HashMap<String, Arc<Session>>,
    /// Set by [`SessionRegistry::close`]; no session joins afterwards.
    closed: bool,
}

/// The set of live sessions plus the identifier index.
///
/// One lock covers both maps so they never disagree. It is only held for
/// bookkeeping: never across I/O or an `.await`.
#[derive(Default)]
pub struct SessionRegistry {
    members: Mutex<Members>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its address identifier. Returns false if it
    /// was already registered.
    pub fn insert(&self, session: Arc<Session>) -> bool {
        self.insert_bounded(session, usize::MAX).is_ok()
    }

    /// Register a session unless `max` sessions are already present or the
    /// registry has been closed. Returns the new session count.
    pub fn insert_bounded(&self, session: Arc<Session>, max: usize) -> Result<usize, SessionError> {
        let mut members = self.members.lock();
        if members.closed {
            return Err(SessionError::ShuttingDown);
        }
        if members.sessions.contains_key(session.id()) {
            return Err(SessionError::AlreadyRegistered);
        }
        if members.sessions.len() >= max {
            return Err(SessionError::RegistryFull { max });
        }
        members
            .identifiers
            .insert(session.client_id().to_string(), Arc::clone(&session));
        members.sessions.insert(session.id().clone(), session);
        Ok(members.sessions.len())
    }

    /// Unregister a session and every identifier pointing at it.
    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        let mut members = self.members.lock();
        let removed = members.sessions.remove(id)?;
        members.identifiers.retain(|_, s| s.id() != id);
        Some(removed)
    }

    /// Unregister every session matching `predicate` in one critical section.
    /// The predicate must not block.
    pub fn remove_if(&self, predicate: impl Fn(&Session) -> bool) -> Vec<Arc<Session>> {
        let mut members = self.members.lock();
        let doomed: Vec<SessionId> = members
            .sessions
            .values()
            .filter(|s| predicate(s))
            .map(|s| s.id().clone())
            .collect();
        if doomed.is_empty() {
            return Vec::new();
        }
        let removed: Vec<Arc<Session>> = doomed
            .iter()
            .filter_map(|id| members.sessions.remove(id))
            .collect();
        members
            .identifiers
            .retain(|_, s| !doomed.contains(s.id()));
        removed
    }

    pub fn find(&self, identifier: &str) -> Option<Arc<Session>> {
        self.members.lock().identifiers.get(identifier).cloned()
    }

    /// Bind an extra identifier (a sender name) to a registered session.
    ///
    /// The first live session to claim a name keeps it; returns false if the
    /// name belongs to another session, is the server's own sender name, or
    /// `session` is not registered.
    pub fn associate(&self, identifier: &str, session: &Arc<Session>) -> bool {
        if identifier == SERVER_SENDER {
            return false;
        }
        let mut members = self.members.lock();
        if !members.sessions.contains_key(session.id()) {
            return false;
        }
        match members.identifiers.get(identifier) {
            Some(existing) => existing.id() == session.id(),
            None => {
                members
                    .identifiers
                    .insert(identifier.to_string(), Arc::clone(session));
                true
            }
        }
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.members.lock().sessions.contains_key(id)
    }

    /// Point-in-time copy of the membership, for iterating without the lock.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.members.lock().sessions.values().cloned().collect()
    }

    /// Refuse further inserts and hand back everyone currently registered.
    /// Sessions stay registered until they disconnect.
    pub fn close(&self) -> Vec<Arc<Session>> {
        let mut members = self.members.lock();
        members.closed = true;
        members.sessions.values().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.members.lock().closed
    }

    /// Remote addresses of all registered sessions.
    pub fn active_connections(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .snapshot()
            .iter()
            .map(|s| s.client_id().to_string())
            .collect();
        addrs.sort();
        addrs
    }

    pub fn len(&self) -> usize {
        self.members.lock().sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
