//! Session store contract and in-memory implementation.
//!
//! The store is the only shared mutable resource in the daemon. All
//! access goes through its per-id atomic update contract: handlers and
//! the reaper never cache a session and write it back later.
//!
//! # Concurrency Contract
//!
//! - `update` is atomic per dock id: the mutator runs against a copy
//!   under the write lock and the result is swapped in only on success,
//!   so concurrent heartbeat + operation calls cannot interleave into a
//!   lost update and a failed mutator leaves the stored session
//!   untouched (all-or-nothing).
//! - Cross-session reads (`list`) take no per-session locks; sessions
//!   are independent units.
//! - An unknown dock id is [`StoreError::SessionNotFound`]; callers
//!   treat it the same as an expired session, not a transient fault.

use std::collections::HashMap;
use std::sync::RwLock;

use thiserror::Error;

use crate::session::{DockSession, DockStatus, SessionError};

/// Errors from session store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No session with the given dock id. Callers must treat this as
    /// equivalent to an expired session.
    #[error("session not found")]
    SessionNotFound,

    /// A session with this dock id already exists.
    #[error("session already exists: {dock_id}")]
    DuplicateSession {
        /// The conflicting dock id.
        dock_id: String,
    },

    /// The mutator rejected the update; the stored session is
    /// unchanged.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Filter for [`SessionStore::list`].
#[derive(Debug, Default, Clone)]
pub struct SessionFilter {
    /// Only sessions belonging to this agent.
    pub agent_id: Option<String>,
    /// Only sessions in this status.
    pub status: Option<DockStatus>,
    /// Only sessions that have not reached a terminal status.
    pub live_only: bool,
}

impl SessionFilter {
    /// Match every session.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Match only non-terminal sessions.
    #[must_use]
    pub fn live() -> Self {
        Self {
            live_only: true,
            ..Self::default()
        }
    }

    /// Restrict to one agent's sessions.
    #[must_use]
    pub fn for_agent(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: Some(agent_id.into()),
            ..Self::default()
        }
    }

    fn matches(&self, session: &DockSession) -> bool {
        if let Some(agent_id) = &self.agent_id {
            if &session.agent_id != agent_id {
                return false;
            }
        }
        if let Some(status) = self.status {
            if session.status != status {
                return false;
            }
        }
        if self.live_only && session.status.is_terminal() {
            return false;
        }
        true
    }
}

/// Authoritative map of dock id to session state.
///
/// Implementations must uphold the per-id atomic update contract
/// described at module level.
pub trait SessionStore: Send + Sync {
    /// Insert a newly established session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateSession`] if the dock id is
    /// already present.
    fn create(&self, session: DockSession) -> Result<(), StoreError>;

    /// Fetch a snapshot of a session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SessionNotFound`] for unknown ids.
    fn get(&self, dock_id: &str) -> Result<DockSession, StoreError>;

    /// Atomically mutate one session.
    ///
    /// The mutator runs against a copy of the stored session; the copy
    /// replaces the original only if the mutator returns `Ok`. Returns
    /// a snapshot of the updated session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SessionNotFound`] for unknown ids, or the
    /// mutator's [`SessionError`] (stored state unchanged).
    fn update(
        &self,
        dock_id: &str,
        mutator: &mut dyn FnMut(&mut DockSession) -> Result<(), SessionError>,
    ) -> Result<DockSession, StoreError>;

    /// Snapshot all sessions matching the filter.
    fn list(&self, filter: &SessionFilter) -> Vec<DockSession>;

    /// Remove a session entirely (audit retention is the caller's
    /// concern).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::SessionNotFound`] for unknown ids.
    fn remove(&self, dock_id: &str) -> Result<DockSession, StoreError>;
}

/// In-memory session store backed by a `RwLock<HashMap>`.
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, DockSession>>,
}

impl InMemorySessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sessions currently held, terminal included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().expect("lock poisoned").len()
    }

    /// Returns `true` if the store holds no sessions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SessionStore for InMemorySessionStore {
    fn create(&self, session: DockSession) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write().expect("lock poisoned");
        if sessions.contains_key(&session.dock_id) {
            return Err(StoreError::DuplicateSession {
                dock_id: session.dock_id.clone(),
            });
        }
        sessions.insert(session.dock_id.clone(), session);
        Ok(())
    }

    fn get(&self, dock_id: &str) -> Result<DockSession, StoreError> {
        let sessions = self.sessions.read().expect("lock poisoned");
        sessions
            .get(dock_id)
            .cloned()
            .ok_or(StoreError::SessionNotFound)
    }

    fn update(
        &self,
        dock_id: &str,
        mutator: &mut dyn FnMut(&mut DockSession) -> Result<(), SessionError>,
    ) -> Result<DockSession, StoreError> {
        let mut sessions = self.sessions.write().expect("lock poisoned");
        let stored = sessions.get_mut(dock_id).ok_or(StoreError::SessionNotFound)?;

        // Mutate a copy so a failed mutator cannot leave a half-applied
        // session behind.
        let mut candidate = stored.clone();
        mutator(&mut candidate)?;
        *stored = candidate.clone();
        Ok(candidate)
    }

    fn list(&self, filter: &SessionFilter) -> Vec<DockSession> {
        let sessions = self.sessions.read().expect("lock poisoned");
        sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect()
    }

    fn remove(&self, dock_id: &str) -> Result<DockSession, StoreError> {
        let mut sessions = self.sessions.write().expect("lock poisoned");
        sessions.remove(dock_id).ok_or(StoreError::SessionNotFound)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use chrono::Utc;

    use super::*;
    use crate::session::OperationCategory;
    use crate::token::TokenIssuer;

    fn session_for(agent: &str) -> DockSession {
        let creds = TokenIssuer::new().issue().unwrap();
        DockSession::new(
            agent,
            BTreeSet::from([OperationCategory::Lifecycle]),
            serde_json::json!({}),
            creds,
            Utc::now(),
        )
    }

    #[test]
    fn create_then_get_round_trips() {
        let store = InMemorySessionStore::new();
        let session = session_for("agent-a");
        let id = session.dock_id.clone();

        store.create(session).unwrap();
        let got = store.get(&id).unwrap();
        assert_eq!(got.dock_id, id);
        assert_eq!(got.agent_id, "agent-a");
    }

    #[test]
    fn duplicate_create_is_rejected() {
        let store = InMemorySessionStore::new();
        let session = session_for("agent-a");
        let dup = session.clone();

        store.create(session).unwrap();
        assert!(matches!(
            store.create(dup),
            Err(StoreError::DuplicateSession { .. })
        ));
    }

    #[test]
    fn get_unknown_id_is_not_found() {
        let store = InMemorySessionStore::new();
        assert!(matches!(
            store.get("dock-nope"),
            Err(StoreError::SessionNotFound)
        ));
        assert!(matches!(
            store.update("dock-nope", &mut |_| Ok(())),
            Err(StoreError::SessionNotFound)
        ));
    }

    #[test]
    fn failed_mutator_leaves_session_unchanged() {
        let store = InMemorySessionStore::new();
        let session = session_for("agent-a");
        let id = session.dock_id.clone();
        store.create(session).unwrap();

        let result = store.update(&id, &mut |s| {
            s.deposits = 99;
            // Invalid transition aborts the whole update.
            s.transition(DockStatus::Pending, Utc::now())
        });
        assert!(result.is_err());
        assert_eq!(store.get(&id).unwrap().deposits, 0);
    }

    #[test]
    fn successful_mutator_is_visible_to_readers() {
        let store = InMemorySessionStore::new();
        let session = session_for("agent-a");
        let id = session.dock_id.clone();
        store.create(session).unwrap();

        let updated = store
            .update(&id, &mut |s| {
                s.deposits += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.deposits, 1);
        assert_eq!(store.get(&id).unwrap().deposits, 1);
    }

    #[test]
    fn concurrent_updates_do_not_lose_increments() {
        let store = Arc::new(InMemorySessionStore::new());
        let session = session_for("agent-a");
        let id = session.dock_id.clone();
        store.create(session).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let id = id.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    store
                        .update(&id, &mut |s| {
                            s.deposits += 1;
                            Ok(())
                        })
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.get(&id).unwrap().deposits, 800);
    }

    #[test]
    fn list_filters_by_agent_and_liveness() {
        let store = InMemorySessionStore::new();
        let a = session_for("agent-a");
        let b = session_for("agent-b");
        let b_id = b.dock_id.clone();
        store.create(a).unwrap();
        store.create(b).unwrap();

        store
            .update(&b_id, &mut |s| s.transition(DockStatus::TimedOut, Utc::now()))
            .unwrap();

        assert_eq!(store.list(&SessionFilter::all()).len(), 2);
        assert_eq!(store.list(&SessionFilter::live()).len(), 1);
        assert_eq!(store.list(&SessionFilter::for_agent("agent-b")).len(), 1);

        let timed_out = store.list(&SessionFilter {
            status: Some(DockStatus::TimedOut),
            ..SessionFilter::default()
        });
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].dock_id, b_id);
    }

    #[test]
    fn remove_returns_the_session() {
        let store = InMemorySessionStore::new();
        let session = session_for("agent-a");
        let id = session.dock_id.clone();
        store.create(session).unwrap();

        let removed = store.remove(&id).unwrap();
        assert_eq!(removed.dock_id, id);
        assert!(store.is_empty());
        assert!(matches!(store.remove(&id), Err(StoreError::SessionNotFound)));
    }
}
