//! Session bookkeeping shared by every backend.
//!
//! Each session moves `Created -> Active -> Released`. Releasing removes the entry, so a
//! released ID is indistinguishable from one never issued: a late `invoke` on it reports
//! an invalid session, and a long-running process does not accumulate dead entries.

use crate::SessionId;
use crate::error::engine::EngineError;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use log::trace;

/// State of a session the pool still tracks. Released sessions have no state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// ID reserved, backend resource still being set up.
    Created,
    Active,
}

#[derive(Debug)]
struct PoolEntry<R> {
    state: SessionState,
    resource: Option<R>,
}

/// Maps session IDs to the backend resource that serves them.
///
/// `R` is cloned out on checkout, so it is normally a cheap handle such as an `Arc`
/// around a mutex-guarded VM instance.
#[derive(Debug)]
pub struct InstancePool<R> {
    entries: Mutex<HashMap<SessionId, PoolEntry<R>>>,
    next_id: AtomicU64,
}

impl<R> Default for InstancePool<R> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<R: Clone> InstancePool<R> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<SessionId, PoolEntry<R>>>, EngineError> {
        self.entries
            .lock()
            .map_err(|_| EngineError::invariant("instance pool lock poisoned"))
    }

    /// Reserve the next pool-assigned ID (monotonic from 0) in the `Created` state.
    pub fn reserve_next(&self) -> Result<SessionId, EngineError> {
        let mut entries = self.entries()?;
        let session_id = self.next_id.fetch_add(1, Ordering::SeqCst);
        entries.insert(
            session_id,
            PoolEntry {
                state: SessionState::Created,
                resource: None,
            },
        );
        trace!("Reserved session {session_id}");
        Ok(session_id)
    }

    /// Reserve an engine-assigned ID. Engines may reuse an ID once it was released.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvariantViolation`] if the ID is still live.
    pub fn reserve(&self, session_id: SessionId) -> Result<(), EngineError> {
        let mut entries = self.entries()?;

        if let Some(existing) = entries.get(&session_id) {
            return Err(EngineError::invariant(format!(
                "engine reissued session {session_id} while it is still {:?}",
                existing.state
            )));
        }

        entries.insert(
            session_id,
            PoolEntry {
                state: SessionState::Created,
                resource: None,
            },
        );
        Ok(())
    }

    /// `Created -> Active`, attaching the backend resource.
    pub fn activate(&self, session_id: SessionId, resource: R) -> Result<(), EngineError> {
        let mut entries = self.entries()?;
        match entries.get_mut(&session_id) {
            Some(entry) if entry.state == SessionState::Created => {
                entry.state = SessionState::Active;
                entry.resource = Some(resource);
                Ok(())
            }
            Some(entry) => Err(EngineError::invariant(format!(
                "cannot activate session {session_id} from {:?}",
                entry.state
            ))),
            None => Err(EngineError::invalid_session(session_id)),
        }
    }

    /// Resource for an active session.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidSession`] for unknown, unfinished or released IDs.
    #[track_caller]
    pub fn checkout(&self, session_id: SessionId) -> Result<R, EngineError> {
        let entries = self.entries()?;
        match entries.get(&session_id) {
            Some(PoolEntry {
                state: SessionState::Active,
                resource: Some(resource),
            }) => Ok(resource.clone()),
            _ => Err(EngineError::invalid_session(session_id)),
        }
    }

    /// `Active -> Released`, forgetting the session. Returns the detached resource the
    /// first time only, so repeated releases are no-ops.
    pub fn release(&self, session_id: SessionId) -> Result<Option<R>, EngineError> {
        let mut entries = self.entries()?;
        match entries.remove(&session_id) {
            Some(entry) => {
                trace!("Released session {session_id}");
                Ok(entry.resource)
            }
            None => Ok(None),
        }
    }

    /// `None` for released and unknown IDs.
    pub fn state(&self, session_id: SessionId) -> Option<SessionState> {
        self.entries()
            .ok()
            .and_then(|entries| entries.get(&session_id).map(|entry| entry.state))
    }

    pub fn active_count(&self) -> usize {
        self.entries()
            .map(|entries| {
                entries
                    .values()
                    .filter(|entry| entry.state == SessionState::Active)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Entries currently tracked, in any state.
    pub fn len(&self) -> usize {
        self.entries().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
