//! Versioned in-memory store for one agent.
//!
//! Holds the agent's `data` and `current_state` behind a monotonic version
//! counter. Readers clone an `Arc` of the last committed snapshot and are
//! never blocked by a mutation in progress; writers serialize on a commit
//! mutex and apply their mutation to a working copy, so a failed mutation
//! leaves nothing behind.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::types::{AgentId, StateTag, StateTransition};
use super::value::StateData;
use crate::error::{StateError, StateResult};
use crate::lock::LockHandle;

/// Consistent point-in-time copy of an agent's mutable state.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreSnapshot {
    pub current_state: StateTag,
    pub data: StateData,
    pub version: u64,
}

/// Working copy handed to internal commits.
///
/// Only crate code may move `current_state`; public writers see `data` alone.
#[derive(Debug)]
pub(crate) struct WorkingCopy {
    pub data: StateData,
    pub current_state: StateTag,
    pending_history: Vec<StateTransition>,
}

impl WorkingCopy {
    /// Queue a history entry to land atomically with the commit.
    pub fn record(&mut self, transition: StateTransition) {
        self.pending_history.push(transition);
    }
}

/// Concurrency check applied at commit time.
#[derive(Debug, Clone, Copy)]
pub(crate) enum CommitGuard<'a> {
    /// Optimistic CAS: commit only if the version still matches.
    Expected(u64),
    /// Caller proves it holds a live exclusive lock.
    Lock(&'a LockHandle),
}

struct Committed {
    snapshot: Arc<StoreSnapshot>,
    history: Vec<StateTransition>,
}

/// Versioned store for a single agent.
pub struct VersionedStore {
    agent_id: AgentId,
    inner: RwLock<Committed>,
    commit_lock: Mutex<()>,
}

impl VersionedStore {
    /// Fresh store at version 0.
    pub fn new(agent_id: impl Into<AgentId>, initial_state: StateTag) -> Self {
        Self::restore(agent_id, initial_state, StateData::new(), 0, Vec::new())
    }

    /// Rebuild a store from persisted parts.
    pub fn restore(
        agent_id: impl Into<AgentId>,
        current_state: StateTag,
        data: StateData,
        version: u64,
        history: Vec<StateTransition>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            inner: RwLock::new(Committed {
                snapshot: Arc::new(StoreSnapshot {
                    current_state,
                    data,
                    version,
                }),
                history,
            }),
            commit_lock: Mutex::new(()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Last committed snapshot. Never torn; at most one in-flight write stale.
    pub fn read(&self) -> Arc<StoreSnapshot> {
        Arc::clone(&self.inner.read().snapshot)
    }

    /// Snapshot and history captured together.
    pub fn read_with_history(&self) -> (Arc<StoreSnapshot>, Vec<StateTransition>) {
        let inner = self.inner.read();
        (Arc::clone(&inner.snapshot), inner.history.clone())
    }

    pub fn version(&self) -> u64 {
        self.inner.read().snapshot.version
    }

    pub fn current_state(&self) -> StateTag {
        self.inner.read().snapshot.current_state.clone()
    }

    /// Append-only transition history.
    pub fn history(&self) -> Vec<StateTransition> {
        self.inner.read().history.clone()
    }

    /// Compare-and-swap write of `data`.
    ///
    /// Fails fast with `VersionConflict` when `expected_version` is stale;
    /// never blocks on agent locks.
    pub fn write<F>(&self, expected_version: u64, mutation: F) -> StateResult<u64>
    where
        F: FnOnce(&mut StateData) -> StateResult<()>,
    {
        self.commit(CommitGuard::Expected(expected_version), |working| {
            mutation(&mut working.data)
        })
        .map(|(version, ())| version)
    }

    /// Write `data` while holding an exclusive lock; skips the version check.
    pub fn write_under_lock<F>(&self, handle: &LockHandle, mutation: F) -> StateResult<u64>
    where
        F: FnOnce(&mut StateData) -> StateResult<()>,
    {
        self.commit(CommitGuard::Lock(handle), |working| {
            mutation(&mut working.data)
        })
        .map(|(version, ())| version)
    }

    /// Apply `mutation` to a working copy and publish it as the next version.
    pub(crate) fn commit<F, T>(&self, guard: CommitGuard<'_>, mutation: F) -> StateResult<(u64, T)>
    where
        F: FnOnce(&mut WorkingCopy) -> StateResult<T>,
    {
        let _commit = self.commit_lock.lock();
        let current = self.read();

        match guard {
            CommitGuard::Expected(expected) if expected != current.version => {
                return Err(StateError::VersionConflict {
                    agent_id: self.agent_id.clone(),
                    expected,
                    actual: current.version,
                });
            }
            CommitGuard::Lock(handle) if !handle.covers_exclusive(&self.agent_id) => {
                return Err(StateError::LockNotHeld {
                    agent_id: self.agent_id.clone(),
                    operation_id: handle.operation_id().to_string(),
                });
            }
            _ => {}
        }

        let mut working = WorkingCopy {
            data: current.data.clone(),
            current_state: current.current_state.clone(),
            pending_history: Vec::new(),
        };
        let output = mutation(&mut working)?;
        if let Some(key) = working
            .data
            .iter()
            .find_map(|(key, value)| (!value.is_finite()).then_some(key))
        {
            return Err(StateError::validation(format!(
                "field '{}' holds a NaN or infinite float",
                key
            )));
        }

        let version = current.version + 1;
        let next = Arc::new(StoreSnapshot {
            current_state: working.current_state,
            data: working.data,
            version,
        });

        let mut inner = self.inner.write();
        inner.snapshot = next;
        inner.history.extend(working.pending_history);
        drop(inner);

        debug!(agent_id = %self.agent_id, version, "Committed agent state");
        Ok((version, output))
    }
}

impl std::fmt::Debug for VersionedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.read();
        f.debug_struct("VersionedStore")
            .field("agent_id", &self.agent_id)
            .field("current_state", &snapshot.current_state)
            .field("version", &snapshot.version)
            .finish()
    }
}
