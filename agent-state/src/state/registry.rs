//! In-memory table of resident agents.
//!
//! Entries are shared as `Arc<AgentEntry>`; parent/child links are ids only
//! and resolve through this table, so no entry owns another.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::store::VersionedStore;
use super::types::{AgentHierarchy, AgentId, AgentState, Checkpoint, StateTag};
use crate::error::{StateError, StateResult};

/// Parent-side bookkeeping of children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildLinks {
    /// Children created by this agent.
    pub children: BTreeSet<AgentId>,
    /// Children excluded from the completion gate.
    pub ignored: BTreeSet<AgentId>,
    /// Children whose completion has been processed.
    pub completed: BTreeSet<AgentId>,
}

/// One resident agent.
pub struct AgentEntry {
    agent_id: AgentId,
    agent_type: String,
    parent_id: Option<AgentId>,
    pub(crate) store: VersionedStore,
    checkpoints: RwLock<Vec<Checkpoint>>,
    links: RwLock<ChildLinks>,
    persisted_version: Mutex<Option<u64>>,
    /// Held across capture and backend write so persists land in version order.
    persist_lock: tokio::sync::Mutex<()>,
}

impl AgentEntry {
    /// New agent at `INITIALIZING`, version 0.
    pub fn new(agent_id: &str, agent_type: &str, parent_id: Option<AgentId>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            parent_id,
            store: VersionedStore::new(agent_id, StateTag::Initializing),
            checkpoints: RwLock::new(Vec::new()),
            links: RwLock::new(ChildLinks::default()),
            persisted_version: Mutex::new(None),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Rebuild an entry from a recovered snapshot.
    pub fn restore(state: AgentState, links: ChildLinks) -> Self {
        let persisted = Some(state.version);
        Self {
            store: VersionedStore::restore(
                state.agent_id.clone(),
                state.current_state,
                state.data,
                state.version,
                state.history,
            ),
            agent_id: state.agent_id,
            agent_type: state.agent_type,
            parent_id: state.parent_id,
            checkpoints: RwLock::new(state.checkpoints),
            links: RwLock::new(ChildLinks {
                children: state.children_ids,
                ..links
            }),
            persisted_version: Mutex::new(persisted),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn store(&self) -> &VersionedStore {
        &self.store
    }

    pub fn links(&self) -> ChildLinks {
        self.links.read().clone()
    }

    pub(crate) fn update_links<T>(&self, f: impl FnOnce(&mut ChildLinks) -> T) -> T {
        f(&mut self.links.write())
    }

    pub fn hierarchy(&self) -> AgentHierarchy {
        AgentHierarchy {
            agent_id: self.agent_id.clone(),
            parent_id: self.parent_id.clone(),
            children_ids: self.links.read().children.clone(),
        }
    }

    pub fn checkpoints(&self) -> Vec<Checkpoint> {
        self.checkpoints.read().clone()
    }

    /// Append a checkpoint built from the next sequence number.
    pub(crate) fn push_checkpoint(&self, build: impl FnOnce(u64) -> Checkpoint) -> Checkpoint {
        let mut checkpoints = self.checkpoints.write();
        let sequence = checkpoints.last().map_or(1, |c| c.sequence + 1);
        let checkpoint = build(sequence);
        checkpoints.push(checkpoint.clone());
        checkpoint
    }

    /// Most recent checkpoint carrying `name`.
    pub fn latest_checkpoint(&self, name: &str) -> Option<Checkpoint> {
        self.checkpoints
            .read()
            .iter()
            .rev()
            .find(|c| c.name == name)
            .cloned()
    }

    pub fn persisted_version(&self) -> Option<u64> {
        *self.persisted_version.lock()
    }

    pub(crate) async fn lock_persist(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.persist_lock.lock().await
    }

    /// Record a completed persist; never moves backwards.
    pub(crate) fn mark_persisted(&self, version: u64) {
        let mut persisted = self.persisted_version.lock();
        if persisted.map_or(true, |v| v < version) {
            *persisted = Some(version);
        }
    }

    /// Full aggregate view. Data, state, version and history are captured
    /// together; checkpoints and links are append-only side tables.
    pub fn to_state(&self) -> AgentState {
        let (snapshot, history) = self.store.read_with_history();
        AgentState {
            agent_id: self.agent_id.clone(),
            agent_type: self.agent_type.clone(),
            current_state: snapshot.current_state.clone(),
            data: snapshot.data.clone(),
            version: snapshot.version,
            history,
            parent_id: self.parent_id.clone(),
            children_ids: self.links.read().children.clone(),
            checkpoints: self.checkpoints(),
        }
    }
}

impl std::fmt::Debug for AgentEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentEntry")
            .field("agent_id", &self.agent_id)
            .field("agent_type", &self.agent_type)
            .field("parent_id", &self.parent_id)
            .field("store", &self.store)
            .finish()
    }
}

/// Table of resident agents keyed by id.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, Arc<AgentEntry>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, agent_id: &str) -> StateResult<Arc<AgentEntry>> {
        self.agents
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| StateError::agent_not_found(agent_id))
    }

    pub fn try_get(&self, agent_id: &str) -> Option<Arc<AgentEntry>> {
        self.agents.read().get(agent_id).cloned()
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.read().contains_key(agent_id)
    }

    /// Register a new agent; fails if the id is taken.
    pub fn insert(&self, entry: AgentEntry) -> StateResult<Arc<AgentEntry>> {
        let mut agents = self.agents.write();
        if agents.contains_key(entry.agent_id()) {
            return Err(StateError::AgentExists {
                agent_id: entry.agent_id().to_string(),
            });
        }
        let entry = Arc::new(entry);
        agents.insert(entry.agent_id().to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    pub fn remove(&self, agent_id: &str) -> Option<Arc<AgentEntry>> {
        self.agents.write().remove(agent_id)
    }

    pub fn ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_insert_rejects_duplicates() {
        let registry = AgentRegistry::new();
        registry
            .insert(AgentEntry::new("a1", "pipeline", None))
            .unwrap();
        let err = registry
            .insert(AgentEntry::new("a1", "pipeline", None))
            .unwrap_err();
        assert!(matches!(err, StateError::AgentExists { .. }));
        assert!(matches!(
            registry.get("missing"),
            Err(StateError::AgentNotFound { .. })
        ));
    }

    #[test]
    fn test_checkpoint_sequences_increase() {
        let entry = AgentEntry::new("a1", "pipeline", None);
        for name in ["same", "same", "other"] {
            entry.push_checkpoint(|sequence| Checkpoint {
                name: name.to_string(),
                sequence,
                created_at: Utc::now(),
                version: 0,
                data_snapshot: Default::default(),
                state_snapshot: StateTag::Initializing,
            });
        }
        let seqs: Vec<u64> = entry.checkpoints().iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(entry.latest_checkpoint("same").unwrap().sequence, 2);
        assert!(entry.latest_checkpoint("none").is_none());
    }

    #[test]
    fn test_persisted_version_is_monotonic() {
        let entry = AgentEntry::new("a1", "pipeline", None);
        assert_eq!(entry.persisted_version(), None);
        entry.mark_persisted(4);
        entry.mark_persisted(2);
        assert_eq!(entry.persisted_version(), Some(4));
    }

    #[test]
    fn test_restore_keeps_logical_state() {
        let entry = AgentEntry::new("a1", "pipeline", Some("root".into()));
        entry.update_links(|links| {
            links.children.insert("c1".into());
        });
        let state = entry.to_state();

        let restored = AgentEntry::restore(state.clone(), ChildLinks::default());
        assert_eq!(restored.to_state(), state);
        assert_eq!(restored.persisted_version(), Some(0));
        assert_eq!(restored.hierarchy().parent_id.as_deref(), Some("root"));
    }
}
