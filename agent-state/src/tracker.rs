//! `AgentStateTracker`: the façade external callers use.
//!
//! One tracker is constructed per process or service and shared by handle
//! (`Arc<AgentStateTracker>`). It owns the agent registry and wires the
//! validator, lock manager, checkpoint manager, persistence adapter,
//! hierarchy coordinator, read cache and event bus together.
//!
//! # Write paths
//!
//! ```text
//! locking = Enabled   acquire exclusive → commit under lock → release
//! locking = Disabled  read version → CAS commit → retry on conflict
//!                     (at most max_cas_retries attempts)
//! compare_and_update  single CAS attempt, never blocks
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{CacheStats, StateCache};
use crate::checkpoint::{CheckpointManager, Rollback};
use crate::config::{LockingMode, TrackerConfig};
use crate::error::{StateError, StateResult};
use crate::events::{EventBus, LockAbortReason, SharedEventBus, StateEvent};
use crate::hierarchy::{ChildCompletion, HierarchyCoordinator, ParentNotification, TransitionOutcome};
use crate::lock::{LockHandle, LockManager, LockMode};
use crate::persistence::{DurableBackend, MemoryBackend, PersistReport, PersistenceAdapter};
use crate::state::store::CommitGuard;
use crate::state::{
    apply_all, AgentEntry, AgentHierarchy, AgentId, AgentRegistry, AgentState, CheckpointId,
    CheckpointMeta, FieldMutation, OperationId, StateData, StateTag, StateTransition, Value,
};
use crate::transition::{StateTransitionValidator, TransitionTable};

/// Façade over every agent-state operation.
pub struct AgentStateTracker {
    config: TrackerConfig,
    validator: Arc<StateTransitionValidator>,
    registry: AgentRegistry,
    locks: Arc<LockManager>,
    checkpoints: CheckpointManager,
    persistence: PersistenceAdapter,
    hierarchy: HierarchyCoordinator,
    cache: Option<StateCache>,
    events: SharedEventBus,
}

impl AgentStateTracker {
    /// Build a tracker over `table` and `backend`.
    pub fn new(
        config: TrackerConfig,
        table: TransitionTable,
        backend: Arc<dyn DurableBackend>,
    ) -> StateResult<Self> {
        config.validate()?;
        let validator = Arc::new(StateTransitionValidator::new(table)?);
        let locks = Arc::new(LockManager::new(config.lock_lease()));

        info!(
            locking = ?config.locking,
            lock_timeout_ms = config.lock_timeout_ms,
            cache = config.cache.is_some(),
            compression = config.compression.is_some(),
            agent_types = ?validator.table().agent_types(),
            "Agent state tracker initialized"
        );

        Ok(Self {
            checkpoints: CheckpointManager::new(Arc::clone(&locks), config.lock_timeout()),
            persistence: PersistenceAdapter::new(
                backend,
                config.persistence.clone(),
                config.compression.clone(),
            ),
            hierarchy: HierarchyCoordinator::new(Arc::clone(&validator)),
            cache: config.cache.clone().map(StateCache::new),
            events: EventBus::with_capacity(config.event_capacity).shared(),
            registry: AgentRegistry::new(),
            validator,
            locks,
            config,
        })
    }

    /// Tracker with the standard `pipeline` table and an in-memory backend.
    pub fn in_memory(config: TrackerConfig) -> StateResult<Self> {
        Self::new(
            config,
            TransitionTable::standard(),
            Arc::new(MemoryBackend::new()),
        )
    }

    /// Create a shared reference to this tracker
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn validator(&self) -> &StateTransitionValidator {
        &self.validator
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Fresh correlation token for one logical operation.
    pub fn new_operation_id() -> OperationId {
        uuid::Uuid::new_v4().to_string()
    }

    /// Subscribe to state events.
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub fn event_bus(&self) -> &SharedEventBus {
        &self.events
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Register a new agent at `INITIALIZING`, version 0.
    pub fn create_agent(
        &self,
        agent_id: &str,
        agent_type: &str,
        parent_id: Option<&str>,
    ) -> StateResult<AgentState> {
        if agent_id.trim().is_empty() {
            return Err(StateError::validation("agent_id must not be empty"));
        }
        if !self.validator.knows(agent_type) {
            return Err(StateError::validation(format!(
                "unknown agent type '{}'",
                agent_type
            )));
        }
        let parent = parent_id.map(|id| self.registry.get(id)).transpose()?;

        let entry = self.registry.insert(AgentEntry::new(
            agent_id,
            agent_type,
            parent_id.map(str::to_string),
        ))?;
        if let Some(parent) = &parent {
            parent.update_links(|links| {
                links.children.insert(agent_id.to_string());
            });
            self.invalidate(parent.agent_id());
        }

        info!(agent_id, agent_type, parent_id = ?parent_id, "Agent created");
        self.events.publish(StateEvent::AgentCreated {
            agent_id: agent_id.to_string(),
            agent_type: agent_type.to_string(),
            parent_id: parent_id.map(str::to_string),
            timestamp: Utc::now(),
        });
        Ok(entry.to_state())
    }

    /// Full snapshot of a resident agent.
    pub fn get_agent_state(&self, agent_id: &str) -> StateResult<AgentState> {
        Ok(self.registry.get(agent_id)?.to_state())
    }

    /// Ids of resident agents, sorted.
    pub fn list_agents(&self) -> Vec<AgentId> {
        self.registry.ids()
    }

    /// Drop a terminal agent whose latest version is persisted.
    pub fn evict_agent(&self, agent_id: &str) -> StateResult<()> {
        let entry = self.registry.get(agent_id)?;
        let snapshot = entry.store().read();

        if !self
            .validator
            .is_terminal(entry.agent_type(), &snapshot.current_state)
        {
            return Err(StateError::validation(format!(
                "agent {} is in non-terminal state {}",
                agent_id, snapshot.current_state
            )));
        }
        if entry.persisted_version() != Some(snapshot.version) {
            return Err(StateError::validation(format!(
                "agent {} v{} has not been persisted",
                agent_id, snapshot.version
            )));
        }

        self.registry.remove(agent_id);
        self.invalidate(agent_id);
        info!(agent_id, version = snapshot.version, "Agent evicted");
        self.events.publish(StateEvent::Evicted {
            agent_id: agent_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(())
    }

    // =========================================================================
    // Guarded commits
    // =========================================================================

    fn invalidate(&self, agent_id: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(agent_id);
        }
    }

    fn note_lock_abort(&self, agent_id: &str, operation_id: &str, err: &StateError) {
        let reason = match err {
            StateError::Deadlock { .. } => LockAbortReason::Deadlock,
            StateError::LockTimeout { .. } => LockAbortReason::Timeout,
            _ => return,
        };
        self.events.publish(StateEvent::LockAborted {
            agent_id: agent_id.to_string(),
            operation_id: operation_id.to_string(),
            reason,
            timestamp: Utc::now(),
        });
    }

    /// Run `commit` under the configured concurrency policy.
    async fn guarded<T, F>(&self, entry: &AgentEntry, operation_id: &str, commit: F) -> StateResult<T>
    where
        F: Fn(CommitGuard<'_>) -> StateResult<T>,
    {
        match self.config.locking {
            LockingMode::Enabled => {
                let handle = self
                    .acquire(
                        entry.agent_id(),
                        LockMode::Exclusive,
                        operation_id,
                        self.config.lock_timeout(),
                    )
                    .await?;
                let result = commit(CommitGuard::Lock(&handle));
                self.locks.release(&handle);
                result
            }
            LockingMode::Disabled => {
                let attempts = self.config.max_cas_retries;
                let mut attempt = 1;
                loop {
                    let expected = entry.store().version();
                    match commit(CommitGuard::Expected(expected)) {
                        Err(StateError::VersionConflict { .. }) if attempt < attempts => {
                            debug!(
                                agent_id = %entry.agent_id(),
                                operation_id,
                                attempt,
                                "CAS conflict, retrying"
                            );
                            attempt += 1;
                            tokio::task::yield_now().await;
                        }
                        result => return result,
                    }
                }
            }
        }
    }

    async fn acquire(
        &self,
        agent_id: &str,
        mode: LockMode,
        operation_id: &str,
        timeout: Duration,
    ) -> StateResult<LockHandle> {
        self.locks
            .acquire(agent_id, mode, operation_id, timeout)
            .await
            .inspect_err(|e| self.note_lock_abort(agent_id, operation_id, e))
    }

    // =========================================================================
    // Transitions and data
    // =========================================================================

    /// Validated transition of `agent_id` to `to`.
    pub async fn transition_agent_state(
        &self,
        agent_id: &str,
        to: StateTag,
        operation_id: &str,
    ) -> StateResult<TransitionOutcome> {
        self.transition_agent_state_with(agent_id, to, operation_id, false)
            .await
    }

    /// Transition, optionally queueing a notification for the parent.
    pub async fn transition_agent_state_with(
        &self,
        agent_id: &str,
        to: StateTag,
        operation_id: &str,
        notify_parent: bool,
    ) -> StateResult<TransitionOutcome> {
        let entry = self.registry.get(agent_id)?;
        let outcome = self
            .guarded(&entry, operation_id, |guard| {
                self.hierarchy.transition(
                    &self.registry,
                    &entry,
                    &to,
                    operation_id,
                    guard,
                    notify_parent,
                )
            })
            .await?;

        self.invalidate(agent_id);
        self.events.publish(StateEvent::Transitioned {
            agent_id: agent_id.to_string(),
            from: outcome.from.clone(),
            to: outcome.to.clone(),
            version: outcome.version,
            operation_id: operation_id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(outcome)
    }

    /// Apply one field mutation. Returns the new version.
    pub async fn update_agent_state_data(
        &self,
        agent_id: &str,
        mutation: FieldMutation,
        operation_id: &str,
    ) -> StateResult<u64> {
        self.batch_update_agent_state(agent_id, std::slice::from_ref(&mutation), operation_id)
            .await
    }

    /// Apply `mutations` as one commit: all of them or none.
    pub async fn batch_update_agent_state(
        &self,
        agent_id: &str,
        mutations: &[FieldMutation],
        operation_id: &str,
    ) -> StateResult<u64> {
        let keys = mutations.iter().map(|m| m.key().to_string()).collect();
        self.modify(agent_id, operation_id, keys, |data| {
            *data = apply_all(data, mutations)?;
            Ok(())
        })
        .await
    }

    /// Apply an arbitrary mutation closure under the configured policy.
    ///
    /// The closure may run more than once when locking is disabled.
    pub async fn update_agent_state_with<F>(
        &self,
        agent_id: &str,
        operation_id: &str,
        mutation: F,
    ) -> StateResult<u64>
    where
        F: Fn(&mut StateData) -> StateResult<()>,
    {
        self.modify(agent_id, operation_id, Vec::new(), mutation)
            .await
    }

    async fn modify<F>(
        &self,
        agent_id: &str,
        operation_id: &str,
        keys: Vec<String>,
        mutation: F,
    ) -> StateResult<u64>
    where
        F: Fn(&mut StateData) -> StateResult<()>,
    {
        let entry = self.registry.get(agent_id)?;
        let (version, ()) = self
            .guarded(&entry, operation_id, |guard| {
                entry
                    .store()
                    .commit(guard, |working| mutation(&mut working.data))
            })
            .await?;
        self.data_updated(agent_id, version, keys, operation_id);
        Ok(version)
    }

    fn data_updated(&self, agent_id: &str, version: u64, keys: Vec<String>, operation_id: &str) {
        self.invalidate(agent_id);
        debug!(agent_id, version, operation_id, "Agent data updated");
        self.events.publish(StateEvent::DataUpdated {
            agent_id: agent_id.to_string(),
            version,
            keys,
            operation_id: operation_id.to_string(),
            timestamp: Utc::now(),
        });
    }

    /// Single optimistic attempt against `expected_version`. Never blocks
    /// and never retries.
    pub fn compare_and_update_agent_state(
        &self,
        agent_id: &str,
        expected_version: u64,
        mutations: &[FieldMutation],
        operation_id: &str,
    ) -> StateResult<u64> {
        let entry = self.registry.get(agent_id)?;
        let version = entry.store().write(expected_version, |data| {
            *data = apply_all(data, mutations)?;
            Ok(())
        })?;
        let keys = mutations.iter().map(|m| m.key().to_string()).collect();
        self.data_updated(agent_id, version, keys, operation_id);
        Ok(version)
    }

    // =========================================================================
    // Locks
    // =========================================================================

    /// Acquire a lock on a resident agent; `timeout` defaults to the config.
    ///
    /// On `Deadlock` or `LockTimeout` every lock held by `operation_id` has
    /// been released.
    pub async fn acquire_agent_lock(
        &self,
        agent_id: &str,
        mode: LockMode,
        operation_id: &str,
        timeout: Option<Duration>,
    ) -> StateResult<LockHandle> {
        if !self.registry.contains(agent_id) {
            return Err(StateError::agent_not_found(agent_id));
        }
        self.acquire(
            agent_id,
            mode,
            operation_id,
            timeout.unwrap_or_else(|| self.config.lock_timeout()),
        )
        .await
    }

    /// Release a lock. Idempotent.
    pub fn release_agent_lock(&self, handle: &LockHandle) {
        self.locks.release(handle);
    }

    /// Write data with a caller-held exclusive lock.
    pub fn update_agent_state_under_lock(
        &self,
        handle: &LockHandle,
        mutations: &[FieldMutation],
    ) -> StateResult<u64> {
        let entry = self.registry.get(handle.agent_id())?;
        let version = entry.store().write_under_lock(handle, |data| {
            *data = apply_all(data, mutations)?;
            Ok(())
        })?;
        let keys = mutations.iter().map(|m| m.key().to_string()).collect();
        self.data_updated(handle.agent_id(), version, keys, handle.operation_id());
        Ok(version)
    }

    // =========================================================================
    // Checkpoints
    // =========================================================================

    pub async fn create_checkpoint(
        &self,
        agent_id: &str,
        name: &str,
        operation_id: &str,
    ) -> StateResult<CheckpointId> {
        let entry = self.registry.get(agent_id)?;
        let id = self
            .checkpoints
            .create_checkpoint(&entry, name, operation_id)
            .await
            .inspect_err(|e| self.note_lock_abort(agent_id, operation_id, e))?;

        self.events.publish(StateEvent::CheckpointCreated {
            agent_id: agent_id.to_string(),
            name: id.name.clone(),
            sequence: id.sequence,
            timestamp: Utc::now(),
        });
        Ok(id)
    }

    pub async fn rollback_to_checkpoint(
        &self,
        agent_id: &str,
        name: &str,
        operation_id: &str,
    ) -> StateResult<Rollback> {
        let entry = self.registry.get(agent_id)?;
        let rollback = self
            .checkpoints
            .rollback_to_checkpoint(&entry, name, operation_id)
            .await
            .inspect_err(|e| self.note_lock_abort(agent_id, operation_id, e))?;

        self.invalidate(agent_id);
        self.events.publish(StateEvent::RolledBack {
            agent_id: agent_id.to_string(),
            checkpoint: rollback.checkpoint.name.clone(),
            sequence: rollback.checkpoint.sequence,
            version: rollback.version,
            timestamp: Utc::now(),
        });
        Ok(rollback)
    }

    pub fn get_checkpoint_history(&self, agent_id: &str) -> StateResult<Vec<CheckpointMeta>> {
        let entry = self.registry.get(agent_id)?;
        Ok(self.checkpoints.get_checkpoint_history(&entry))
    }

    pub fn get_state_history(&self, agent_id: &str) -> StateResult<Vec<StateTransition>> {
        Ok(self.registry.get(agent_id)?.store().history())
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Write the agent's current snapshot to the backend.
    ///
    /// A failure leaves the in-memory agent untouched; the tracker keeps
    /// working without the backend.
    pub async fn persist_agent_state(&self, agent_id: &str) -> StateResult<PersistReport> {
        let entry = self.registry.get(agent_id)?;
        let report = self.persistence.persist(&entry).await?;
        self.persisted(&report);
        Ok(report)
    }

    fn persisted(&self, report: &PersistReport) {
        self.events.publish(StateEvent::Persisted {
            agent_id: report.agent_id.clone(),
            version: report.version,
            stored_bytes: report.stored_bytes,
            compressed: report.compressed,
            timestamp: Utc::now(),
        });
    }

    /// Reload an agent from its last snapshot and make it resident.
    ///
    /// Fails with `AgentExists` while an instance is resident.
    pub async fn recover_agent_state(&self, agent_id: &str) -> StateResult<AgentState> {
        if self.registry.contains(agent_id) {
            return Err(StateError::AgentExists {
                agent_id: agent_id.to_string(),
            });
        }

        let snapshot = self.persistence.recover(agent_id).await?;
        if !self.validator.knows(&snapshot.state.agent_type) {
            return Err(StateError::validation(format!(
                "recovered agent {} has unknown type '{}'",
                agent_id, snapshot.state.agent_type
            )));
        }

        let links = snapshot.links();
        let entry = AgentEntry::restore(snapshot.state, links);
        let entry = self.registry.insert(entry)?;
        if let Some(parent) = entry.parent_id().and_then(|id| self.registry.try_get(id)) {
            parent.update_links(|links| {
                links.children.insert(agent_id.to_string());
            });
        }
        self.invalidate(agent_id);

        let state = entry.to_state();
        self.events.publish(StateEvent::Recovered {
            agent_id: agent_id.to_string(),
            version: state.version,
            timestamp: Utc::now(),
        });
        Ok(state)
    }

    // =========================================================================
    // Hierarchy
    // =========================================================================

    /// Merge a child's result into its parent and report the gate status.
    pub async fn process_child_completion(
        &self,
        parent_id: &str,
        child_id: &str,
        result: Value,
        operation_id: &str,
    ) -> StateResult<ChildCompletion> {
        let parent = self.registry.get(parent_id)?;
        let completion = self
            .guarded(&parent, operation_id, |guard| {
                self.hierarchy.process_child_completion(
                    &self.registry,
                    &parent,
                    child_id,
                    result.clone(),
                    guard,
                )
            })
            .await?;

        self.invalidate(parent_id);
        self.events.publish(StateEvent::ChildCompleted {
            agent_id: parent_id.to_string(),
            child_id: child_id.to_string(),
            all_children_terminal: completion.all_children_terminal,
            timestamp: Utc::now(),
        });
        Ok(completion)
    }

    /// Oldest queued child notification for `parent_id`.
    pub fn check_parent_notifications(&self, parent_id: &str) -> Option<ParentNotification> {
        self.hierarchy.check_parent_notifications(parent_id)
    }

    pub fn get_agent_hierarchy(&self, agent_id: &str) -> StateResult<AgentHierarchy> {
        let entry = self.registry.get(agent_id)?;
        Ok(self.hierarchy.get_agent_hierarchy(&entry))
    }

    /// Exclude a child from the parent's completion gate.
    pub fn ignore_child(&self, parent_id: &str, child_id: &str) -> StateResult<()> {
        let parent = self.registry.get(parent_id)?;
        self.hierarchy.ignore_child(&parent, child_id)
    }

    // =========================================================================
    // Performance modes
    // =========================================================================

    /// Agent data through the TTL cache; reads the store directly when no
    /// cache is configured.
    pub fn get_cached_state_data(&self, agent_id: &str) -> StateResult<StateData> {
        let Some(cache) = &self.cache else {
            return Ok(self.registry.get(agent_id)?.store().read().data.clone());
        };
        if let Some(snapshot) = cache.get(agent_id) {
            return Ok(snapshot.data.clone());
        }
        let snapshot = self.registry.get(agent_id)?.store().read();
        cache.insert(agent_id, Arc::clone(&snapshot));
        Ok(snapshot.data.clone())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache
            .as_ref()
            .map(StateCache::stats)
            .unwrap_or_default()
    }

    /// Apply `mutations`, then persist with compression. The report carries
    /// the achieved ratio.
    pub async fn update_agent_state_with_compression(
        &self,
        agent_id: &str,
        mutations: &[FieldMutation],
        operation_id: &str,
    ) -> StateResult<PersistReport> {
        let Some(compression) = self.config.compression.as_ref() else {
            return Err(StateError::validation("compression is not configured"));
        };

        self.batch_update_agent_state(agent_id, mutations, operation_id)
            .await?;
        let entry = self.registry.get(agent_id)?;
        let report = match self
            .persistence
            .persist_with(&entry, Some(compression))
            .await
        {
            Ok(report) => report,
            Err(e) => {
                warn!(agent_id, operation_id, error = %e, "Compressed persist failed after update");
                return Err(e);
            }
        };

        info!(
            agent_id,
            version = report.version,
            original_bytes = report.original_bytes,
            stored_bytes = report.stored_bytes,
            ratio = report.compression_ratio(),
            "Persisted compressed agent state"
        );
        self.persisted(&report);
        Ok(report)
    }
}

impl std::fmt::Debug for AgentStateTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentStateTracker")
            .field("config", &self.config)
            .field("agents", &self.registry.len())
            .field("locks", &self.locks)
            .finish()
    }
}
