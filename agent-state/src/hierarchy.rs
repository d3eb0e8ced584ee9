//! Parent/child coordination.
//!
//! Parents learn about children through two channels: a per-parent queue of
//! transition notifications, and `process_child_completion`, which merges a
//! child's result into the parent's data under `child_results`.
//!
//! # Completion gate
//!
//! A parent may not enter a terminal state other than `ERROR` while one of
//! its children is still running. A child stops counting once it is
//! terminal, its completion was processed, or it was explicitly ignored.
//! `ERROR` is the abandonment path and is never gated.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::state::store::CommitGuard;
use crate::state::{
    AgentEntry, AgentHierarchy, AgentId, AgentRegistry, OperationId, StateTag, StateTransition,
    Value,
};
use crate::transition::StateTransitionValidator;

/// Data key under which child results are merged.
pub const CHILD_RESULTS_KEY: &str = "child_results";

/// Transition of a child, queued for its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParentNotification {
    pub parent_id: AgentId,
    pub child_id: AgentId,
    pub from: StateTag,
    pub to: StateTag,
    pub version: u64,
    pub operation_id: OperationId,
    pub timestamp: DateTime<Utc>,
}

/// Committed transition.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionOutcome {
    pub from: StateTag,
    pub to: StateTag,
    pub version: u64,
}

/// Result of merging one child's completion into its parent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChildCompletion {
    pub parent_id: AgentId,
    pub child_id: AgentId,
    /// Parent version after the merge.
    pub version: u64,
    /// No child is holding the parent's terminal transition back.
    pub all_children_terminal: bool,
    pub pending_children: Vec<AgentId>,
}

/// Coordinates transitions that involve related agents.
pub struct HierarchyCoordinator {
    validator: Arc<StateTransitionValidator>,
    notifications: Mutex<HashMap<AgentId, VecDeque<ParentNotification>>>,
}

impl HierarchyCoordinator {
    pub fn new(validator: Arc<StateTransitionValidator>) -> Self {
        Self {
            validator,
            notifications: Mutex::new(HashMap::new()),
        }
    }

    pub fn validator(&self) -> &StateTransitionValidator {
        &self.validator
    }

    /// Children of `entry` still holding back its terminal transition.
    pub fn pending_children(&self, registry: &AgentRegistry, entry: &AgentEntry) -> Vec<AgentId> {
        let links = entry.links();
        links
            .children
            .iter()
            .filter(|child| !links.ignored.contains(*child) && !links.completed.contains(*child))
            .filter(|child| match registry.try_get(child) {
                Some(child_entry) => !self
                    .validator
                    .is_terminal(child_entry.agent_type(), &child_entry.store().current_state()),
                // Only terminal agents are ever evicted.
                None => false,
            })
            .cloned()
            .collect()
    }

    /// Validate and commit `entry → to`, then queue a parent notification
    /// when asked to.
    pub(crate) fn transition(
        &self,
        registry: &AgentRegistry,
        entry: &AgentEntry,
        to: &StateTag,
        operation_id: &str,
        guard: CommitGuard<'_>,
        notify_parent: bool,
    ) -> StateResult<TransitionOutcome> {
        let agent_type = entry.agent_type();
        let gated = self.validator.is_terminal(agent_type, to) && !to.is_error();

        let (version, from) = entry.store().commit(guard, |working| {
            let from = working.current_state.clone();
            self.validator.validate(agent_type, &from, to)?;
            if gated {
                let pending = self.pending_children(registry, entry);
                if !pending.is_empty() {
                    return Err(StateError::ChildrenPending {
                        agent_id: entry.agent_id().to_string(),
                        to: to.to_string(),
                        pending,
                    });
                }
            }
            working.record(StateTransition::new(from.clone(), to.clone(), operation_id));
            working.current_state = to.clone();
            Ok(from)
        })?;

        info!(
            agent_id = %entry.agent_id(),
            from = %from,
            to = %to,
            version,
            operation_id,
            "Agent transitioned"
        );

        if notify_parent {
            if let Some(parent_id) = entry.parent_id() {
                self.enqueue(ParentNotification {
                    parent_id: parent_id.to_string(),
                    child_id: entry.agent_id().to_string(),
                    from: from.clone(),
                    to: to.clone(),
                    version,
                    operation_id: operation_id.to_string(),
                    timestamp: Utc::now(),
                });
            }
        }

        Ok(TransitionOutcome {
            from,
            to: to.clone(),
            version,
        })
    }

    fn enqueue(&self, notification: ParentNotification) {
        debug!(
            parent_id = %notification.parent_id,
            child_id = %notification.child_id,
            to = %notification.to,
            "Queued parent notification"
        );
        self.notifications
            .lock()
            .entry(notification.parent_id.clone())
            .or_default()
            .push_back(notification);
    }

    /// Oldest undelivered notification for `parent_id`.
    pub fn check_parent_notifications(&self, parent_id: &str) -> Option<ParentNotification> {
        let mut queues = self.notifications.lock();
        let queue = queues.get_mut(parent_id)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            queues.remove(parent_id);
        }
        next
    }

    pub fn pending_notifications(&self, parent_id: &str) -> usize {
        self.notifications
            .lock()
            .get(parent_id)
            .map_or(0, VecDeque::len)
    }

    /// Merge `result` into the parent under `child_results.<child_id>` and
    /// mark the child's completion as processed.
    pub(crate) fn process_child_completion(
        &self,
        registry: &AgentRegistry,
        parent: &AgentEntry,
        child_id: &str,
        result: Value,
        guard: CommitGuard<'_>,
    ) -> StateResult<ChildCompletion> {
        if !parent.links().children.contains(child_id) {
            return Err(StateError::validation(format!(
                "agent {} is not a child of {}",
                child_id,
                parent.agent_id()
            )));
        }

        let (version, ()) = parent.store().commit(guard, |working| {
            let results = working
                .data
                .entry(CHILD_RESULTS_KEY.to_string())
                .or_insert_with(|| Value::Map(BTreeMap::new()));
            match results {
                Value::Map(map) => {
                    map.insert(child_id.to_string(), result);
                    Ok(())
                }
                other => Err(StateError::validation(format!(
                    "field '{}' expected map, found {}",
                    CHILD_RESULTS_KEY,
                    other.type_name()
                ))),
            }
        })?;

        parent.update_links(|links| {
            links.completed.insert(child_id.to_string());
        });
        let pending_children = self.pending_children(registry, parent);
        let all_children_terminal = pending_children.is_empty();

        info!(
            agent_id = %parent.agent_id(),
            child_id,
            version,
            all_children_terminal,
            "Processed child completion"
        );

        Ok(ChildCompletion {
            parent_id: parent.agent_id().to_string(),
            child_id: child_id.to_string(),
            version,
            all_children_terminal,
            pending_children,
        })
    }

    /// Exclude `child_id` from `parent`'s completion gate.
    pub fn ignore_child(&self, parent: &AgentEntry, child_id: &str) -> StateResult<()> {
        let known = parent.update_links(|links| {
            let known = links.children.contains(child_id);
            if known {
                links.ignored.insert(child_id.to_string());
            }
            known
        });
        if !known {
            return Err(StateError::validation(format!(
                "agent {} is not a child of {}",
                child_id,
                parent.agent_id()
            )));
        }
        debug!(agent_id = %parent.agent_id(), child_id, "Child ignored for completion gate");
        Ok(())
    }

    pub fn get_agent_hierarchy(&self, entry: &AgentEntry) -> AgentHierarchy {
        entry.hierarchy()
    }
}

impl std::fmt::Debug for HierarchyCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchyCoordinator")
            .field("queued_parents", &self.notifications.lock().len())
            .finish()
    }
}
