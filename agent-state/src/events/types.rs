//! Event types published by the tracker
//!
//! One event per committed state change, plus lock aborts and persistence
//! outcomes. Events are informational; nothing in the core consumes them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{AgentId, OperationId, StateTag};

/// Why a lock acquisition was aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAbortReason {
    Deadlock,
    Timeout,
}

/// All tracker events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateEvent {
    /// A new agent was registered at INITIALIZING
    AgentCreated {
        agent_id: AgentId,
        agent_type: String,
        parent_id: Option<AgentId>,
        timestamp: DateTime<Utc>,
    },

    /// A validated transition committed
    Transitioned {
        agent_id: AgentId,
        from: StateTag,
        to: StateTag,
        version: u64,
        operation_id: OperationId,
        timestamp: DateTime<Utc>,
    },

    /// Data mutations committed
    DataUpdated {
        agent_id: AgentId,
        version: u64,
        keys: Vec<String>,
        operation_id: OperationId,
        timestamp: DateTime<Utc>,
    },

    /// A checkpoint was taken
    CheckpointCreated {
        agent_id: AgentId,
        name: String,
        sequence: u64,
        timestamp: DateTime<Utc>,
    },

    /// Data and state restored from a checkpoint
    RolledBack {
        agent_id: AgentId,
        checkpoint: String,
        sequence: u64,
        version: u64,
        timestamp: DateTime<Utc>,
    },

    /// An acquire failed and the operation's locks were released
    LockAborted {
        agent_id: AgentId,
        operation_id: OperationId,
        reason: LockAbortReason,
        timestamp: DateTime<Utc>,
    },

    /// A snapshot reached the durable backend
    Persisted {
        agent_id: AgentId,
        version: u64,
        stored_bytes: usize,
        compressed: bool,
        timestamp: DateTime<Utc>,
    },

    /// An agent was reloaded from its snapshot
    Recovered {
        agent_id: AgentId,
        version: u64,
        timestamp: DateTime<Utc>,
    },

    /// A child's completion was merged into its parent
    ChildCompleted {
        agent_id: AgentId,
        child_id: AgentId,
        all_children_terminal: bool,
        timestamp: DateTime<Utc>,
    },

    /// A terminal, persisted agent left memory
    Evicted {
        agent_id: AgentId,
        timestamp: DateTime<Utc>,
    },
}

impl StateEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            StateEvent::AgentCreated { timestamp, .. }
            | StateEvent::Transitioned { timestamp, .. }
            | StateEvent::DataUpdated { timestamp, .. }
            | StateEvent::CheckpointCreated { timestamp, .. }
            | StateEvent::RolledBack { timestamp, .. }
            | StateEvent::LockAborted { timestamp, .. }
            | StateEvent::Persisted { timestamp, .. }
            | StateEvent::Recovered { timestamp, .. }
            | StateEvent::ChildCompleted { timestamp, .. }
            | StateEvent::Evicted { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            StateEvent::AgentCreated { .. } => "agent_created",
            StateEvent::Transitioned { .. } => "transitioned",
            StateEvent::DataUpdated { .. } => "data_updated",
            StateEvent::CheckpointCreated { .. } => "checkpoint_created",
            StateEvent::RolledBack { .. } => "rolled_back",
            StateEvent::LockAborted { .. } => "lock_aborted",
            StateEvent::Persisted { .. } => "persisted",
            StateEvent::Recovered { .. } => "recovered",
            StateEvent::ChildCompleted { .. } => "child_completed",
            StateEvent::Evicted { .. } => "evicted",
        }
    }

    /// Agent the event is about
    pub fn agent_id(&self) -> &str {
        match self {
            StateEvent::AgentCreated { agent_id, .. }
            | StateEvent::Transitioned { agent_id, .. }
            | StateEvent::DataUpdated { agent_id, .. }
            | StateEvent::CheckpointCreated { agent_id, .. }
            | StateEvent::RolledBack { agent_id, .. }
            | StateEvent::LockAborted { agent_id, .. }
            | StateEvent::Persisted { agent_id, .. }
            | StateEvent::Recovered { agent_id, .. }
            | StateEvent::ChildCompleted { agent_id, .. }
            | StateEvent::Evicted { agent_id, .. } => agent_id,
        }
    }
}
