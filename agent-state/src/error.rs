//! Agent state error types
//!
//! Every failure in the core surfaces as a typed [`StateError`]. Nothing
//! panics across the lock/transition boundary; lock errors are recoverable by
//! retry, workflow errors are surfaced to the business layer.

use thiserror::Error;

/// Result type alias for agent state operations
pub type StateResult<T> = Result<T, StateError>;

/// Error type for agent state operations
#[derive(Debug, Error)]
pub enum StateError {
    /// Requested `(from, to)` pair is not in the agent type's table
    #[error("Invalid transition for '{agent_type}': {from} -> {to}")]
    InvalidTransition {
        agent_type: String,
        from: String,
        to: String,
    },

    /// Optimistic compare-and-swap lost the race
    #[error("Version conflict on agent {agent_id}: expected v{expected}, found v{actual}")]
    VersionConflict {
        agent_id: String,
        expected: u64,
        actual: u64,
    },

    /// Lock not granted within the timeout; the operation's locks were released
    #[error("Lock timeout on agent {agent_id} for operation {operation_id} after {timeout_ms}ms")]
    LockTimeout {
        agent_id: String,
        operation_id: String,
        timeout_ms: u64,
    },

    /// Acquire would have completed a wait-for cycle; the operation's locks were released
    #[error("Deadlock detected on agent {agent_id} for operation {operation_id}: cycle {cycle:?}")]
    Deadlock {
        agent_id: String,
        operation_id: String,
        cycle: Vec<String>,
    },

    /// Handle no longer backs a live exclusive lock on the agent
    #[error("Operation {operation_id} does not hold an exclusive lock on agent {agent_id}")]
    LockNotHeld {
        agent_id: String,
        operation_id: String,
    },

    /// Named checkpoint does not exist for the agent
    #[error("Checkpoint '{name}' not found for agent {agent_id}")]
    CheckpointNotFound { agent_id: String, name: String },

    /// Agent is not resident in this tracker
    #[error("Agent not found: {agent_id}")]
    AgentNotFound { agent_id: String },

    /// Agent id already registered
    #[error("Agent already exists: {agent_id}")]
    AgentExists { agent_id: String },

    /// Parent terminal transition blocked by non-terminal children
    #[error("Agent {agent_id} cannot enter {to}: children still pending {pending:?}")]
    ChildrenPending {
        agent_id: String,
        to: String,
        pending: Vec<String>,
    },

    /// No persisted snapshot exists for the agent
    #[error("No persisted state for agent {agent_id}")]
    NotFound { agent_id: String },

    /// Durable backend failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    /// Malformed input
    #[error("Validation error: {message}")]
    Validation { message: String },
}

impl StateError {
    /// Create an invalid transition error
    pub fn invalid_transition(
        agent_type: impl Into<String>,
        from: impl ToString,
        to: impl ToString,
    ) -> Self {
        Self::InvalidTransition {
            agent_type: agent_type.into(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Create an agent not found error
    pub fn agent_not_found(agent_id: impl Into<String>) -> Self {
        Self::AgentNotFound {
            agent_id: agent_id.into(),
        }
    }

    /// Create a checkpoint not found error
    pub fn checkpoint_not_found(agent_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::CheckpointNotFound {
            agent_id: agent_id.into(),
            name: name.into(),
        }
    }

    /// Create a validation error (for invalid input parameters)
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Stable machine-readable kind for transport layers
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::VersionConflict { .. } => "version_conflict",
            Self::LockTimeout { .. } => "lock_timeout",
            Self::Deadlock { .. } => "deadlock",
            Self::LockNotHeld { .. } => "lock_not_held",
            Self::CheckpointNotFound { .. } => "checkpoint_not_found",
            Self::AgentNotFound { .. } => "agent_not_found",
            Self::AgentExists { .. } => "agent_exists",
            Self::ChildrenPending { .. } => "children_pending",
            Self::NotFound { .. } => "not_found",
            Self::Persistence(_) => "persistence",
            Self::Validation { .. } => "validation",
        }
    }

    /// Check if this error is retryable (transient failure)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::VersionConflict { .. }
            | Self::LockTimeout { .. }
            | Self::Deadlock { .. }
            | Self::LockNotHeld { .. } => true,
            Self::Persistence(e) => e.is_retryable(),
            // Workflow errors go back to the business layer
            Self::InvalidTransition { .. }
            | Self::CheckpointNotFound { .. }
            | Self::ChildrenPending { .. } => false,
            _ => false,
        }
    }

    /// Get recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::VersionConflict { .. } => {
                Some("Re-read the agent state and retry the update against the new version.")
            }
            Self::LockTimeout { .. } | Self::Deadlock { .. } => Some(
                "All locks held by the operation were released. Retry the whole operation, \
                 acquiring agents in a consistent order where possible.",
            ),
            Self::LockNotHeld { .. } => {
                Some("Acquire a fresh exclusive lock before writing under lock.")
            }
            Self::InvalidTransition { .. } => {
                Some("Check the transition table for the agent type; the state is unchanged.")
            }
            Self::CheckpointNotFound { .. } => {
                Some("List checkpoints with get_checkpoint_history before rolling back.")
            }
            Self::ChildrenPending { .. } => Some(
                "Wait for child completion, report it with process_child_completion, \
                 or ignore the child explicitly.",
            ),
            Self::NotFound { .. } => {
                Some("Persist the agent before recovering it, or create it afresh.")
            }
            Self::Persistence(_) => Some(
                "In-memory state is intact. Retry later or keep operating in memory until \
                 the backend recovers.",
            ),
            _ => None,
        }
    }
}

/// Error during persistence operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    /// Backend unavailable or rejected the request
    #[error("backend error: {reason}")]
    Backend { reason: String },

    /// Backend call exceeded the configured timeout
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Serialization failed
    #[error("serialize failed: {reason}")]
    Serialize { reason: String },

    /// Deserialization failed
    #[error("deserialize failed: {reason}")]
    Deserialize { reason: String },

    /// Schema version mismatch
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Integrity check failed on recover
    #[error("integrity check failed: {reason}")]
    Integrity { reason: String },

    /// Compression or decompression failed
    #[error("compression failed: {reason}")]
    Compression { reason: String },
}

impl PersistenceError {
    /// Create a backend error
    pub fn backend(reason: impl ToString) -> Self {
        Self::Backend {
            reason: reason.to_string(),
        }
    }

    /// Whether a retry might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend { .. } | Self::Timeout { .. })
    }
}
