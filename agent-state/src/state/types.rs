//! Core types for agent state tracking

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::value::{StateData, Value};
use crate::error::{StateError, StateResult};

/// Agent identifier, stable for the agent's lifetime
pub type AgentId = String;

/// Caller-supplied correlation token for one logical operation
pub type OperationId = String;

/// Execution phase of an agent.
///
/// The built-in tags cover the standard pipeline; agent types may add their
/// own through [`StateTag::Custom`]. Serialized as the SCREAMING_SNAKE label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum StateTag {
    Initializing,
    CollectingData,
    Analyzing,
    Optimizing,
    Reporting,
    Automation,
    Validation,
    Completed,
    Error,
    Custom(String),
}

impl StateTag {
    /// Label used on the wire and in logs.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Initializing => "INITIALIZING",
            Self::CollectingData => "COLLECTING_DATA",
            Self::Analyzing => "ANALYZING",
            Self::Optimizing => "OPTIMIZING",
            Self::Reporting => "REPORTING",
            Self::Automation => "AUTOMATION",
            Self::Validation => "VALIDATION",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
            Self::Custom(label) => label,
        }
    }

    /// Whether this is the failure/abandonment tag.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error)
    }
}

impl std::fmt::Display for StateTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for StateTag {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tag = match s {
            "INITIALIZING" => Self::Initializing,
            "COLLECTING_DATA" => Self::CollectingData,
            "ANALYZING" => Self::Analyzing,
            "OPTIMIZING" => Self::Optimizing,
            "REPORTING" => Self::Reporting,
            "AUTOMATION" => Self::Automation,
            "VALIDATION" => Self::Validation,
            "COMPLETED" => Self::Completed,
            "ERROR" => Self::Error,
            "" => return Err(StateError::validation("empty state tag")),
            other => Self::Custom(other.to_string()),
        };
        Ok(tag)
    }
}

impl From<StateTag> for String {
    fn from(tag: StateTag) -> Self {
        tag.as_str().to_string()
    }
}

impl TryFrom<String> for StateTag {
    type Error = StateError;

    fn try_from(s: String) -> Result<Self, StateError> {
        s.parse()
    }
}

/// Why a history entry was recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransitionKind {
    /// Validated move through the transition table.
    Transition,
    /// Synthetic entry written by a checkpoint rollback.
    Rollback { checkpoint: String, sequence: u64 },
}

/// A state transition record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTransition {
    /// Previous state.
    pub from: StateTag,
    /// New state.
    pub to: StateTag,
    /// When the transition occurred.
    pub timestamp: DateTime<Utc>,
    /// Operation that caused the transition.
    pub operation_id: OperationId,
    /// Regular transition or rollback.
    #[serde(flatten)]
    pub kind: TransitionKind,
}

impl StateTransition {
    pub fn new(from: StateTag, to: StateTag, operation_id: &str) -> Self {
        Self {
            from,
            to,
            timestamp: Utc::now(),
            operation_id: operation_id.to_string(),
            kind: TransitionKind::Transition,
        }
    }

    pub fn rollback(
        from: StateTag,
        to: StateTag,
        operation_id: &str,
        checkpoint: &str,
        sequence: u64,
    ) -> Self {
        Self {
            from,
            to,
            timestamp: Utc::now(),
            operation_id: operation_id.to_string(),
            kind: TransitionKind::Rollback {
                checkpoint: checkpoint.to_string(),
                sequence,
            },
        }
    }

    pub fn is_rollback(&self) -> bool {
        matches!(self.kind, TransitionKind::Rollback { .. })
    }
}

/// Immutable named snapshot of an agent's data and state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Caller-chosen name; not unique across time.
    pub name: String,
    /// Monotonic per-agent sequence number (1-indexed).
    pub sequence: u64,
    /// When the checkpoint was taken.
    pub created_at: DateTime<Utc>,
    /// Version of the agent at snapshot time.
    pub version: u64,
    /// Data at snapshot time.
    pub data_snapshot: StateData,
    /// State at snapshot time.
    pub state_snapshot: StateTag,
}

impl Checkpoint {
    /// Metadata view without the payload.
    pub fn meta(&self) -> CheckpointMeta {
        CheckpointMeta {
            name: self.name.clone(),
            sequence: self.sequence,
            created_at: self.created_at,
            state: self.state_snapshot.clone(),
            version: self.version,
        }
    }
}

/// Addressable id of one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckpointId {
    pub agent_id: AgentId,
    pub name: String,
    pub sequence: u64,
}

/// Checkpoint metadata returned by history queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub name: String,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub state: StateTag,
    pub version: u64,
}

/// Full point-in-time view of one agent, the aggregate root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub agent_type: String,
    pub current_state: StateTag,
    pub data: StateData,
    pub version: u64,
    pub history: Vec<StateTransition>,
    pub parent_id: Option<AgentId>,
    pub children_ids: BTreeSet<AgentId>,
    pub checkpoints: Vec<Checkpoint>,
}

/// Parent/child links of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentHierarchy {
    pub agent_id: AgentId,
    pub parent_id: Option<AgentId>,
    pub children_ids: BTreeSet<AgentId>,
}

/// A single field mutation applied to agent data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldMutation {
    /// Overwrite or insert a key.
    Set { key: String, value: Value },
    /// Remove a key (absent keys are fine).
    Remove { key: String },
    /// Add to an integer counter, creating it at 0.
    Increment { key: String, by: i64 },
    /// Add to a numeric total, creating it at 0.0.
    Accumulate { key: String, amount: f64 },
    /// Push onto a list, creating it empty.
    Append { key: String, value: Value },
    /// Merge entries into a map, creating it empty.
    Merge {
        key: String,
        entries: BTreeMap<String, Value>,
    },
}

impl FieldMutation {
    pub fn set(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Set {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self::Remove { key: key.into() }
    }

    pub fn increment(key: impl Into<String>, by: i64) -> Self {
        Self::Increment { key: key.into(), by }
    }

    pub fn accumulate(key: impl Into<String>, amount: f64) -> Self {
        Self::Accumulate {
            key: key.into(),
            amount,
        }
    }

    pub fn append(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Append {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn merge(key: impl Into<String>, entries: BTreeMap<String, Value>) -> Self {
        Self::Merge {
            key: key.into(),
            entries,
        }
    }

    /// Key touched by this mutation.
    pub fn key(&self) -> &str {
        match self {
            Self::Set { key, .. }
            | Self::Remove { key }
            | Self::Increment { key, .. }
            | Self::Accumulate { key, .. }
            | Self::Append { key, .. }
            | Self::Merge { key, .. } => key,
        }
    }

    /// Apply to `data`. On a type mismatch `data` may be partially modified,
    /// so callers apply batches to a working copy.
    pub fn apply(&self, data: &mut StateData) -> StateResult<()> {
        match self {
            Self::Set { key, value } => {
                data.insert(key.clone(), value.clone());
            }
            Self::Remove { key } => {
                data.remove(key);
            }
            Self::Increment { key, by } => {
                let slot = data.entry(key.clone()).or_insert(Value::Int(0));
                match slot {
                    Value::Int(n) => *n = n.saturating_add(*by),
                    other => return Err(type_mismatch(key, "int", other)),
                }
            }
            Self::Accumulate { key, amount } => {
                let slot = data.entry(key.clone()).or_insert(Value::Float(0.0));
                let total = match slot.as_f64() {
                    Some(current) => current + amount,
                    None => return Err(type_mismatch(key, "number", slot)),
                };
                if !total.is_finite() {
                    return Err(StateError::validation(format!(
                        "field '{}' would accumulate to non-finite {}",
                        key, total
                    )));
                }
                *slot = Value::Float(total);
            }
            Self::Append { key, value } => {
                let slot = data.entry(key.clone()).or_insert(Value::List(Vec::new()));
                match slot {
                    Value::List(items) => items.push(value.clone()),
                    other => return Err(type_mismatch(key, "list", other)),
                }
            }
            Self::Merge { key, entries } => {
                let slot = data.entry(key.clone()).or_insert(Value::Map(BTreeMap::new()));
                match slot {
                    Value::Map(map) => {
                        map.extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())))
                    }
                    other => return Err(type_mismatch(key, "map", other)),
                }
            }
        }
        Ok(())
    }
}

fn type_mismatch(key: &str, expected: &str, found: &Value) -> StateError {
    StateError::validation(format!(
        "field '{}' expected {}, found {}",
        key,
        expected,
        found.type_name()
    ))
}

/// Apply a batch to a copy of `data`, returning the copy only if every
/// mutation succeeded.
pub fn apply_all(data: &StateData, mutations: &[FieldMutation]) -> StateResult<StateData> {
    let mut working = data.clone();
    for mutation in mutations {
        mutation.apply(&mut working)?;
    }
    Ok(working)
}
