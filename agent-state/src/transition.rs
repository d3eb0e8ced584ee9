//! Table-driven state transition validation.
//!
//! Each agent type maps to an adjacency set of legal `(from, to)` pairs plus
//! the set of states it treats as terminal. Validation is pure: it touches no
//! shared state and is safe to call from any thread without locking.
//!
//! # Standard `pipeline` type
//!
//! ```text
//! INITIALIZING → COLLECTING_DATA → ANALYZING → OPTIMIZING → REPORTING → COMPLETED
//!                                     │            ├→ AUTOMATION → VALIDATION ─┐
//!                                     └→ REPORTING └→ VALIDATION → REPORTING ←─┘
//! any non-terminal → ERROR;  ERROR → INITIALIZING (retry)
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};
use crate::state::StateTag;

/// Agent type name of the built-in table.
pub const PIPELINE_AGENT_TYPE: &str = "pipeline";

/// Legal moves of one agent type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentTypeTable {
    #[serde(default)]
    edges: BTreeMap<StateTag, BTreeSet<StateTag>>,
    #[serde(default)]
    terminal: BTreeSet<StateTag>,
}

impl AgentTypeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allow `from → to` for every `to`.
    pub fn allow(mut self, from: StateTag, to: impl IntoIterator<Item = StateTag>) -> Self {
        self.edges.entry(from).or_default().extend(to);
        self
    }

    /// Mark a state terminal. Its only outgoing edges should be retry edges.
    pub fn terminal(mut self, state: StateTag) -> Self {
        self.edges.entry(state.clone()).or_default();
        self.terminal.insert(state);
        self
    }

    pub fn allows(&self, from: &StateTag, to: &StateTag) -> bool {
        self.edges.get(from).is_some_and(|targets| targets.contains(to))
    }

    pub fn is_terminal(&self, state: &StateTag) -> bool {
        self.terminal.contains(state)
    }

    /// Every state mentioned by the table.
    pub fn states(&self) -> BTreeSet<StateTag> {
        self.edges
            .iter()
            .flat_map(|(from, targets)| std::iter::once(from).chain(targets.iter()))
            .chain(self.terminal.iter())
            .cloned()
            .collect()
    }

    pub fn targets(&self, from: &StateTag) -> Vec<StateTag> {
        self.edges
            .get(from)
            .map(|targets| targets.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Transition tables for every agent type, supplied by the business layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransitionTable {
    types: HashMap<String, AgentTypeTable>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent_type(mut self, agent_type: impl Into<String>, table: AgentTypeTable) -> Self {
        self.types.insert(agent_type.into(), table);
        self
    }

    /// Table carrying the built-in `pipeline` agent type.
    pub fn standard() -> Self {
        Self::new().with_agent_type(PIPELINE_AGENT_TYPE, pipeline_table())
    }

    pub fn agent_type(&self, agent_type: &str) -> Option<&AgentTypeTable> {
        self.types.get(agent_type)
    }

    pub fn agent_types(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Structural checks: every type must reach from `INITIALIZING`, and
    /// terminal states may only leave through a retry edge to `INITIALIZING`.
    pub fn check(&self) -> StateResult<()> {
        for (name, table) in &self.types {
            if !table.states().contains(&StateTag::Initializing) {
                return Err(StateError::validation(format!(
                    "agent type '{}' has no INITIALIZING state",
                    name
                )));
            }
            for terminal in &table.terminal {
                let non_retry: Vec<StateTag> = table
                    .targets(terminal)
                    .into_iter()
                    .filter(|t| *t != StateTag::Initializing)
                    .collect();
                if !non_retry.is_empty() {
                    return Err(StateError::validation(format!(
                        "terminal state {} of '{}' has outgoing edges {:?}",
                        terminal, name, non_retry
                    )));
                }
            }
        }
        Ok(())
    }
}

fn pipeline_table() -> AgentTypeTable {
    use StateTag::*;

    AgentTypeTable::new()
        .allow(Initializing, [CollectingData, Error])
        .allow(CollectingData, [Analyzing, Error])
        .allow(Analyzing, [Optimizing, Reporting, Error])
        .allow(Optimizing, [Reporting, Automation, Validation, Error])
        .allow(Automation, [Validation, Error])
        .allow(Validation, [Reporting, Error])
        .allow(Reporting, [Completed, Error])
        .terminal(Completed)
        .terminal(Error)
        .allow(Error, [Initializing])
}

/// Pure validator over a [`TransitionTable`].
#[derive(Debug, Clone)]
pub struct StateTransitionValidator {
    table: TransitionTable,
}

impl StateTransitionValidator {
    pub fn new(table: TransitionTable) -> StateResult<Self> {
        table.check()?;
        Ok(Self { table })
    }

    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Whether the agent type is known.
    pub fn knows(&self, agent_type: &str) -> bool {
        self.table.agent_type(agent_type).is_some()
    }

    fn type_table(&self, agent_type: &str) -> StateResult<&AgentTypeTable> {
        self.table
            .agent_type(agent_type)
            .ok_or_else(|| StateError::validation(format!("unknown agent type '{}'", agent_type)))
    }

    /// Check that `from → to` is legal for `agent_type`.
    pub fn validate(&self, agent_type: &str, from: &StateTag, to: &StateTag) -> StateResult<()> {
        if self.type_table(agent_type)?.allows(from, to) {
            Ok(())
        } else {
            Err(StateError::invalid_transition(agent_type, from, to))
        }
    }

    /// Terminal per the agent type's table; unknown types have none.
    pub fn is_terminal(&self, agent_type: &str, state: &StateTag) -> bool {
        self.table
            .agent_type(agent_type)
            .is_some_and(|t| t.is_terminal(state))
    }
}
