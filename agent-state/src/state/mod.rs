//! Agent state model and versioned storage
//!
//! - `value`: typed payload values (`Value`, `StateData`)
//! - `types`: the `AgentState` aggregate, state tags, transitions,
//!   checkpoints and field mutations
//! - `store`: `VersionedStore`, the per-agent CAS/locked write path
//! - `registry`: the table of agents resident in one tracker

pub mod registry;
pub mod store;
pub mod types;
pub mod value;

pub use registry::{AgentEntry, AgentRegistry, ChildLinks};
pub use store::{StoreSnapshot, VersionedStore};
pub use types::{
    apply_all, AgentHierarchy, AgentId, AgentState, Checkpoint, CheckpointId, CheckpointMeta,
    FieldMutation, OperationId, StateTag, StateTransition, TransitionKind,
};
pub use value::{StateData, Value};
