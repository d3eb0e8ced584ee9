//! Agent State Management Core
//!
//! Tracks, mutates, checkpoints, persists and recovers the execution state of
//! long-running agent workflows shared by concurrent callers.
//!
//! # Components
//!
//! - [`transition::StateTransitionValidator`]: pure table-driven legality check
//! - [`state::VersionedStore`]: per-agent data + state behind a monotonic version
//! - [`lock::LockManager`]: shared/exclusive locks with wait-for cycle detection
//! - [`checkpoint::CheckpointManager`]: named snapshots and rollback
//! - [`persistence::PersistenceAdapter`]: durable snapshots over a pluggable backend
//! - [`hierarchy::HierarchyCoordinator`]: parent/child notification and completion
//! - [`tracker::AgentStateTracker`]: the façade tying them together
//!
//! # Usage
//!
//! ```no_run
//! use agent_state::{AgentStateTracker, StateTag, TrackerConfig, PIPELINE_AGENT_TYPE};
//!
//! # async fn run() -> agent_state::StateResult<()> {
//! let tracker = AgentStateTracker::in_memory(TrackerConfig::default())?.shared();
//! tracker.create_agent("a1", PIPELINE_AGENT_TYPE, None)?;
//! tracker
//!     .transition_agent_state("a1", StateTag::CollectingData, "op-1")
//!     .await?;
//! tracker.persist_agent_state("a1").await?;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod hierarchy;
pub mod lock;
pub mod persistence;
pub mod state;
pub mod telemetry;
pub mod tracker;
pub mod transition;

pub use cache::CacheStats;
pub use checkpoint::{CheckpointManager, Rollback};
pub use config::{CacheConfig, CompressionConfig, LockingMode, PersistenceConfig, TrackerConfig};
pub use error::{PersistenceError, StateError, StateResult};
pub use events::{EventBus, EventFilter, LockAbortReason, StateEvent};
pub use hierarchy::{ChildCompletion, HierarchyCoordinator, ParentNotification, TransitionOutcome};
pub use lock::{LockHandle, LockInfo, LockManager, LockMode};
pub use persistence::{DurableBackend, MemoryBackend, PersistReport, PersistenceAdapter};
pub use state::{
    AgentHierarchy, AgentId, AgentState, Checkpoint, CheckpointId, CheckpointMeta, FieldMutation,
    OperationId, StateData, StateTag, StateTransition, Value, VersionedStore,
};
pub use tracker::AgentStateTracker;
pub use transition::{
    AgentTypeTable, StateTransitionValidator, TransitionTable, PIPELINE_AGENT_TYPE,
};
