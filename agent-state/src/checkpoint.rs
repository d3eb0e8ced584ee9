//! Named point-in-time snapshots and rollback.
//!
//! Both operations bracket their work with an exclusive lock acquired and
//! released inside the call, so a checkpoint is never a torn copy and a
//! rollback lands as one atomic commit.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::info;

use crate::error::{StateError, StateResult};
use crate::lock::{LockHandle, LockManager, LockMode};
use crate::state::store::CommitGuard;
use crate::state::{AgentEntry, Checkpoint, CheckpointId, CheckpointMeta, StateTag, StateTransition};

/// Result of a successful rollback.
#[derive(Debug, Clone, PartialEq)]
pub struct Rollback {
    pub checkpoint: CheckpointId,
    pub from: StateTag,
    pub to: StateTag,
    pub version: u64,
}

/// Creates checkpoints and restores agents from them.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    locks: Arc<LockManager>,
    lock_timeout: Duration,
}

impl CheckpointManager {
    pub fn new(locks: Arc<LockManager>, lock_timeout: Duration) -> Self {
        Self {
            locks,
            lock_timeout,
        }
    }

    async fn exclusive(&self, entry: &AgentEntry, operation_id: &str) -> StateResult<LockHandle> {
        self.locks
            .acquire(
                entry.agent_id(),
                LockMode::Exclusive,
                operation_id,
                self.lock_timeout,
            )
            .await
    }

    /// Snapshot `data` and `current_state` under `name`. Does not bump the version.
    pub async fn create_checkpoint(
        &self,
        entry: &AgentEntry,
        name: &str,
        operation_id: &str,
    ) -> StateResult<CheckpointId> {
        if name.trim().is_empty() {
            return Err(StateError::validation("checkpoint name must not be empty"));
        }

        let handle = self.exclusive(entry, operation_id).await?;
        let snapshot = entry.store().read();
        let checkpoint = entry.push_checkpoint(|sequence| Checkpoint {
            name: name.to_string(),
            sequence,
            created_at: Utc::now(),
            version: snapshot.version,
            data_snapshot: snapshot.data.clone(),
            state_snapshot: snapshot.current_state.clone(),
        });
        self.locks.release(&handle);

        info!(
            agent_id = %entry.agent_id(),
            checkpoint = %checkpoint.name,
            sequence = checkpoint.sequence,
            state = %checkpoint.state_snapshot,
            "Checkpoint created"
        );

        Ok(CheckpointId {
            agent_id: entry.agent_id().to_string(),
            name: checkpoint.name,
            sequence: checkpoint.sequence,
        })
    }

    /// Restore the most recent checkpoint named `name`.
    ///
    /// Data and state are replaced in a single locked commit that also
    /// records a `rollback` history entry. Rolling back twice yields the same
    /// data both times.
    pub async fn rollback_to_checkpoint(
        &self,
        entry: &AgentEntry,
        name: &str,
        operation_id: &str,
    ) -> StateResult<Rollback> {
        let checkpoint = entry
            .latest_checkpoint(name)
            .ok_or_else(|| StateError::checkpoint_not_found(entry.agent_id(), name))?;

        let handle = self.exclusive(entry, operation_id).await?;
        let result = entry
            .store()
            .commit(CommitGuard::Lock(&handle), |working| {
                let from = working.current_state.clone();
                working.record(StateTransition::rollback(
                    from.clone(),
                    checkpoint.state_snapshot.clone(),
                    operation_id,
                    &checkpoint.name,
                    checkpoint.sequence,
                ));
                working.data = checkpoint.data_snapshot.clone();
                working.current_state = checkpoint.state_snapshot.clone();
                Ok(from)
            });
        self.locks.release(&handle);
        let (version, from) = result?;

        info!(
            agent_id = %entry.agent_id(),
            checkpoint = %checkpoint.name,
            sequence = checkpoint.sequence,
            from = %from,
            to = %checkpoint.state_snapshot,
            version,
            "Rolled back to checkpoint"
        );

        Ok(Rollback {
            checkpoint: CheckpointId {
                agent_id: entry.agent_id().to_string(),
                name: checkpoint.name,
                sequence: checkpoint.sequence,
            },
            from,
            to: checkpoint.state_snapshot,
            version,
        })
    }

    /// Checkpoint metadata in creation order, without payloads.
    pub fn get_checkpoint_history(&self, entry: &AgentEntry) -> Vec<CheckpointMeta> {
        entry.checkpoints().iter().map(Checkpoint::meta).collect()
    }
}
