//! Per-agent shared/exclusive lock table with deadlock detection.
//!
//! Shared locks coexist; an exclusive lock excludes every lock held by other
//! operations on the same agent. Locks are owned by operation ids, not by
//! tasks, so one logical operation may hold locks on several agents.
//!
//! # Deadlock policy
//!
//! ```text
//! acquire(agent, mode, op, timeout)
//!   ├─ compatible with holders           → granted
//!   ├─ waiting would close a cycle       → Deadlock,    op's locks released
//!   ├─ still blocked when timeout passes → LockTimeout, op's locks released
//!   └─ otherwise wait for a release or a lease expiry and re-check
//! ```
//!
//! Recovery is abort-and-release: the failed operation loses every lock it
//! held so all other waiters make progress. Nothing is retried here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::wait_graph::WaitForGraph;
use crate::error::{StateError, StateResult};
use crate::state::{AgentId, OperationId};

/// Lock mode determining concurrency behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Multiple holders can acquire the lock
    Shared,
    /// Only one holder can acquire the lock
    Exclusive,
}

impl LockMode {
    fn compatible_with(self, held: LockMode) -> bool {
        matches!((self, held), (Self::Shared, Self::Shared))
    }
}

impl std::fmt::Display for LockMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shared => write!(f, "shared"),
            Self::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// Ephemeral lock record. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockInfo {
    pub agent_id: AgentId,
    pub holder_operation_id: OperationId,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Proof of a granted lock.
///
/// Releasing is explicit through [`LockManager::release`]; a handle whose
/// lock was released, aborted or expired reports `is_released()`.
#[derive(Debug, Clone)]
pub struct LockHandle {
    id: u64,
    info: LockInfo,
    expires: Instant,
    released: Arc<AtomicBool>,
}

impl LockHandle {
    pub fn agent_id(&self) -> &str {
        &self.info.agent_id
    }

    pub fn operation_id(&self) -> &str {
        &self.info.holder_operation_id
    }

    pub fn mode(&self) -> LockMode {
        self.info.mode
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire) || Instant::now() >= self.expires
    }

    /// Live exclusive lock on `agent_id`.
    pub(crate) fn covers_exclusive(&self, agent_id: &str) -> bool {
        self.info.agent_id == agent_id
            && self.info.mode == LockMode::Exclusive
            && !self.is_released()
    }
}

struct HeldLock {
    id: u64,
    info: LockInfo,
    expires: Instant,
    released: Arc<AtomicBool>,
}

impl HeldLock {
    fn retire(&self) {
        self.released.store(true, Ordering::Release);
    }
}

struct Waiting {
    agent_id: AgentId,
    mode: LockMode,
}

#[derive(Default)]
struct LockTable {
    held: HashMap<AgentId, Vec<HeldLock>>,
    waiting: HashMap<OperationId, Waiting>,
}

impl LockTable {
    /// Drop expired leases. Returns how many were dropped.
    fn purge_expired(&mut self, now: Instant) -> usize {
        let mut purged = 0;
        self.held.retain(|_, locks| {
            locks.retain(|lock| {
                let live = lock.expires > now;
                if !live {
                    lock.retire();
                    purged += 1;
                }
                live
            });
            !locks.is_empty()
        });
        purged
    }

    /// Other operations holding locks on `agent_id` that conflict with `mode`.
    fn blockers(&self, agent_id: &str, mode: LockMode, operation_id: &str) -> Vec<&str> {
        let mut blockers: Vec<&str> = self
            .held
            .get(agent_id)
            .into_iter()
            .flatten()
            .filter(|lock| {
                lock.info.holder_operation_id != operation_id
                    && !mode.compatible_with(lock.info.mode)
            })
            .map(|lock| lock.info.holder_operation_id.as_str())
            .collect();
        blockers.sort_unstable();
        blockers.dedup();
        blockers
    }

    fn earliest_expiry(&self, agent_id: &str) -> Option<Instant> {
        self.held
            .get(agent_id)
            .into_iter()
            .flatten()
            .map(|lock| lock.expires)
            .min()
    }

    /// Wait-for cycle closed by `operation_id` waiting on `blockers`.
    fn find_cycle(&self, operation_id: &str, blockers: &[&str]) -> Option<Vec<String>> {
        let mut graph = WaitForGraph::new();
        for (waiter, wait) in &self.waiting {
            if waiter == operation_id {
                continue;
            }
            for holder in self.blockers(&wait.agent_id, wait.mode, waiter) {
                graph.add_wait(waiter, holder);
            }
        }
        graph.cycle_through(operation_id, blockers)
    }

    /// Release every lock of `operation_id`; returns the affected agents.
    fn release_operation(&mut self, operation_id: &str) -> Vec<AgentId> {
        let mut agents = Vec::new();
        self.held.retain(|agent_id, locks| {
            let before = locks.len();
            locks.retain(|lock| {
                let owned = lock.info.holder_operation_id == operation_id;
                if owned {
                    lock.retire();
                }
                !owned
            });
            if locks.len() != before {
                agents.push(agent_id.clone());
            }
            !locks.is_empty()
        });
        agents.sort();
        agents
    }
}

/// Removes a pending wait-for entry if the acquire future is dropped.
struct WaitRegistration<'a> {
    manager: &'a LockManager,
    operation_id: &'a str,
    armed: bool,
}

impl Drop for WaitRegistration<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.manager.table.lock().waiting.remove(self.operation_id);
        }
    }
}

/// `from + after`, saturating to roughly thirty years out.
pub(crate) fn deadline_after(from: Instant, after: Duration) -> Instant {
    from.checked_add(after)
        .unwrap_or_else(|| from + Duration::from_secs(86_400 * 365 * 30))
}

/// Lock table shared by every agent of one tracker.
pub struct LockManager {
    table: Mutex<LockTable>,
    changed: Notify,
    next_id: AtomicU64,
    lease: Duration,
}

impl LockManager {
    /// Manager whose locks expire `lease` after acquisition.
    pub fn new(lease: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            changed: Notify::new(),
            next_id: AtomicU64::new(1),
            lease,
        }
    }

    /// Acquire a lock on `agent_id` for `operation_id`, waiting up to `timeout`.
    ///
    /// On `Deadlock` or `LockTimeout` every lock held by `operation_id` is
    /// released before the error is returned. Dropping the returned future
    /// while it waits withdraws the wait without other side effects.
    pub async fn acquire(
        &self,
        agent_id: &str,
        mode: LockMode,
        operation_id: &str,
        timeout: Duration,
    ) -> StateResult<LockHandle> {
        let deadline = deadline_after(Instant::now(), timeout);
        let mut registration = WaitRegistration {
            manager: self,
            operation_id,
            armed: false,
        };

        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let now = Instant::now();
                let mut table = self.table.lock();
                if table.purge_expired(now) > 0 {
                    self.changed.notify_waiters();
                }

                let blockers = table.blockers(agent_id, mode, operation_id);
                if blockers.is_empty() {
                    table.waiting.remove(operation_id);
                    registration.armed = false;
                    let handle = self.grant(&mut table, agent_id, mode, operation_id);
                    debug!(agent_id, operation_id, %mode, lock_id = handle.id, "Lock granted");
                    return Ok(handle);
                }

                if let Some(cycle) = table.find_cycle(operation_id, &blockers) {
                    table.waiting.remove(operation_id);
                    registration.armed = false;
                    let released = table.release_operation(operation_id);
                    drop(table);
                    self.changed.notify_waiters();
                    warn!(
                        agent_id,
                        operation_id,
                        ?cycle,
                        ?released,
                        "Deadlock detected, aborted operation and released its locks"
                    );
                    return Err(StateError::Deadlock {
                        agent_id: agent_id.to_string(),
                        operation_id: operation_id.to_string(),
                        cycle,
                    });
                }

                if now >= deadline {
                    table.waiting.remove(operation_id);
                    registration.armed = false;
                    let released = table.release_operation(operation_id);
                    drop(table);
                    self.changed.notify_waiters();
                    warn!(
                        agent_id,
                        operation_id,
                        timeout_ms = timeout.as_millis() as u64,
                        ?released,
                        "Lock timeout, aborted operation and released its locks"
                    );
                    return Err(StateError::LockTimeout {
                        agent_id: agent_id.to_string(),
                        operation_id: operation_id.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }

                table.waiting.insert(
                    operation_id.to_string(),
                    Waiting {
                        agent_id: agent_id.to_string(),
                        mode,
                    },
                );
                registration.armed = true;

                table
                    .earliest_expiry(agent_id)
                    .map_or(deadline, |expiry| expiry.min(deadline))
            };

            // Woken by a release or by the timer; either way re-check.
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    fn grant(
        &self,
        table: &mut LockTable,
        agent_id: &str,
        mode: LockMode,
        operation_id: &str,
    ) -> LockHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let acquired_at = Utc::now();
        let expires_at = chrono::Duration::from_std(self.lease)
            .ok()
            .and_then(|lease| acquired_at.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let info = LockInfo {
            agent_id: agent_id.to_string(),
            holder_operation_id: operation_id.to_string(),
            mode,
            acquired_at,
            expires_at,
        };
        let expires = deadline_after(Instant::now(), self.lease);
        let released = Arc::new(AtomicBool::new(false));

        table
            .held
            .entry(agent_id.to_string())
            .or_default()
            .push(HeldLock {
                id,
                info: info.clone(),
                expires,
                released: Arc::clone(&released),
            });

        LockHandle {
            id,
            info,
            expires,
            released,
        }
    }

    /// Release a lock. Releasing twice is a no-op.
    pub fn release(&self, handle: &LockHandle) {
        if handle.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut table = self.table.lock();
        if let Some(locks) = table.held.get_mut(handle.agent_id()) {
            locks.retain(|lock| lock.id != handle.id);
            if locks.is_empty() {
                table.held.remove(handle.agent_id());
            }
        }
        drop(table);
        self.changed.notify_waiters();
        debug!(
            agent_id = handle.agent_id(),
            operation_id = handle.operation_id(),
            lock_id = handle.id,
            "Lock released"
        );
    }

    /// Release every lock held by `operation_id`. Returns the affected agents.
    pub fn release_all(&self, operation_id: &str) -> Vec<AgentId> {
        let released = self.table.lock().release_operation(operation_id);
        if !released.is_empty() {
            self.changed.notify_waiters();
            info!(operation_id, ?released, "Released all locks of operation");
        }
        released
    }

    /// Live locks on `agent_id`.
    pub fn held_locks(&self, agent_id: &str) -> Vec<LockInfo> {
        let now = Instant::now();
        self.table
            .lock()
            .held
            .get(agent_id)
            .into_iter()
            .flatten()
            .filter(|lock| lock.expires > now)
            .map(|lock| lock.info.clone())
            .collect()
    }

    /// Operations currently blocked in `acquire`.
    pub fn waiting_operations(&self) -> Vec<OperationId> {
        let mut ops: Vec<OperationId> = self.table.lock().waiting.keys().cloned().collect();
        ops.sort();
        ops
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("LockManager")
            .field("locked_agents", &table.held.len())
            .field("waiting", &table.waiting.len())
            .field("lease", &self.lease)
            .finish()
    }
}
