//! Concurrent writers and lock-order conflicts through the tracker
//!
//! - 100 mixed writers against one agent, with and without locking
//! - Ring-ordered exclusive locks across agents heal without a hang
//! - Version monotonicity under concurrent commits
//! - Unbounded lock timeouts and leases saturate instead of overflowing

use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_state::{
    AgentStateTracker, FieldMutation, LockMode, LockingMode, StateError, TrackerConfig, Value,
    PIPELINE_AGENT_TYPE,
};

const OPERATIONS: usize = 100;

fn shared_tracker(config: TrackerConfig) -> Arc<AgentStateTracker> {
    AgentStateTracker::in_memory(config).unwrap().shared()
}

/// One of four write kinds. CAS writers re-read and retry a bounded number
/// of times, like any optimistic caller would.
async fn mixed_write(tracker: &AgentStateTracker, i: usize) -> Result<usize, StateError> {
    let op = AgentStateTracker::new_operation_id();
    let kind = i % 4;
    let mutations = match kind {
        0 => vec![
            FieldMutation::increment("counter", 1),
            FieldMutation::increment("operation_count", 1),
        ],
        1 => vec![FieldMutation::accumulate("total", 0.5)],
        2 => vec![FieldMutation::append("items", i as i64)],
        _ => {
            let mut last = None;
            for _ in 0..32 {
                let version = tracker.get_agent_state("shared")?.version;
                match tracker.compare_and_update_agent_state(
                    "shared",
                    version,
                    &[FieldMutation::set("last_writer", i as i64)],
                    &op,
                ) {
                    Ok(_) => return Ok(kind),
                    Err(e @ StateError::VersionConflict { .. }) => {
                        last = Some(e);
                        tokio::task::yield_now().await;
                    }
                    Err(e) => return Err(e),
                }
            }
            return Err(last.unwrap_or_else(|| StateError::validation("no attempt made")));
        }
    };
    tracker
        .batch_update_agent_state("shared", &mutations, &op)
        .await
        .map(|_| kind)
}

async fn run_contention(tracker: Arc<AgentStateTracker>) {
    tracker
        .create_agent("shared", PIPELINE_AGENT_TYPE, None)
        .unwrap();

    let tasks: Vec<_> = (0..OPERATIONS)
        .map(|i| {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move { mixed_write(&tracker, i).await })
        })
        .collect();

    let mut succeeded = 0;
    let mut increments = 0;
    let mut appends = 0;
    let mut accumulates = 0;
    for result in futures::future::join_all(tasks).await {
        if let Ok(kind) = result.unwrap() {
            succeeded += 1;
            match kind {
                0 => increments += 1,
                1 => accumulates += 1,
                2 => appends += 1,
                _ => {}
            }
        }
    }

    assert!(
        succeeded * 10 >= OPERATIONS * 9,
        "only {succeeded}/{OPERATIONS} operations succeeded"
    );

    let state = tracker.get_agent_state("shared").unwrap();
    let operation_count = state
        .data
        .get("operation_count")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    assert!(operation_count <= increments);
    assert_eq!(
        state.data.get("counter").and_then(Value::as_i64),
        state.data.get("operation_count").and_then(Value::as_i64)
    );
    assert_eq!(
        state
            .data
            .get("items")
            .and_then(Value::as_list)
            .map_or(0, <[Value]>::len),
        appends
    );
    let total = state.data.get("total").and_then(Value::as_f64).unwrap_or(0.0);
    assert!((total - accumulates as f64 * 0.5).abs() < 1e-9);
    assert_eq!(state.version as usize, succeeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contention_with_locking() {
    run_contention(shared_tracker(TrackerConfig::default())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_contention_without_locking() {
    let config = TrackerConfig {
        max_cas_retries: 64,
        ..TrackerConfig::default().with_locking(LockingMode::Disabled)
    };
    run_contention(shared_tracker(config)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ring_lock_order_self_heals() {
    let timeout = Duration::from_millis(500);
    let tracker = shared_tracker(TrackerConfig::default().with_lock_timeout(timeout));
    let agents = ["x", "y", "z"];
    for agent in agents {
        tracker.create_agent(agent, PIPELINE_AGENT_TYPE, None).unwrap();
    }

    let started = Instant::now();
    let tasks: Vec<_> = (0..agents.len())
        .map(|i| {
            let tracker = Arc::clone(&tracker);
            let first = agents[i];
            let second = agents[(i + 1) % agents.len()];
            tokio::spawn(async move {
                let op = format!("op-{i}");
                let a = tracker
                    .acquire_agent_lock(first, LockMode::Exclusive, &op, None)
                    .await?;
                tokio::time::sleep(Duration::from_millis(50)).await;
                let b = tracker
                    .acquire_agent_lock(second, LockMode::Exclusive, &op, None)
                    .await?;
                tracker.update_agent_state_under_lock(&a, &[FieldMutation::increment("n", 1)])?;
                tracker.release_agent_lock(&b);
                tracker.release_agent_lock(&a);
                Ok::<_, StateError>(())
            })
        })
        .collect();

    let outcomes: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    let elapsed = started.elapsed();

    assert!(elapsed <= timeout * 2, "took {elapsed:?}");
    assert!(outcomes.iter().any(Result::is_ok));
    for outcome in &outcomes {
        if let Err(e) = outcome {
            assert!(
                matches!(e, StateError::Deadlock { .. } | StateError::LockTimeout { .. }),
                "unexpected error {e}"
            );
        }
    }

    // Every lock was released one way or another.
    for agent in agents {
        assert!(tracker.lock_manager().held_locks(agent).is_empty());
    }
    tracker
        .update_agent_state_data("x", FieldMutation::set("health_check", true), "health")
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_versions_strictly_increase() {
    let tracker = shared_tracker(TrackerConfig::default());
    tracker.create_agent("a1", PIPELINE_AGENT_TYPE, None).unwrap();

    // Distinct operations: a shared id would re-enter one lock instead of
    // contending for it.
    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                let op = format!("writer-{}", i);
                tracker
                    .update_agent_state_data("a1", FieldMutation::increment("n", 1), &op)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut versions: Vec<u64> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    versions.sort_unstable();
    assert_eq!(versions, (1..=50).collect::<Vec<u64>>());

    let state = tracker.get_agent_state("a1").unwrap();
    assert_eq!(state.version, 50);
    assert_eq!(state.data.get("n").and_then(Value::as_i64), Some(50));
}

#[tokio::test]
async fn test_unbounded_lock_timeout_and_lease() {
    let config = TrackerConfig {
        lock_lease_ms: u64::MAX,
        ..TrackerConfig::default()
    };
    let tracker = shared_tracker(config);
    tracker.create_agent("a1", PIPELINE_AGENT_TYPE, None).unwrap();

    tracker
        .update_agent_state_data("a1", FieldMutation::set("k", 1), "op-1")
        .await
        .unwrap();

    let handle = tracker
        .acquire_agent_lock("a1", LockMode::Exclusive, "op-2", Some(Duration::MAX))
        .await
        .unwrap();
    assert!(!handle.is_released());
    let version = tracker
        .update_agent_state_under_lock(&handle, &[FieldMutation::set("k", 2)])
        .unwrap();
    assert_eq!(version, 2);

    tracker.release_agent_lock(&handle);
    assert!(tracker.lock_manager().held_locks("a1").is_empty());
}
