//! Persist/recover across tracker instances and backend failure handling

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_state::{
    AgentStateTracker, CompressionConfig, DurableBackend, FieldMutation, MemoryBackend,
    PersistenceConfig, PersistenceError, StateError, StateTag, TrackerConfig, TransitionTable,
    Value, PIPELINE_AGENT_TYPE,
};
use async_trait::async_trait;
use tokio::sync::Notify;
use StateTag::*;

fn tracker_over(backend: Arc<dyn DurableBackend>, config: TrackerConfig) -> AgentStateTracker {
    AgentStateTracker::new(config, TransitionTable::standard(), backend).unwrap()
}

/// Backend that never answers within any sane timeout.
struct SlowBackend;

#[async_trait]
impl DurableBackend for SlowBackend {
    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(None)
    }

    async fn set(
        &self,
        _key: &str,
        _value: Vec<u8>,
        _ttl: Option<Duration>,
    ) -> Result<(), PersistenceError> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }

    async fn delete(&self, _key: &str) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Memory backend whose first `set` waits until released.
struct StallFirstWrite {
    inner: Arc<MemoryBackend>,
    stalled: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl StallFirstWrite {
    fn new(inner: Arc<MemoryBackend>) -> Self {
        Self {
            inner,
            stalled: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl DurableBackend for StallFirstWrite {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), PersistenceError> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        self.inner.delete(key).await
    }
}

#[tokio::test]
async fn test_recover_in_fresh_tracker() {
    let backend = MemoryBackend::new().shared();

    let first = tracker_over(backend.clone(), TrackerConfig::default());
    first.create_agent("a1", PIPELINE_AGENT_TYPE, None).unwrap();
    first
        .transition_agent_state("a1", CollectingData, "op")
        .await
        .unwrap();
    first
        .batch_update_agent_state(
            "a1",
            &[
                FieldMutation::set("source", "crm"),
                FieldMutation::append("rows", 1),
                FieldMutation::append("rows", 2),
            ],
            "op",
        )
        .await
        .unwrap();
    first.create_checkpoint("a1", "loaded", "op").await.unwrap();
    let report = first.persist_agent_state("a1").await.unwrap();
    let before = first.get_agent_state("a1").unwrap();
    assert_eq!(report.version, before.version);
    drop(first);

    let second = tracker_over(backend, TrackerConfig::default());
    let recovered = second.recover_agent_state("a1").await.unwrap();
    assert_eq!(recovered.current_state, before.current_state);
    assert_eq!(recovered.version, before.version);
    assert_eq!(recovered.data, before.data);
    assert_eq!(recovered.history, before.history);
    assert_eq!(recovered.checkpoints.len(), 1);

    // The recovered agent keeps working: legal transition, then rollback.
    second
        .transition_agent_state("a1", Analyzing, "op")
        .await
        .unwrap();
    second
        .rollback_to_checkpoint("a1", "loaded", "op")
        .await
        .unwrap();
    assert_eq!(
        second.get_agent_state("a1").unwrap().current_state,
        CollectingData
    );
}

#[tokio::test]
async fn test_recover_missing_and_resident() {
    let tracker = AgentStateTracker::in_memory(TrackerConfig::default()).unwrap();
    let err = tracker.recover_agent_state("ghost").await.unwrap_err();
    assert!(matches!(err, StateError::NotFound { .. }));

    tracker.create_agent("a1", PIPELINE_AGENT_TYPE, None).unwrap();
    tracker.persist_agent_state("a1").await.unwrap();
    let err = tracker.recover_agent_state("a1").await.unwrap_err();
    assert!(matches!(err, StateError::AgentExists { .. }));
}

#[tokio::test]
async fn test_slow_backend_times_out_and_tracker_stays_usable() {
    let config = TrackerConfig::default().with_persistence(PersistenceConfig {
        timeout_ms: 100,
        ..PersistenceConfig::default()
    });
    let tracker = tracker_over(Arc::new(SlowBackend), config);
    tracker.create_agent("a1", PIPELINE_AGENT_TYPE, None).unwrap();

    let started = std::time::Instant::now();
    let err = tracker.persist_agent_state("a1").await.unwrap_err();
    assert!(matches!(
        err,
        StateError::Persistence(PersistenceError::Timeout { .. })
    ));
    assert!(started.elapsed() < Duration::from_secs(5));

    tracker
        .transition_agent_state("a1", CollectingData, "op")
        .await
        .unwrap();
    tracker
        .update_agent_state_data("a1", FieldMutation::set("still", "alive"), "op")
        .await
        .unwrap();
    assert_eq!(tracker.get_agent_state("a1").unwrap().version, 2);
}

#[tokio::test]
async fn test_backend_outage_keeps_memory_state() {
    let backend = MemoryBackend::new().shared();
    let tracker = tracker_over(backend.clone(), TrackerConfig::default());
    tracker.create_agent("a1", PIPELINE_AGENT_TYPE, None).unwrap();

    backend.set_available(false);
    let err = tracker.persist_agent_state("a1").await.unwrap_err();
    assert!(matches!(
        err,
        StateError::Persistence(PersistenceError::Backend { .. })
    ));
    assert!(err.recovery_suggestion().is_some());
    tracker
        .update_agent_state_data("a1", FieldMutation::increment("n", 1), "op")
        .await
        .unwrap();

    backend.set_available(true);
    let report = tracker.persist_agent_state("a1").await.unwrap();
    assert_eq!(report.version, 1);
    assert_eq!(backend.keys().len(), 1);
}

#[tokio::test]
async fn test_compressed_update_round_trips() {
    let backend = MemoryBackend::new().shared();
    let config = TrackerConfig::default().with_compression(CompressionConfig {
        level: 6,
        min_size_bytes: 0,
    });
    let tracker = tracker_over(backend.clone(), config.clone());
    tracker.create_agent("a1", PIPELINE_AGENT_TYPE, None).unwrap();

    let blob = "lorem ipsum ".repeat(500);
    let report = tracker
        .update_agent_state_with_compression("a1", &[FieldMutation::set("blob", blob.as_str())], "op")
        .await
        .unwrap();
    assert!(report.compressed);
    assert!(report.stored_bytes < report.original_bytes);
    assert!(report.compression_ratio() > 1.0);

    let fresh = tracker_over(backend, config);
    let recovered = fresh.recover_agent_state("a1").await.unwrap();
    assert_eq!(
        recovered.data.get("blob").and_then(Value::as_str),
        Some(blob.as_str())
    );
}

#[tokio::test]
async fn test_compressed_update_requires_compression() {
    let tracker = AgentStateTracker::in_memory(TrackerConfig::default()).unwrap();
    tracker.create_agent("a1", PIPELINE_AGENT_TYPE, None).unwrap();
    let err = tracker
        .update_agent_state_with_compression("a1", &[FieldMutation::set("k", 1)], "op")
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::Validation { .. }));
    assert_eq!(tracker.get_agent_state("a1").unwrap().version, 0);
}

#[tokio::test]
async fn test_overlapping_persists_keep_the_newest_snapshot() {
    let memory = MemoryBackend::new().shared();
    let backend = Arc::new(StallFirstWrite::new(memory.clone()));
    let tracker = Arc::new(tracker_over(backend.clone(), TrackerConfig::default()));
    tracker.create_agent("a1", PIPELINE_AGENT_TYPE, None).unwrap();
    tracker
        .update_agent_state_data("a1", FieldMutation::set("k", "old"), "op")
        .await
        .unwrap();

    let slow = {
        let tracker = Arc::clone(&tracker);
        tokio::spawn(async move { tracker.persist_agent_state("a1").await })
    };
    backend.entered.notified().await;

    tracker
        .update_agent_state_data("a1", FieldMutation::set("k", "new"), "op")
        .await
        .unwrap();
    tracker.transition_agent_state("a1", Error, "op").await.unwrap();
    let fast = {
        let tracker = Arc::clone(&tracker);
        tokio::spawn(async move { tracker.persist_agent_state("a1").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    backend.release.notify_one();

    assert_eq!(slow.await.unwrap().unwrap().version, 1);
    assert_eq!(fast.await.unwrap().unwrap().version, 3);
    tracker.evict_agent("a1").unwrap();

    let fresh = tracker_over(memory, TrackerConfig::default());
    let recovered = fresh.recover_agent_state("a1").await.unwrap();
    assert_eq!(recovered.version, 3);
    assert_eq!(recovered.current_state, Error);
    assert_eq!(recovered.data.get("k").and_then(Value::as_str), Some("new"));
}

#[tokio::test]
async fn test_non_finite_floats_never_reach_a_snapshot() {
    let backend = MemoryBackend::new().shared();
    let tracker = tracker_over(backend.clone(), TrackerConfig::default());
    tracker.create_agent("a1", PIPELINE_AGENT_TYPE, None).unwrap();
    tracker
        .update_agent_state_data("a1", FieldMutation::accumulate("total", 1.5), "op")
        .await
        .unwrap();

    for mutation in [
        FieldMutation::accumulate("total", f64::INFINITY),
        FieldMutation::accumulate("total", f64::MAX),
        FieldMutation::set("ratio", f64::NAN),
    ] {
        let err = tracker
            .update_agent_state_data("a1", mutation, "op")
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Validation { .. }));
    }
    let closure = tracker
        .update_agent_state_with("a1", "op", |data| {
            data.insert("nested".into(), Value::from(vec![f64::NEG_INFINITY]));
            Ok(())
        })
        .await;
    assert!(matches!(closure, Err(StateError::Validation { .. })));
    assert_eq!(tracker.get_agent_state("a1").unwrap().version, 1);

    tracker.persist_agent_state("a1").await.unwrap();
    tracker.transition_agent_state("a1", Error, "op").await.unwrap();
    tracker.persist_agent_state("a1").await.unwrap();
    tracker.evict_agent("a1").unwrap();

    let fresh = tracker_over(backend, TrackerConfig::default());
    let recovered = fresh.recover_agent_state("a1").await.unwrap();
    assert_eq!(recovered.data.get("total"), Some(&Value::Float(1.5)));
    fresh
        .update_agent_state_data("a1", FieldMutation::accumulate("total", 1.0), "op")
        .await
        .unwrap();
    assert_eq!(
        fresh.get_agent_state("a1").unwrap().data.get("total"),
        Some(&Value::Float(2.5))
    );
}
