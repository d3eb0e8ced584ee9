//! Parent/child coordination through the tracker
//!
//! - Terminal gate on parents with live children
//! - Parent notifications and child result merging
//! - Eviction of persisted terminal children
//! - Event stream for a small pipeline run

use std::collections::BTreeMap;

use agent_state::{
    AgentStateTracker, EventFilter, StateError, StateEvent, StateTag, TrackerConfig, Value,
    PIPELINE_AGENT_TYPE,
};
use StateTag::*;

const TO_REPORTING: [StateTag; 4] = [CollectingData, Analyzing, Optimizing, Reporting];

async fn walk(tracker: &AgentStateTracker, agent_id: &str, steps: &[StateTag], notify: bool) {
    for to in steps {
        tracker
            .transition_agent_state_with(agent_id, to.clone(), "walk", notify)
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_parent_waits_for_children() {
    let tracker = AgentStateTracker::in_memory(TrackerConfig::default()).unwrap();
    tracker.create_agent("parent", PIPELINE_AGENT_TYPE, None).unwrap();
    tracker
        .create_agent("child-1", PIPELINE_AGENT_TYPE, Some("parent"))
        .unwrap();
    tracker
        .create_agent("child-2", PIPELINE_AGENT_TYPE, Some("parent"))
        .unwrap();

    let hierarchy = tracker.get_agent_hierarchy("parent").unwrap();
    assert_eq!(
        hierarchy.children_ids.iter().cloned().collect::<Vec<_>>(),
        vec!["child-1", "child-2"]
    );
    assert_eq!(
        tracker.get_agent_hierarchy("child-1").unwrap().parent_id.as_deref(),
        Some("parent")
    );

    walk(&tracker, "parent", &TO_REPORTING, false).await;
    let err = tracker
        .transition_agent_state("parent", Completed, "gate")
        .await
        .unwrap_err();
    match err {
        StateError::ChildrenPending { pending, .. } => {
            assert_eq!(pending, vec!["child-1", "child-2"]);
        }
        other => panic!("expected ChildrenPending, got {other}"),
    }
    assert_eq!(
        tracker.get_agent_state("parent").unwrap().current_state,
        Reporting
    );

    // child-1 runs to completion and reports back.
    walk(&tracker, "child-1", &TO_REPORTING, false).await;
    walk(&tracker, "child-1", &[Completed], true).await;
    let notification = tracker.check_parent_notifications("parent").unwrap();
    assert_eq!(notification.child_id, "child-1");
    assert_eq!(notification.to, Completed);
    assert!(tracker.check_parent_notifications("parent").is_none());

    let mut result = BTreeMap::new();
    result.insert("score".to_string(), Value::from(0.9));
    let completion = tracker
        .process_child_completion("parent", "child-1", Value::Map(result), "collect")
        .await
        .unwrap();
    assert!(!completion.all_children_terminal);
    assert_eq!(completion.pending_children, vec!["child-2"]);

    let data = tracker.get_agent_state("parent").unwrap().data;
    let score = data
        .get("child_results")
        .and_then(Value::as_map)
        .and_then(|m| m.get("child-1"))
        .and_then(Value::as_map)
        .and_then(|m| m.get("score"))
        .and_then(Value::as_f64);
    assert_eq!(score, Some(0.9));

    // child-2 is abandoned; the parent no longer waits for it.
    tracker.ignore_child("parent", "child-2").unwrap();
    tracker
        .transition_agent_state("parent", Completed, "gate")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_parent_may_fail_with_live_children() {
    let tracker = AgentStateTracker::in_memory(TrackerConfig::default()).unwrap();
    tracker.create_agent("parent", PIPELINE_AGENT_TYPE, None).unwrap();
    tracker
        .create_agent("child", PIPELINE_AGENT_TYPE, Some("parent"))
        .unwrap();

    tracker
        .transition_agent_state("parent", Error, "abort")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_non_child_rejected() {
    let tracker = AgentStateTracker::in_memory(TrackerConfig::default()).unwrap();
    tracker.create_agent("parent", PIPELINE_AGENT_TYPE, None).unwrap();
    tracker.create_agent("stranger", PIPELINE_AGENT_TYPE, None).unwrap();

    let err = tracker
        .process_child_completion("parent", "stranger", Value::Null, "op")
        .await
        .unwrap_err();
    assert!(matches!(err, StateError::Validation { .. }));
    let err = tracker.ignore_child("parent", "stranger").unwrap_err();
    assert!(matches!(err, StateError::Validation { .. }));

    let err = tracker
        .create_agent("orphan", PIPELINE_AGENT_TYPE, Some("missing"))
        .unwrap_err();
    assert!(matches!(err, StateError::AgentNotFound { .. }));
}

#[tokio::test]
async fn test_evicted_child_no_longer_blocks() {
    let tracker = AgentStateTracker::in_memory(TrackerConfig::default()).unwrap();
    tracker.create_agent("parent", PIPELINE_AGENT_TYPE, None).unwrap();
    tracker
        .create_agent("child", PIPELINE_AGENT_TYPE, Some("parent"))
        .unwrap();

    let err = tracker.evict_agent("child").unwrap_err();
    assert!(matches!(err, StateError::Validation { .. }));

    walk(&tracker, "child", &TO_REPORTING, false).await;
    walk(&tracker, "child", &[Completed], false).await;
    let err = tracker.evict_agent("child").unwrap_err();
    assert!(matches!(err, StateError::Validation { .. }));

    tracker.persist_agent_state("child").await.unwrap();
    tracker.evict_agent("child").unwrap();
    assert!(matches!(
        tracker.get_agent_state("child"),
        Err(StateError::AgentNotFound { .. })
    ));

    walk(&tracker, "parent", &TO_REPORTING, false).await;
    walk(&tracker, "parent", &[Completed], false).await;

    let recovered = tracker.recover_agent_state("child").await.unwrap();
    assert_eq!(recovered.current_state, Completed);
    assert_eq!(recovered.parent_id.as_deref(), Some("parent"));
}

#[tokio::test]
async fn test_event_stream_for_agent() {
    let tracker = AgentStateTracker::in_memory(TrackerConfig::default()).unwrap();
    let mut events = tracker
        .event_bus()
        .subscribe_filtered(EventFilter::new().agent("a1"));

    tracker.create_agent("a0", PIPELINE_AGENT_TYPE, None).unwrap();
    tracker.create_agent("a1", PIPELINE_AGENT_TYPE, None).unwrap();
    tracker
        .transition_agent_state("a1", CollectingData, "op")
        .await
        .unwrap();
    tracker.create_checkpoint("a1", "cp", "op").await.unwrap();

    assert!(matches!(
        events.recv().await.unwrap(),
        StateEvent::AgentCreated { agent_id, .. } if agent_id == "a1"
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        StateEvent::Transitioned { to: CollectingData, version: 1, .. }
    ));
    assert!(matches!(
        events.recv().await.unwrap(),
        StateEvent::CheckpointCreated { sequence: 1, .. }
    ));
}
