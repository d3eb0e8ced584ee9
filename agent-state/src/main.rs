//! Operator binary for the agent state core
//!
//! Runs end-to-end scenarios against an in-memory backend and prints a JSON
//! summary on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! agent-state pipeline
//! agent-state contention --operations 200
//! RUST_LOG=agent_state=debug agent-state deadlock --config tracker.toml
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_state::{
    telemetry, AgentStateTracker, FieldMutation, LockMode, StateError, StateTag, TrackerConfig,
    Value, PIPELINE_AGENT_TYPE,
};
use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde_json::json;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario to run
    #[arg(value_enum)]
    scenario: Scenario,

    /// TOML tracker config (defaults, then AGENT_STATE_* env vars, otherwise)
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Concurrent operations for the contention scenario
    #[arg(long, default_value_t = 100)]
    operations: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Walk one agent through the standard pipeline
    Pipeline,
    /// Concurrent mixed updates against one agent
    Contention,
    /// Checkpoint, fail, roll back, resume
    Checkpoint,
    /// Conflicting lock orders across agents
    Deadlock,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    telemetry::init_tracing("agent_state=info");

    let config = match &args.config {
        Some(path) => TrackerConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TrackerConfig::from_env(),
    };
    let tracker = AgentStateTracker::in_memory(config)
        .context("building tracker")?
        .shared();

    let summary = match args.scenario {
        Scenario::Pipeline => pipeline(&tracker).await?,
        Scenario::Contention => contention(&tracker, args.operations).await?,
        Scenario::Checkpoint => checkpoint(&tracker).await?,
        Scenario::Deadlock => deadlock(&tracker).await?,
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

async fn pipeline(tracker: &AgentStateTracker) -> Result<serde_json::Value> {
    use StateTag::*;

    tracker.create_agent("a1", PIPELINE_AGENT_TYPE, None)?;
    for to in [CollectingData, Analyzing, Optimizing, Reporting, Completed] {
        tracker.transition_agent_state("a1", to, "pipeline").await?;
    }
    let rejected = tracker
        .transition_agent_state("a1", CollectingData, "pipeline")
        .await
        .err()
        .map(|e| e.kind());

    let state = tracker.get_agent_state("a1")?;
    Ok(json!({
        "scenario": "pipeline",
        "final_state": state.current_state,
        "version": state.version,
        "transitions": state.history.len(),
        "rejected_restart": rejected,
    }))
}

async fn contention(tracker: &Arc<AgentStateTracker>, operations: usize) -> Result<serde_json::Value> {
    tracker.create_agent("shared", PIPELINE_AGENT_TYPE, None)?;
    let started = Instant::now();

    let tasks: Vec<_> = (0..operations)
        .map(|i| {
            let tracker = Arc::clone(tracker);
            tokio::spawn(async move {
                let op = AgentStateTracker::new_operation_id();
                let mutations = match i % 4 {
                    0 => vec![
                        FieldMutation::increment("counter", 1),
                        FieldMutation::increment("operation_count", 1),
                    ],
                    1 => vec![FieldMutation::accumulate("total", 0.5)],
                    2 => vec![FieldMutation::append("items", i as i64)],
                    _ => {
                        let version = tracker.get_agent_state("shared")?.version;
                        return tracker
                            .compare_and_update_agent_state(
                                "shared",
                                version,
                                &[FieldMutation::set("last_writer", i as i64)],
                                &op,
                            )
                            .map(|_| i % 4);
                    }
                };
                tracker
                    .batch_update_agent_state("shared", &mutations, &op)
                    .await
                    .map(|_| i % 4)
            })
        })
        .collect();

    let mut succeeded = 0usize;
    let mut increments = 0i64;
    for result in futures::future::join_all(tasks).await {
        match result? {
            Ok(kind) => {
                succeeded += 1;
                if kind == 0 {
                    increments += 1;
                }
            }
            Err(e) => tracing::warn!(error = %e, "Contention operation failed"),
        }
    }

    let state = tracker.get_agent_state("shared")?;
    let operation_count = state
        .data
        .get("operation_count")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    Ok(json!({
        "scenario": "contention",
        "operations": operations,
        "succeeded": succeeded,
        "success_rate": succeeded as f64 / operations.max(1) as f64,
        "successful_increments": increments,
        "operation_count": operation_count,
        "version": state.version,
        "elapsed_ms": started.elapsed().as_millis() as u64,
    }))
}

async fn checkpoint(tracker: &AgentStateTracker) -> Result<serde_json::Value> {
    use StateTag::*;

    tracker.create_agent("a1", PIPELINE_AGENT_TYPE, None)?;
    tracker.transition_agent_state("a1", CollectingData, "cp").await?;
    tracker
        .update_agent_state_data("a1", FieldMutation::set("records", 120), "cp")
        .await?;
    tracker.create_checkpoint("a1", "data_complete", "cp").await?;

    tracker.transition_agent_state("a1", Analyzing, "cp").await?;
    tracker
        .update_agent_state_data("a1", FieldMutation::set("analysis_progress", 0.5), "cp")
        .await?;
    tracker.create_checkpoint("a1", "analysis_halfway", "cp").await?;
    tracker
        .update_agent_state_data("a1", FieldMutation::set("analysis_progress", 1.0), "cp")
        .await?;
    tracker.create_checkpoint("a1", "analysis_complete", "cp").await?;

    tracker.transition_agent_state("a1", Optimizing, "cp").await?;
    tracker
        .update_agent_state_data("a1", FieldMutation::set("optimizer_scratch", true), "cp")
        .await?;
    tracker.transition_agent_state("a1", Error, "cp").await?;

    let rollback = tracker
        .rollback_to_checkpoint("a1", "analysis_complete", "cp")
        .await?;
    tracker.transition_agent_state("a1", Optimizing, "cp").await?;

    let state = tracker.get_agent_state("a1")?;
    Ok(json!({
        "scenario": "checkpoint",
        "rolled_back_to": rollback.checkpoint.name,
        "final_state": state.current_state,
        "analysis_progress": state.data.get("analysis_progress").and_then(Value::as_f64),
        "scratch_removed": !state.data.contains_key("optimizer_scratch"),
        "checkpoints": tracker.get_checkpoint_history("a1")?,
    }))
}

async fn deadlock(tracker: &Arc<AgentStateTracker>) -> Result<serde_json::Value> {
    let agents = ["x", "y", "z"];
    for agent in agents {
        tracker.create_agent(agent, PIPELINE_AGENT_TYPE, None)?;
    }
    let timeout = tracker.config().lock_timeout();
    let started = Instant::now();

    let tasks: Vec<_> = (0..agents.len())
        .map(|i| {
            let tracker = Arc::clone(tracker);
            let first = agents[i];
            let second = agents[(i + 1) % agents.len()];
            tokio::spawn(async move {
                let op = format!("op-{}", i);
                let a = tracker
                    .acquire_agent_lock(first, LockMode::Exclusive, &op, None)
                    .await?;
                tokio::time::sleep(Duration::from_millis(20)).await;
                let b = tracker
                    .acquire_agent_lock(second, LockMode::Exclusive, &op, None)
                    .await?;
                tracker.release_agent_lock(&b);
                tracker.release_agent_lock(&a);
                Ok::<_, StateError>(())
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for result in futures::future::join_all(tasks).await {
        outcomes.push(match result? {
            Ok(()) => "ok",
            Err(e) => e.kind(),
        });
    }
    let elapsed = started.elapsed();

    let health = tracker
        .update_agent_state_data("x", FieldMutation::set("health_check", true), "health")
        .await
        .is_ok();

    Ok(json!({
        "scenario": "deadlock",
        "outcomes": outcomes,
        "elapsed_ms": elapsed.as_millis() as u64,
        "within_bound": elapsed <= timeout * 2,
        "health_check": health,
    }))
}
