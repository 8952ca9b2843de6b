//! Allocation observability metrics
//!
//! Provides Prometheus-compatible metrics for:
//! - Reroute requests and their duration
//! - Allocation command outcomes
//! - Shard lifecycle events (started/failed) and automatic placements
//! - Published cluster state (version, nodes, shard states, health)

use crate::health::ClusterHealth;
use crate::routing::ShardRoutingState;
use crate::state::ClusterState;
use std::time::{Duration, Instant};

/// Record a reroute request and its duration
pub fn record_reroute(dry_run: bool, success: bool, duration: Duration) {
    let status = if success { "ok" } else { "error" };
    let mode = if dry_run { "dry_run" } else { "commit" };
    metrics::counter!(
        "shardline_reroute_total",
        "mode" => mode,
        "status" => status,
    )
    .increment(1);

    metrics::histogram!("shardline_reroute_duration_seconds", "mode" => mode)
        .record(duration.as_secs_f64());
}

/// Record the outcome of one allocation command (`ok` or an error type)
pub fn record_command(command: &str, outcome: &str) {
    metrics::counter!(
        "shardline_commands_total",
        "command" => command.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);

    if outcome != "ok" {
        metrics::counter!(
            "shardline_command_errors_total",
            "command" => command.to_string(),
            "error_type" => outcome.to_string(),
        )
        .increment(1);
    }
}

/// Record a shard lifecycle event reported through the confirmation channel
pub fn record_shard_event(event: &str) {
    metrics::counter!(
        "shardline_shard_events_total",
        "event" => event.to_string(),
    )
    .increment(1);
}

/// Record copies placed by the automatic allocation pass
pub fn record_shards_allocated(count: usize) {
    metrics::counter!("shardline_shards_allocated_total").increment(count as u64);
}

/// Record a cluster task processed by the service worker
pub fn record_cluster_task(task: &str, duration: Duration) {
    metrics::counter!(
        "shardline_cluster_tasks_total",
        "task" => task.to_string(),
    )
    .increment(1);

    metrics::histogram!(
        "shardline_cluster_task_duration_seconds",
        "task" => task.to_string(),
    )
    .record(duration.as_secs_f64());
}

/// Update gauges from a freshly published state
pub fn update_cluster_state_metrics(state: &ClusterState) {
    metrics::gauge!("shardline_cluster_state_version").set(state.version() as f64);
    metrics::gauge!("shardline_cluster_nodes").set(state.nodes().len() as f64);
    metrics::gauge!("shardline_cluster_indices").set(state.metadata().len() as f64);

    for shard_state in [
        ShardRoutingState::Unassigned,
        ShardRoutingState::Initializing,
        ShardRoutingState::Started,
        ShardRoutingState::Relocating,
    ] {
        let count = state.routing_table().shards_with_state(shard_state).len();
        metrics::gauge!(
            "shardline_shards",
            "state" => shard_state.as_str(),
        )
        .set(count as f64);
    }

    update_health_metrics(&ClusterHealth::from_state(state, &[]));
}

/// Update the cluster status gauge
pub fn update_health_metrics(health: &ClusterHealth) {
    metrics::gauge!("shardline_cluster_status").set(health.status.value());
    metrics::gauge!("shardline_cluster_shards_unassigned").set(health.unassigned_shards() as f64);
}

/// Guard for timing cluster tasks
pub struct TaskTimer {
    task: &'static str,
    start: Instant,
}

impl TaskTimer {
    pub fn new(task: &'static str) -> Self {
        Self {
            task,
            start: Instant::now(),
        }
    }

    /// Record the task and its duration
    pub fn finish(self) {
        record_cluster_task(self.task, self.start.elapsed());
    }
}
