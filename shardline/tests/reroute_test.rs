//! End-to-end reroute scenario through the cluster service.
//!
//! One index with one shard and one replica on two nodes, automatic
//! allocation disabled, driven entirely by explicit commands and started
//! confirmations.

use shardline::{
    AllocationCommand, AllocationConfig, ClusterError, ClusterHealthStatus, ClusterService,
    ClusterState, DiscoveryNode, HealthRequest, IndexMetadata, RerouteOptions, ShardId,
    ShardRouting, ShardRoutingState, ShardlineConfig, StartedShard,
};
use std::sync::Arc;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn shard_id() -> ShardId {
    ShardId::new("test", 0)
}

async fn setup_cluster() -> ClusterService {
    let config = ShardlineConfig {
        allocation: AllocationConfig::disabled(),
        ..Default::default()
    };
    let (service, _worker) = ClusterService::start(&config, ClusterState::new("scenario"));
    service.add_node(DiscoveryNode::new("node1")).await.unwrap();
    service.add_node(DiscoveryNode::new("node2")).await.unwrap();
    service
        .create_index(IndexMetadata::new("test", 1, 1))
        .await
        .unwrap();
    service
}

fn unassigned(state: &ClusterState) -> usize {
    state
        .routing_table()
        .shards_with_state(ShardRoutingState::Unassigned)
        .len()
}

fn copies_on<'a>(state: &'a ClusterState, node: &str) -> Vec<&'a ShardRouting> {
    state
        .routing_table()
        .all_shards()
        .filter(|s| s.is_on(node))
        .collect()
}

// ---------------------------------------------------------------------------
// Scenario
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_allocate_move_and_wait_for_health() {
    let service = setup_cluster().await;
    assert_eq!(unassigned(&service.state()), 2);

    // Dry run: the preview shows the allocation, the cluster does not change
    let allocate = vec![AllocationCommand::allocate(shard_id(), "node1", true)];
    let before = service.state();
    let preview = service
        .reroute(allocate.clone(), RerouteOptions::dry_run())
        .await
        .unwrap();
    assert!(preview.dry_run);
    assert_eq!(unassigned(&preview.state), 1);
    assert_eq!(unassigned(&service.state()), 2);
    assert_eq!(service.state().version(), before.version());

    // Real run matches the preview
    let applied = service
        .reroute(allocate, RerouteOptions::default())
        .await
        .unwrap();
    assert_eq!(applied.state.routing_table(), preview.state.routing_table());
    let state = service.state();
    assert_eq!(state.version(), before.version() + 1);
    assert_eq!(unassigned(&state), 1);
    let on_node1 = copies_on(&state, "node1");
    assert_eq!(on_node1.len(), 1);
    assert!(on_node1[0].primary);
    assert_eq!(on_node1[0].state, ShardRoutingState::Initializing);

    // Confirmation starts the primary; the replica stays unassigned
    let state = service
        .shard_started(vec![StartedShard::new(shard_id(), "node1")])
        .await
        .unwrap();
    assert_eq!(copies_on(&state, "node1")[0].state, ShardRoutingState::Started);
    assert_eq!(unassigned(&state), 1);

    let health = service
        .health(
            &HealthRequest::new()
                .wait_for_status(ClusterHealthStatus::Yellow)
                .timeout(Duration::from_secs(5)),
        )
        .await;
    assert!(!health.timed_out);
    assert_eq!(health.status, ClusterHealthStatus::Yellow);

    // Move the primary to node2
    service
        .reroute(
            vec![AllocationCommand::move_shard(shard_id(), "node1", "node2")],
            RerouteOptions::default(),
        )
        .await
        .unwrap();
    let state = service.state();
    let source = copies_on(&state, "node1");
    assert_eq!(source[0].state, ShardRoutingState::Relocating);
    assert_eq!(source[0].relocating_node.as_deref(), Some("node2"));
    let target = copies_on(&state, "node2");
    assert_eq!(target[0].state, ShardRoutingState::Initializing);
    assert_eq!(target[0].relocating_node.as_deref(), Some("node1"));
    assert_eq!(unassigned(&state), 1);

    // While relocating, a short wait for zero relocations times out
    let health = service
        .health(
            &HealthRequest::new()
                .wait_for_relocating_shards(0)
                .timeout(Duration::from_millis(50)),
        )
        .await;
    assert!(health.timed_out);
    assert_eq!(health.relocating_shards(), 1);

    // A longer wait is released by the confirmation of the target
    let waiter = {
        let service = service.clone();
        tokio::spawn(async move {
            service
                .health(
                    &HealthRequest::new()
                        .wait_for_relocating_shards(0)
                        .timeout(Duration::from_secs(5)),
                )
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    let state = service
        .shard_started(vec![StartedShard::new(shard_id(), "node2")])
        .await
        .unwrap();
    let health = waiter.await.unwrap();
    assert!(!health.timed_out);
    assert_eq!(health.relocating_shards(), 0);

    assert!(copies_on(&state, "node1").is_empty());
    let moved = copies_on(&state, "node2");
    assert_eq!(moved.len(), 1);
    assert!(moved[0].primary);
    assert_eq!(moved[0].state, ShardRoutingState::Started);
    assert!(moved[0].relocating_node.is_none());
    assert_eq!(unassigned(&state), 1);

    // The replica never gets allocated, so green is never reached
    let health = service
        .health(
            &HealthRequest::new()
                .wait_for_status(ClusterHealthStatus::Green)
                .timeout(Duration::from_millis(50)),
        )
        .await;
    assert!(health.timed_out);
    assert_eq!(health.status, ClusterHealthStatus::Yellow);
}

#[tokio::test]
async fn test_failed_request_commits_nothing() {
    let service = setup_cluster().await;
    let before = service.state();

    let failure = service
        .reroute(
            vec![
                AllocationCommand::allocate(shard_id(), "node1", true),
                AllocationCommand::allocate(shard_id(), "node9", false),
            ],
            RerouteOptions {
                dry_run: false,
                explain: true,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(failure.error, ClusterError::NotFound(_)));
    assert_eq!(failure.explanations.len(), 2);
    assert!(Arc::ptr_eq(&failure.state, &before));
    assert!(Arc::ptr_eq(&service.state(), &before));
    assert_eq!(unassigned(&service.state()), 2);
}

#[tokio::test]
async fn test_cancel_relocation_restores_source() {
    let service = setup_cluster().await;
    service
        .reroute(
            vec![AllocationCommand::allocate(shard_id(), "node1", true)],
            RerouteOptions::default(),
        )
        .await
        .unwrap();
    service
        .shard_started(vec![StartedShard::new(shard_id(), "node1")])
        .await
        .unwrap();

    let result = service
        .reroute(
            vec![
                AllocationCommand::move_shard(shard_id(), "node1", "node2"),
                AllocationCommand::cancel(shard_id(), "node2"),
            ],
            RerouteOptions::default(),
        )
        .await
        .unwrap();
    let state = result.state;
    assert!(copies_on(&state, "node2").is_empty());
    assert_eq!(copies_on(&state, "node1")[0].state, ShardRoutingState::Started);
    assert!(copies_on(&state, "node1")[0].relocating_node.is_none());
}

#[tokio::test]
async fn test_node_left_fails_its_copies() {
    let service = setup_cluster().await;
    service
        .reroute(
            vec![AllocationCommand::allocate(shard_id(), "node1", true)],
            RerouteOptions::default(),
        )
        .await
        .unwrap();
    service
        .shard_started(vec![StartedShard::new(shard_id(), "node1")])
        .await
        .unwrap();

    let state = service.remove_node("node1").await.unwrap();
    assert_eq!(state.nodes().len(), 1);
    assert_eq!(unassigned(&state), 2);

    let health = service.health(&HealthRequest::new()).await;
    assert_eq!(health.status, ClusterHealthStatus::Red);
    assert_eq!(health.number_of_nodes, 1);
}
