//! Property tests: random sequences of commands, confirmations and failures
//! must never break the routing invariants, and rejected or dry-run
//! reroutes must never change the authoritative state.

use proptest::prelude::*;
use shardline::{
    AllocationCommand, AllocationConfig, AllocationService, ClusterState, DiscoveryNode,
    FailedShard, IndexMetadata, RerouteOptions, ShardId, ShardRoutingState, StartedShard,
};
use std::collections::HashMap;
use std::sync::Arc;

const NODES: [&str; 3] = ["node1", "node2", "node3"];
const SHARDS: u32 = 2;
const REPLICAS: u32 = 1;

#[derive(Debug, Clone)]
enum Step {
    Command {
        command: AllocationCommand,
        dry_run: bool,
    },
    StartAll,
    Fail { shard: u32, node: usize },
}

fn node() -> impl Strategy<Value = usize> {
    0..NODES.len()
}

fn command() -> impl Strategy<Value = AllocationCommand> {
    prop_oneof![
        (0..SHARDS, node(), any::<bool>()).prop_map(|(shard, n, allow_primary)| {
            AllocationCommand::allocate(ShardId::new("test", shard), NODES[n], allow_primary)
        }),
        (0..SHARDS, node(), node()).prop_map(|(shard, from, to)| {
            AllocationCommand::move_shard(ShardId::new("test", shard), NODES[from], NODES[to])
        }),
        (0..SHARDS, node()).prop_map(|(shard, n)| {
            AllocationCommand::cancel(ShardId::new("test", shard), NODES[n])
        }),
    ]
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (command(), any::<bool>()).prop_map(|(command, dry_run)| Step::Command { command, dry_run }),
        2 => Just(Step::StartAll),
        1 => (0..SHARDS, node()).prop_map(|(shard, node)| Step::Fail { shard, node }),
    ]
}

fn initial_state() -> Arc<ClusterState> {
    let mut state = ClusterState::new("prop");
    for node in NODES {
        state = state.with_node(DiscoveryNode::new(node));
    }
    Arc::new(
        state
            .with_index(IndexMetadata::new("test", SHARDS, REPLICAS))
            .unwrap(),
    )
}

fn start_all(service: &AllocationService, state: &Arc<ClusterState>) -> Arc<ClusterState> {
    let started: Vec<StartedShard> = state
        .routing_table()
        .shards_with_state(ShardRoutingState::Initializing)
        .into_iter()
        .filter_map(|s| Some(StartedShard::new(s.shard_id.clone(), s.current_node.clone()?)))
        .collect();
    service.apply_started_shards(state, &started)
}

fn check_invariants(state: &ClusterState) -> Result<(), TestCaseError> {
    state
        .routing_nodes()
        .assert_invariants()
        .map_err(TestCaseError::fail)?;

    // every logical copy is still there, relocation targets aside
    let mut copies: HashMap<(u32, bool), usize> = HashMap::new();
    for shard in state
        .routing_table()
        .all_shards()
        .filter(|s| !s.is_relocation_target())
    {
        *copies.entry((shard.shard_id.shard, shard.primary)).or_default() += 1;
    }
    for shard in 0..SHARDS {
        prop_assert_eq!(copies.get(&(shard, true)).copied(), Some(1));
        prop_assert_eq!(
            copies.get(&(shard, false)).copied().unwrap_or(0),
            REPLICAS as usize
        );
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn test_random_steps_preserve_invariants(
        steps in prop::collection::vec(step(), 1..40),
        automatic in any::<bool>(),
    ) {
        let config = if automatic { AllocationConfig::default() } else { AllocationConfig::disabled() };
        let service = AllocationService::new(config);
        let mut state = initial_state();

        for step in steps {
            match step {
                Step::Command { command, dry_run } => {
                    let options = RerouteOptions { dry_run, explain: false };
                    match service.reroute(&state, &[command], options) {
                        Ok(result) => {
                            check_invariants(&result.state)?;
                            prop_assert_eq!(result.state.version(), state.version() + 1);
                            if !dry_run {
                                state = result.state;
                            }
                        }
                        Err(failure) => {
                            prop_assert!(Arc::ptr_eq(&failure.state, &state));
                        }
                    }
                }
                Step::StartAll => {
                    state = start_all(&service, &state);
                }
                Step::Fail { shard, node } => {
                    state = service.apply_failed_shards(
                        &state,
                        &[FailedShard::new(ShardId::new("test", shard), NODES[node], "injected")],
                    );
                }
            }
            check_invariants(&state)?;
        }
    }

    #[test]
    fn test_dry_run_matches_real_run(commands in prop::collection::vec(command(), 1..6)) {
        let service = AllocationService::new(AllocationConfig::disabled());
        let state = initial_state();

        let preview = service.reroute(&state, &commands, RerouteOptions::dry_run());
        let real = service.reroute(&state, &commands, RerouteOptions::default());
        match (preview, real) {
            (Ok(preview), Ok(real)) => {
                prop_assert_eq!(preview.state.routing_table(), real.state.routing_table());
            }
            (Err(preview), Err(real)) => {
                prop_assert_eq!(preview.error, real.error);
            }
            _ => prop_assert!(false, "dry run and real run disagree"),
        }
    }
}
