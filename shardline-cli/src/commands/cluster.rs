use super::print_json;
use crate::store::{save_state, Session};
use anyhow::{bail, Result};
use shardline::{
    ClusterState, DiscoveryNode, FailedShard, IndexMetadata, ShardId, ShardRoutingState,
    ShardlineConfig, StartedShard,
};
use std::path::Path;

/// Create an empty state file
pub fn run_init(state_path: &Path, cluster_name: &str, force: bool) -> Result<()> {
    if state_path.exists() && !force {
        bail!(
            "State file {} already exists (use --force to overwrite)",
            state_path.display()
        );
    }
    let state = ClusterState::new(cluster_name);
    save_state(state_path, &state)?;
    println!("Initialized cluster [{}] in {}", cluster_name, state_path.display());
    Ok(())
}

pub async fn run_add_node(
    session: &Session,
    node_id: &str,
    name: Option<String>,
    address: Option<String>,
) -> Result<()> {
    let mut node = DiscoveryNode::new(node_id);
    if let Some(name) = name {
        node = node.with_name(name);
    }
    if let Some(address) = address {
        node = node.with_address(address);
    }
    let state = session.service.add_node(node).await?;
    println!("Node [{}] added, cluster state version {}", node_id, state.version());
    Ok(())
}

pub async fn run_remove_node(session: &Session, node_id: &str) -> Result<()> {
    let state = session.service.remove_node(node_id).await?;
    println!("Node [{}] removed, cluster state version {}", node_id, state.version());
    Ok(())
}

pub async fn run_create_index(session: &Session, name: &str, shards: u32, replicas: u32) -> Result<()> {
    let state = session
        .service
        .create_index(IndexMetadata::new(name, shards, replicas))
        .await?;
    println!(
        "Index [{}] created with {} shards and {} replicas, cluster state version {}",
        name,
        shards,
        replicas,
        state.version()
    );
    Ok(())
}

pub async fn run_delete_index(session: &Session, name: &str) -> Result<()> {
    let state = session.service.delete_index(name).await?;
    println!("Index [{}] deleted, cluster state version {}", name, state.version());
    Ok(())
}

/// Confirm recoveries. Without explicit shards every initializing copy is
/// confirmed.
pub async fn run_started(session: &Session, shards: Vec<(ShardId, String)>) -> Result<()> {
    let started: Vec<StartedShard> = if shards.is_empty() {
        session
            .state()
            .routing_table()
            .shards_with_state(ShardRoutingState::Initializing)
            .into_iter()
            .filter_map(|s| Some(StartedShard::new(s.shard_id.clone(), s.current_node.clone()?)))
            .collect()
    } else {
        shards
            .into_iter()
            .map(|(shard_id, node)| StartedShard::new(shard_id, node))
            .collect()
    };
    let state = session.service.shard_started(started.clone()).await?;
    println!(
        "Confirmed {} shard copies, cluster state version {}",
        started.len(),
        state.version()
    );
    Ok(())
}

pub async fn run_failed(session: &Session, shard_id: ShardId, node: &str, reason: &str) -> Result<()> {
    let state = session
        .service
        .shard_failed(vec![FailedShard::new(shard_id.clone(), node, reason)])
        .await?;
    println!(
        "Failed {} on [{}], cluster state version {}",
        shard_id,
        node,
        state.version()
    );
    Ok(())
}

/// Update allocation settings from the config file and reallocate
pub async fn run_settings(session: &Session, config: &ShardlineConfig) -> Result<()> {
    let state = session
        .service
        .update_settings(config.allocation.clone())
        .await?;
    println!("Allocation settings applied, cluster state version {}", state.version());
    Ok(())
}

/// Print the state, either as JSON or as a routing table
pub fn run_state(session: &Session, json: bool) -> Result<()> {
    let state = session.state();
    if json {
        return print_json(&state.snapshot());
    }

    println!(
        "Cluster [{}] version {} ({})",
        state.cluster_name(),
        state.version(),
        state.state_uuid()
    );
    println!("Nodes: {}", state.nodes().ids().cloned().collect::<Vec<_>>().join(", "));
    println!();
    println!(
        "{:<20} {:<6} {:<8} {:<13} {:<15} {:<15}",
        "INDEX", "SHARD", "ROLE", "STATE", "NODE", "RELOCATING"
    );
    println!("{}", "-".repeat(80));
    for shard in state.routing_table().all_shards() {
        println!(
            "{:<20} {:<6} {:<8} {:<13} {:<15} {:<15}",
            shard.shard_id.index,
            shard.shard_id.shard,
            if shard.primary { "primary" } else { "replica" },
            shard.state.as_str(),
            shard.current_node.as_deref().unwrap_or("-"),
            shard.relocating_node.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}
