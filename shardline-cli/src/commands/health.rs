use super::print_json;
use crate::store::Session;
use anyhow::Result;
use shardline::{ClusterHealthStatus, HealthRequest, NodeCountCondition};
use std::time::Duration;

/// Print cluster health, optionally waiting for conditions first
pub async fn run_health(
    session: &Session,
    indices: Vec<String>,
    wait_for_status: Option<ClusterHealthStatus>,
    wait_for_relocating_shards: Option<usize>,
    wait_for_nodes: Option<NodeCountCondition>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let mut request = HealthRequest::new().indices(indices);
    if let Some(status) = wait_for_status {
        request = request.wait_for_status(status);
    }
    if let Some(count) = wait_for_relocating_shards {
        request = request.wait_for_relocating_shards(count);
    }
    if let Some(condition) = wait_for_nodes {
        request = request.wait_for_nodes(condition);
    }
    if let Some(ms) = timeout_ms {
        request = request.timeout(Duration::from_millis(ms));
    }

    let health = session.service.health(&request).await;
    print_json(&health)
}
