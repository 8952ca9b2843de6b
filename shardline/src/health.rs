//! Cluster health
//!
//! Health is derived from a cluster state on demand and never stored:
//!
//! ```text
//!   RED     some primary copy is unassigned
//!   YELLOW  some replica copy is unassigned, or some copy is initializing
//!   GREEN   everything else
//! ```
//!
//! Waiting callers subscribe to published states and re-evaluate on every
//! publication until their conditions hold or the deadline passes. Running
//! out of time is not an error: the last observed health is returned with
//! `timed_out` set.

use crate::error::ClusterError;
use crate::routing::IndexRoutingTable;
use crate::state::{ClusterState, IndexMetadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Aggregate health, ordered from least to most converged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealthStatus {
    Red,
    Yellow,
    Green,
}

impl ClusterHealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterHealthStatus::Red => "red",
            ClusterHealthStatus::Yellow => "yellow",
            ClusterHealthStatus::Green => "green",
        }
    }

    /// Numeric value for gauges
    pub fn value(&self) -> f64 {
        match self {
            ClusterHealthStatus::Red => 0.0,
            ClusterHealthStatus::Yellow => 1.0,
            ClusterHealthStatus::Green => 2.0,
        }
    }
}

impl fmt::Display for ClusterHealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClusterHealthStatus {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "red" => Ok(ClusterHealthStatus::Red),
            "yellow" => Ok(ClusterHealthStatus::Yellow),
            "green" => Ok(ClusterHealthStatus::Green),
            _ => Err(ClusterError::Validation(format!(
                "unknown health status '{}'",
                s
            ))),
        }
    }
}

/// Shard counters shared by index and cluster health
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardCounts {
    pub active_primary_shards: usize,
    pub active_shards: usize,
    pub relocating_shards: usize,
    pub initializing_shards: usize,
    pub unassigned_shards: usize,
}

impl ShardCounts {
    fn add(&mut self, other: &ShardCounts) {
        self.active_primary_shards += other.active_primary_shards;
        self.active_shards += other.active_shards;
        self.relocating_shards += other.relocating_shards;
        self.initializing_shards += other.initializing_shards;
        self.unassigned_shards += other.unassigned_shards;
    }
}

/// Health of one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHealth {
    pub index: String,
    pub status: ClusterHealthStatus,
    pub number_of_shards: u32,
    pub number_of_replicas: u32,
    #[serde(flatten)]
    pub shards: ShardCounts,
}

impl IndexHealth {
    /// A relocation source counts as active and relocating; its target
    /// counts as initializing and keeps the index YELLOW until it starts.
    pub fn from_table(metadata: &IndexMetadata, table: Option<&IndexRoutingTable>) -> Self {
        let mut shards = ShardCounts::default();
        let mut primary_unassigned = false;

        for copy in table.into_iter().flat_map(|t| t.all_shards()) {
            if copy.active() {
                shards.active_shards += 1;
                if copy.primary {
                    shards.active_primary_shards += 1;
                }
            }
            if copy.relocating() {
                shards.relocating_shards += 1;
            }
            if copy.initializing() {
                shards.initializing_shards += 1;
            }
            if copy.is_unassigned() {
                shards.unassigned_shards += 1;
                primary_unassigned |= copy.primary;
            }
        }

        let status = if primary_unassigned || table.is_none() {
            ClusterHealthStatus::Red
        } else if shards.unassigned_shards > 0 || shards.initializing_shards > 0 {
            ClusterHealthStatus::Yellow
        } else {
            ClusterHealthStatus::Green
        };

        Self {
            index: metadata.name.clone(),
            status,
            number_of_shards: metadata.number_of_shards,
            number_of_replicas: metadata.number_of_replicas,
            shards,
        }
    }
}

/// Health of the cluster, or of the requested indices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHealth {
    pub cluster_name: String,
    pub status: ClusterHealthStatus,
    pub timed_out: bool,
    pub number_of_nodes: usize,
    /// Version of the state this health was computed from
    pub state_version: u64,
    #[serde(flatten)]
    pub shards: ShardCounts,
    pub indices: BTreeMap<String, IndexHealth>,
}

impl ClusterHealth {
    /// Compute health for `indices`, or for every index when empty.
    ///
    /// A requested index that does not exist makes the status RED.
    pub fn from_state(state: &ClusterState, indices: &[String]) -> Self {
        let mut missing = false;
        let selected: Vec<&IndexMetadata> = if indices.is_empty() {
            state.metadata().values().collect()
        } else {
            indices
                .iter()
                .filter_map(|name| {
                    let meta = state.index_metadata(name);
                    missing |= meta.is_none();
                    meta
                })
                .collect()
        };

        let mut shards = ShardCounts::default();
        let mut status = ClusterHealthStatus::Green;
        let mut per_index = BTreeMap::new();
        for meta in selected {
            let health = IndexHealth::from_table(meta, state.routing_table().index(&meta.name));
            shards.add(&health.shards);
            status = status.min(health.status);
            per_index.insert(meta.name.clone(), health);
        }
        if missing {
            status = ClusterHealthStatus::Red;
        }

        Self {
            cluster_name: state.cluster_name().to_string(),
            status,
            timed_out: false,
            number_of_nodes: state.nodes().len(),
            state_version: state.version(),
            shards,
            indices: per_index,
        }
    }

    pub fn unassigned_shards(&self) -> usize {
        self.shards.unassigned_shards
    }

    pub fn initializing_shards(&self) -> usize {
        self.shards.initializing_shards
    }

    pub fn relocating_shards(&self) -> usize {
        self.shards.relocating_shards
    }

    pub fn active_shards(&self) -> usize {
        self.shards.active_shards
    }
}

/// Condition on the number of nodes, written `N`, `>=N`, `<=N`, `>N` or `<N`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum NodeCountCondition {
    Eq(usize),
    Ge(usize),
    Le(usize),
    Gt(usize),
    Lt(usize),
}

impl NodeCountCondition {
    pub fn matches(&self, nodes: usize) -> bool {
        match *self {
            NodeCountCondition::Eq(n) => nodes == n,
            NodeCountCondition::Ge(n) => nodes >= n,
            NodeCountCondition::Le(n) => nodes <= n,
            NodeCountCondition::Gt(n) => nodes > n,
            NodeCountCondition::Lt(n) => nodes < n,
        }
    }
}

impl FromStr for NodeCountCondition {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (ctor, rest): (fn(usize) -> Self, &str) = if let Some(rest) = s.strip_prefix(">=") {
            (NodeCountCondition::Ge, rest)
        } else if let Some(rest) = s.strip_prefix("<=") {
            (NodeCountCondition::Le, rest)
        } else if let Some(rest) = s.strip_prefix('>') {
            (NodeCountCondition::Gt, rest)
        } else if let Some(rest) = s.strip_prefix('<') {
            (NodeCountCondition::Lt, rest)
        } else {
            (NodeCountCondition::Eq, s)
        };
        rest.trim()
            .parse::<usize>()
            .map(ctor)
            .map_err(|_| ClusterError::Validation(format!("invalid node count condition '{}'", s)))
    }
}

impl TryFrom<String> for NodeCountCondition {
    type Error = ClusterError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<NodeCountCondition> for String {
    fn from(c: NodeCountCondition) -> Self {
        c.to_string()
    }
}

impl fmt::Display for NodeCountCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeCountCondition::Eq(n) => write!(f, "{}", n),
            NodeCountCondition::Ge(n) => write!(f, ">={}", n),
            NodeCountCondition::Le(n) => write!(f, "<={}", n),
            NodeCountCondition::Gt(n) => write!(f, ">{}", n),
            NodeCountCondition::Lt(n) => write!(f, "<{}", n),
        }
    }
}

/// What a health caller wants to see, and how long it is willing to wait
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRequest {
    /// Restrict health to these indices; empty means cluster-wide
    #[serde(default)]
    pub indices: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_status: Option<ClusterHealthStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_relocating_shards: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for_nodes: Option<NodeCountCondition>,

    /// Wait deadline in milliseconds; the configured default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl HealthRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn indices<I, S>(mut self, indices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.indices = indices.into_iter().map(Into::into).collect();
        self
    }

    pub fn wait_for_status(mut self, status: ClusterHealthStatus) -> Self {
        self.wait_for_status = Some(status);
        self
    }

    pub fn wait_for_relocating_shards(mut self, count: usize) -> Self {
        self.wait_for_relocating_shards = Some(count);
        self
    }

    pub fn wait_for_nodes(mut self, condition: NodeCountCondition) -> Self {
        self.wait_for_nodes = Some(condition);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn has_wait_conditions(&self) -> bool {
        self.wait_for_status.is_some()
            || self.wait_for_relocating_shards.is_some()
            || self.wait_for_nodes.is_some()
    }

    /// Whether `health` satisfies every wait condition
    pub fn is_satisfied(&self, health: &ClusterHealth) -> bool {
        self.wait_for_status.map_or(true, |s| health.status >= s)
            && self
                .wait_for_relocating_shards
                .map_or(true, |n| health.relocating_shards() == n)
            && self
                .wait_for_nodes
                .map_or(true, |c| c.matches(health.number_of_nodes))
    }
}

/// Wait until the published state satisfies `request`, or until the
/// deadline. Never fails: on timeout the last observed health is returned
/// with `timed_out = true`.
pub async fn wait_for_health(
    mut states: watch::Receiver<Arc<ClusterState>>,
    request: &HealthRequest,
    default_timeout: Duration,
) -> ClusterHealth {
    let timeout = request
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(default_timeout);
    let deadline = Instant::now() + timeout;

    loop {
        let state = Arc::clone(&states.borrow_and_update());
        let mut health = ClusterHealth::from_state(&state, &request.indices);
        if request.is_satisfied(&health) {
            return health;
        }

        match tokio::time::timeout_at(deadline, states.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => {
                debug!("State publisher closed while waiting for health");
                health.timed_out = true;
                return health;
            }
            Err(_) => {
                debug!(
                    "Health wait timed out after {:?} with status {}",
                    timeout, health.status
                );
                health.timed_out = true;
                return health;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{RoutingTable, ShardId};
    use crate::state::DiscoveryNode;

    fn make_state() -> ClusterState {
        ClusterState::new("test")
            .with_node(DiscoveryNode::new("node1"))
            .with_node(DiscoveryNode::new("node2"))
            .with_index(IndexMetadata::new("test", 1, 1))
            .unwrap()
    }

    /// Start the primary of `test` on node1
    fn with_started_primary(state: &ClusterState) -> ClusterState {
        let mut routing = state.routing_nodes();
        let id = routing
            .find_unassigned(&ShardId::new("test", 0), Some(true))
            .unwrap();
        routing.initialize(id, "node1").unwrap();
        routing.start(id).unwrap();
        state.with_routing_table(RoutingTable::from_routing_nodes(routing))
    }

    #[test]
    fn test_status_ordering() {
        assert!(ClusterHealthStatus::Red < ClusterHealthStatus::Yellow);
        assert!(ClusterHealthStatus::Yellow < ClusterHealthStatus::Green);
        assert_eq!("GREEN".parse::<ClusterHealthStatus>().unwrap(), ClusterHealthStatus::Green);
        assert!("blue".parse::<ClusterHealthStatus>().is_err());
    }

    #[test]
    fn test_unassigned_primary_is_red() {
        let health = ClusterHealth::from_state(&make_state(), &[]);
        assert_eq!(health.status, ClusterHealthStatus::Red);
        assert_eq!(health.unassigned_shards(), 2);
        assert_eq!(health.number_of_nodes, 2);
    }

    #[test]
    fn test_unassigned_replica_is_yellow() {
        let state = with_started_primary(&make_state());
        let health = ClusterHealth::from_state(&state, &[]);
        assert_eq!(health.status, ClusterHealthStatus::Yellow);
        assert_eq!(health.active_shards(), 1);
        assert_eq!(health.shards.active_primary_shards, 1);
        assert_eq!(health.unassigned_shards(), 1);
    }

    #[test]
    fn test_relocation_target_keeps_index_yellow() {
        let state = ClusterState::new("test")
            .with_node(DiscoveryNode::new("node1"))
            .with_node(DiscoveryNode::new("node2"))
            .with_index(IndexMetadata::new("test", 1, 0))
            .unwrap();
        let state = with_started_primary(&state);
        assert_eq!(
            ClusterHealth::from_state(&state, &[]).status,
            ClusterHealthStatus::Green
        );

        let mut routing = state.routing_nodes();
        let id = routing.find_on_node(&ShardId::new("test", 0), "node1").unwrap();
        routing.relocate(id, "node1", "node2").unwrap();
        let state = state.with_routing_table(RoutingTable::from_routing_nodes(routing));

        let health = ClusterHealth::from_state(&state, &[]);
        assert_eq!(health.status, ClusterHealthStatus::Yellow);
        assert_eq!(health.relocating_shards(), 1);
        assert_eq!(health.initializing_shards(), 1);
        assert_eq!(health.active_shards(), 1);
        assert_eq!(health.shards.active_primary_shards, 1);

        let mut routing = state.routing_nodes();
        let target = routing.find_on_node(&ShardId::new("test", 0), "node2").unwrap();
        routing.start(target).unwrap();
        let state = state.with_routing_table(RoutingTable::from_routing_nodes(routing));

        let health = ClusterHealth::from_state(&state, &[]);
        assert_eq!(health.status, ClusterHealthStatus::Green);
        assert_eq!(health.relocating_shards(), 0);
        assert_eq!(health.initializing_shards(), 0);
        assert_eq!(health.active_shards(), 1);
    }

    #[test]
    fn test_unknown_index_is_red() {
        let state = with_started_primary(&make_state());
        let health = ClusterHealth::from_state(&state, &["missing".to_string()]);
        assert_eq!(health.status, ClusterHealthStatus::Red);
        assert!(health.indices.is_empty());
    }

    #[test]
    fn test_empty_cluster_is_green() {
        let health = ClusterHealth::from_state(&ClusterState::new("empty"), &[]);
        assert_eq!(health.status, ClusterHealthStatus::Green);
    }

    #[test]
    fn test_node_count_condition() {
        assert_eq!(">=2".parse::<NodeCountCondition>().unwrap(), NodeCountCondition::Ge(2));
        assert_eq!("3".parse::<NodeCountCondition>().unwrap(), NodeCountCondition::Eq(3));
        assert!(NodeCountCondition::Lt(3).matches(2));
        assert!(!NodeCountCondition::Gt(3).matches(3));
        assert!("ge(2)".parse::<NodeCountCondition>().is_err());

        let json = serde_json::to_string(&NodeCountCondition::Le(4)).unwrap();
        assert_eq!(json, "\"<=4\"");
    }

    #[test]
    fn test_request_satisfaction() {
        let health = ClusterHealth::from_state(&with_started_primary(&make_state()), &[]);
        assert!(HealthRequest::new().is_satisfied(&health));
        assert!(HealthRequest::new()
            .wait_for_status(ClusterHealthStatus::Yellow)
            .is_satisfied(&health));
        assert!(!HealthRequest::new()
            .wait_for_status(ClusterHealthStatus::Green)
            .is_satisfied(&health));
        assert!(!HealthRequest::new()
            .wait_for_nodes(NodeCountCondition::Ge(3))
            .is_satisfied(&health));
    }

    #[tokio::test]
    async fn test_wait_returns_immediately_when_satisfied() {
        let (_tx, rx) = watch::channel(Arc::new(with_started_primary(&make_state())));
        let request = HealthRequest::new().wait_for_status(ClusterHealthStatus::Yellow);
        let health = wait_for_health(rx, &request, Duration::from_secs(5)).await;
        assert!(!health.timed_out);
        assert_eq!(health.status, ClusterHealthStatus::Yellow);
    }

    #[tokio::test]
    async fn test_wait_times_out_without_error() {
        let (_tx, rx) = watch::channel(Arc::new(make_state()));
        let request = HealthRequest::new()
            .wait_for_status(ClusterHealthStatus::Yellow)
            .timeout(Duration::from_millis(50));
        let health = wait_for_health(rx, &request, Duration::from_secs(5)).await;
        assert!(health.timed_out);
        assert_eq!(health.status, ClusterHealthStatus::Red);
    }

    #[tokio::test]
    async fn test_wait_wakes_on_publication() {
        let state = make_state();
        let (tx, rx) = watch::channel(Arc::new(state.clone()));
        let request = HealthRequest::new()
            .wait_for_status(ClusterHealthStatus::Yellow)
            .timeout(Duration::from_secs(5));

        let waiter = tokio::spawn(async move { wait_for_health(rx, &request, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send_replace(Arc::new(with_started_primary(&state)));

        let health = waiter.await.unwrap();
        assert!(!health.timed_out);
        assert_eq!(health.status, ClusterHealthStatus::Yellow);
    }
}
