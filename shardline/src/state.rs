//! Versioned cluster state
//!
//! A [`ClusterState`] is immutable once built. Every update produces a new
//! value with `version + 1` and a fresh `state_uuid`; published states are
//! shared as `Arc<ClusterState>` and read without synchronization.

use crate::error::{ClusterError, Result};
use crate::routing::{IndexRoutingTable, NodeId, RoutingNodes, RoutingTable, ShardRouting};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// A data node known to the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    /// Unique node identifier
    pub id: NodeId,

    /// Human readable name; commands may reference a node by name
    pub name: String,

    /// Node address for the transport layer
    #[serde(default)]
    pub address: String,

    /// Free-form node attributes (zone, rack, disk type, ...)
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl DiscoveryNode {
    /// Create a node whose name equals its id
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            address: String::new(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }
}

/// Registry of known nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    nodes: BTreeMap<NodeId, DiscoveryNode>,
}

impl DiscoveryNodes {
    pub fn get(&self, node_id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(node_id)
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// Resolve a node by id, falling back to its name
    pub fn resolve_node(&self, id_or_name: &str) -> Result<&DiscoveryNode> {
        self.nodes
            .get(id_or_name)
            .or_else(|| self.nodes.values().find(|n| n.name == id_or_name))
            .ok_or_else(|| ClusterError::NotFound(format!("node [{}]", id_or_name)))
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Shard layout of an index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub name: String,
    pub number_of_shards: u32,
    #[serde(default)]
    pub number_of_replicas: u32,
}

impl IndexMetadata {
    pub fn new(name: impl Into<String>, number_of_shards: u32, number_of_replicas: u32) -> Self {
        Self {
            name: name.into(),
            number_of_shards,
            number_of_replicas,
        }
    }

    /// Total copies across all shards
    pub fn total_copies(&self) -> usize {
        self.number_of_shards as usize * (1 + self.number_of_replicas as usize)
    }
}

/// Immutable, versioned cluster snapshot
#[derive(Debug, Clone)]
pub struct ClusterState {
    cluster_name: String,
    version: u64,
    state_uuid: Uuid,
    nodes: DiscoveryNodes,
    metadata: BTreeMap<String, IndexMetadata>,
    routing_table: RoutingTable,
}

impl ClusterState {
    /// Create an empty state at version 0
    pub fn new(cluster_name: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            version: 0,
            state_uuid: Uuid::new_v4(),
            nodes: DiscoveryNodes::default(),
            metadata: BTreeMap::new(),
            routing_table: RoutingTable::new(),
        }
    }

    pub fn cluster_name(&self) -> &str {
        &self.cluster_name
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state_uuid(&self) -> Uuid {
        self.state_uuid
    }

    pub fn nodes(&self) -> &DiscoveryNodes {
        &self.nodes
    }

    pub fn metadata(&self) -> &BTreeMap<String, IndexMetadata> {
        &self.metadata
    }

    pub fn index_metadata(&self, name: &str) -> Option<&IndexMetadata> {
        self.metadata.get(name)
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    /// Materialize a mutable working copy of the routing
    pub fn routing_nodes(&self) -> RoutingNodes {
        RoutingNodes::new(
            self.nodes.ids().cloned(),
            self.routing_table.all_shards().cloned(),
        )
    }

    /// Next version of this state, unchanged otherwise
    fn next(&self) -> Self {
        Self {
            version: self.version + 1,
            state_uuid: Uuid::new_v4(),
            ..self.clone()
        }
    }

    // ========================================
    // Derived states
    // ========================================

    /// New version with the given routing table
    pub fn with_routing_table(&self, routing_table: RoutingTable) -> Self {
        Self {
            routing_table,
            ..self.next()
        }
    }

    /// New version with a node added (or replaced)
    pub fn with_node(&self, node: DiscoveryNode) -> Self {
        let mut state = self.next();
        state.nodes.nodes.insert(node.id.clone(), node);
        state
    }

    /// New version without the node. Shard copies still pointing at the
    /// node must be failed first.
    pub fn without_node(&self, node_id: &str) -> Result<Self> {
        if !self.nodes.contains(node_id) {
            return Err(ClusterError::NotFound(format!("node [{}]", node_id)));
        }
        let mut state = self.next();
        state.nodes.nodes.remove(node_id);
        Ok(state)
    }

    /// New version without the node and with a routing table that no longer
    /// references it
    pub(crate) fn with_node_removed(&self, node_id: &str, routing_table: RoutingTable) -> Result<Self> {
        let mut state = self.without_node(node_id)?;
        state.routing_table = routing_table;
        Ok(state)
    }

    /// New version with an index whose copies are all unassigned
    pub fn with_index(&self, metadata: IndexMetadata) -> Result<Self> {
        if metadata.name.is_empty() {
            return Err(ClusterError::Validation("index name must not be empty".into()));
        }
        if metadata.number_of_shards == 0 {
            return Err(ClusterError::Validation(format!(
                "index [{}] must have at least one shard",
                metadata.name
            )));
        }
        if self.metadata.contains_key(&metadata.name) {
            return Err(ClusterError::Conflict(format!(
                "index [{}] already exists",
                metadata.name
            )));
        }
        let table = IndexRoutingTable::unassigned(
            &metadata.name,
            metadata.number_of_shards,
            metadata.number_of_replicas,
        );
        let mut state = self.next();
        state.routing_table = self.routing_table.with_index(table);
        state.metadata.insert(metadata.name.clone(), metadata);
        Ok(state)
    }

    /// New version without the index and all its shard copies
    pub fn without_index(&self, name: &str) -> Result<Self> {
        if !self.metadata.contains_key(name) {
            return Err(ClusterError::NotFound(format!("index [{}]", name)));
        }
        let mut state = self.next();
        state.routing_table = self.routing_table.without_index(name);
        state.metadata.remove(name);
        Ok(state)
    }

    // ========================================
    // Serialization
    // ========================================

    /// Export state as a snapshot
    pub fn snapshot(&self) -> ClusterStateSnapshot {
        ClusterStateSnapshot {
            cluster_name: self.cluster_name.clone(),
            version: self.version,
            state_uuid: self.state_uuid,
            nodes: self.nodes.iter().cloned().collect(),
            indices: self.metadata.values().cloned().collect(),
            routing_table: self.routing_table.clone(),
        }
    }

    /// Import state from a snapshot, checking that the routing table matches
    /// the index metadata
    pub fn from_snapshot(snapshot: ClusterStateSnapshot) -> Result<Self> {
        let metadata: BTreeMap<String, IndexMetadata> = snapshot
            .indices
            .into_iter()
            .map(|m| (m.name.clone(), m))
            .collect();
        for meta in metadata.values() {
            let copies = snapshot
                .routing_table
                .index(&meta.name)
                .map_or(0, |t| t.all_shards().filter(|s| !s.is_relocation_target()).count());
            if copies != meta.total_copies() {
                return Err(ClusterError::Validation(format!(
                    "index [{}] expects {} shard copies, routing table has {}",
                    meta.name,
                    meta.total_copies(),
                    copies
                )));
            }
        }
        let nodes = DiscoveryNodes {
            nodes: snapshot
                .nodes
                .into_iter()
                .map(|n| (n.id.clone(), n))
                .collect(),
        };
        for (name, table) in snapshot.routing_table.entries() {
            let meta = metadata.get(name).ok_or_else(|| {
                ClusterError::Validation(format!("routing table references unknown index [{}]", name))
            })?;
            if table.index != name {
                return Err(ClusterError::Validation(format!(
                    "routing table for [{}] is keyed as [{}]",
                    table.index, name
                )));
            }
            for (number, copies) in table.shards() {
                if number >= meta.number_of_shards {
                    return Err(ClusterError::Validation(format!(
                        "index [{}] has {} shards, routing table has shard {}",
                        name, meta.number_of_shards, number
                    )));
                }
                for copy in copies {
                    check_snapshot_copy(copy, name, number, &nodes)?;
                }
            }
        }

        let state = Self {
            cluster_name: snapshot.cluster_name,
            version: snapshot.version,
            state_uuid: snapshot.state_uuid,
            nodes,
            metadata,
            routing_table: snapshot.routing_table,
        };
        state
            .routing_nodes()
            .assert_invariants()
            .map_err(ClusterError::Validation)?;
        Ok(state)
    }
}

fn check_snapshot_copy(copy: &ShardRouting, index: &str, number: u32, nodes: &DiscoveryNodes) -> Result<()> {
    if copy.shard_id.index != index || copy.shard_id.shard != number {
        return Err(ClusterError::Validation(format!(
            "copy of {} is stored under [{}][{}]",
            copy.shard_id, index, number
        )));
    }
    for node in copy.current_node.iter().chain(copy.relocating_node.iter()) {
        if !nodes.contains(node) {
            return Err(ClusterError::Validation(format!(
                "copy of {} references unknown node [{}]",
                copy.shard_id, node
            )));
        }
    }
    Ok(())
}

/// Serializable snapshot of cluster state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStateSnapshot {
    pub cluster_name: String,
    pub version: u64,
    pub state_uuid: Uuid,
    #[serde(default)]
    pub nodes: Vec<DiscoveryNode>,
    #[serde(default)]
    pub indices: Vec<IndexMetadata>,
    #[serde(default)]
    pub routing_table: RoutingTable,
}
