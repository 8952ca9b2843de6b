//! Immutable routing projection stored in a published cluster state

use super::{RoutingNodes, ShardId, ShardRouting, ShardRoutingState};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Routing of every copy of every shard of one index
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    /// Index name
    pub index: String,

    /// Copies by shard number, primary first
    shards: BTreeMap<u32, Vec<ShardRouting>>,
}

impl IndexRoutingTable {
    /// Create a table with `number_of_shards` shards, each with one primary
    /// and `number_of_replicas` replicas, all unassigned
    pub fn unassigned(index: &str, number_of_shards: u32, number_of_replicas: u32) -> Self {
        let shards = (0..number_of_shards)
            .map(|shard| {
                let shard_id = ShardId::new(index, shard);
                let copies = std::iter::once(true)
                    .chain((0..number_of_replicas).map(|_| false))
                    .map(|primary| ShardRouting::unassigned(shard_id.clone(), primary))
                    .collect();
                (shard, copies)
            })
            .collect();
        Self {
            index: index.to_string(),
            shards,
        }
    }

    /// Copies of one shard
    pub fn shard(&self, shard: u32) -> Option<&[ShardRouting]> {
        self.shards.get(&shard).map(Vec::as_slice)
    }

    /// The primary copy of one shard. During a relocation this is the
    /// relocating source.
    pub fn primary(&self, shard: u32) -> Option<&ShardRouting> {
        self.shards
            .get(&shard)?
            .iter()
            .find(|s| s.primary && !s.is_relocation_target())
    }

    /// Shard groups keyed by shard number
    pub fn shards(&self) -> impl Iterator<Item = (u32, &[ShardRouting])> {
        self.shards.iter().map(|(n, copies)| (*n, copies.as_slice()))
    }

    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.values().flatten()
    }

    pub fn number_of_shards(&self) -> usize {
        self.shards.len()
    }
}

/// Routing of every index in the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Project a working copy into an immutable table
    pub fn from_routing_nodes(routing_nodes: RoutingNodes) -> Self {
        let mut indices: BTreeMap<String, IndexRoutingTable> = BTreeMap::new();
        for shard in routing_nodes.into_shards() {
            let index = shard.shard_id.index.clone();
            indices
                .entry(index.clone())
                .or_insert_with(|| IndexRoutingTable {
                    index,
                    shards: BTreeMap::new(),
                })
                .shards
                .entry(shard.shard_id.shard)
                .or_default()
                .push(shard);
        }
        for table in indices.values_mut() {
            for copies in table.shards.values_mut() {
                copies.sort_by_key(|s| (!s.primary, s.is_relocation_target()));
            }
        }
        Self { indices }
    }

    /// Routing table for one index
    pub fn index(&self, name: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(name)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indices.contains_key(name)
    }

    pub fn indices(&self) -> impl Iterator<Item = &IndexRoutingTable> {
        self.indices.values()
    }

    /// Index tables with the name they are keyed under
    pub(crate) fn entries(&self) -> impl Iterator<Item = (&str, &IndexRoutingTable)> {
        self.indices.iter().map(|(name, table)| (name.as_str(), table))
    }

    /// Every copy of every shard
    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.indices.values().flat_map(|table| table.all_shards())
    }

    /// Every copy in the given state
    pub fn shards_with_state(&self, state: ShardRoutingState) -> Vec<&ShardRouting> {
        self.all_shards().filter(|s| s.state == state).collect()
    }

    /// Copy of the table with an additional index
    pub(crate) fn with_index(&self, table: IndexRoutingTable) -> Self {
        let mut indices = self.indices.clone();
        indices.insert(table.index.clone(), table);
        Self { indices }
    }

    /// Copy of the table without the given index
    pub(crate) fn without_index(&self, name: &str) -> Self {
        let mut indices = self.indices.clone();
        indices.remove(name);
        Self { indices }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unassigned_index_table() {
        let table = IndexRoutingTable::unassigned("test", 2, 1);
        assert_eq!(table.number_of_shards(), 2);
        assert_eq!(table.all_shards().count(), 4);
        assert!(table.primary(0).unwrap().primary);
        assert!(table.all_shards().all(|s| s.is_unassigned()));
    }

    #[test]
    fn test_projection_from_routing_nodes() {
        let table = RoutingTable::new().with_index(IndexRoutingTable::unassigned("test", 1, 1));
        let mut routing = RoutingNodes::new(
            vec!["node1".to_string()],
            table.all_shards().cloned(),
        );
        let id = routing
            .find_unassigned(&ShardId::new("test", 0), Some(true))
            .unwrap();
        routing.initialize(id, "node1").unwrap();

        let projected = RoutingTable::from_routing_nodes(routing);
        assert_eq!(projected.shards_with_state(ShardRoutingState::Initializing).len(), 1);
        assert_eq!(projected.shards_with_state(ShardRoutingState::Unassigned).len(), 1);
        let copies = projected.index("test").unwrap().shard(0).unwrap();
        assert!(copies[0].primary);
    }

    #[test]
    fn test_without_index() {
        let table = RoutingTable::new()
            .with_index(IndexRoutingTable::unassigned("a", 1, 0))
            .with_index(IndexRoutingTable::unassigned("b", 1, 0));
        let table = table.without_index("a");
        assert!(!table.has_index("a"));
        assert!(table.has_index("b"));
    }

    #[test]
    fn test_serde_roundtrip_keeps_shard_numbers() {
        let table = RoutingTable::new().with_index(IndexRoutingTable::unassigned("test", 3, 0));
        let json = serde_json::to_string(&table).unwrap();
        let back: RoutingTable = serde_json::from_str(&json).unwrap();
        assert_eq!(back, table);
    }
}
