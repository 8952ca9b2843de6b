//! Mutable working copy of shard placement
//!
//! Shard copies live in an arena indexed by [`EntryId`]. Nodes and the
//! unassigned pool only hold handles into the arena, so relocation links
//! are expressed through node ids on the entries themselves and never as
//! references between entries.

use super::{NodeId, ShardId, ShardRouting, ShardRoutingState};
use crate::error::{ClusterError, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::debug;

/// Handle to a shard copy inside a [`RoutingNodes`] arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(usize);

/// Shard copies held by one node, in placement order
#[derive(Debug, Clone)]
pub struct RoutingNode {
    node_id: NodeId,
    entries: Vec<EntryId>,
}

impl RoutingNode {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            entries: Vec::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Handles of the copies on this node
    pub fn entries(&self) -> &[EntryId] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All shard copies grouped by owning node, plus the unassigned pool.
///
/// Private to one reroute: it is built from a cluster state, mutated, and
/// either projected into a new [`RoutingTable`](super::RoutingTable) or
/// discarded.
#[derive(Debug, Clone, Default)]
pub struct RoutingNodes {
    arena: Vec<Option<ShardRouting>>,
    nodes: BTreeMap<NodeId, RoutingNode>,
    unassigned: Vec<EntryId>,
}

impl RoutingNodes {
    /// Build a working copy for the given nodes and shard copies.
    ///
    /// Every node id gets a (possibly empty) entry. Copies that reference a
    /// node outside that set are still tracked under that node id.
    pub fn new<N, S>(node_ids: N, shards: S) -> Self
    where
        N: IntoIterator<Item = NodeId>,
        S: IntoIterator<Item = ShardRouting>,
    {
        let mut routing = Self {
            arena: Vec::new(),
            nodes: node_ids
                .into_iter()
                .map(|id| (id.clone(), RoutingNode::new(id)))
                .collect(),
            unassigned: Vec::new(),
        };
        for shard in shards {
            routing.push(shard);
        }
        routing
    }

    // ========================================
    // Lookups
    // ========================================

    /// Get a routing node by id
    pub fn node(&self, node_id: &str) -> Result<&RoutingNode> {
        self.nodes
            .get(node_id)
            .ok_or_else(|| ClusterError::NotFound(format!("node [{}]", node_id)))
    }

    pub fn has_node(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    /// All routing nodes, ordered by node id
    pub fn nodes(&self) -> impl Iterator<Item = &RoutingNode> {
        self.nodes.values()
    }

    /// Get a shard copy by handle
    pub fn get(&self, id: EntryId) -> Option<&ShardRouting> {
        self.arena.get(id.0).and_then(Option::as_ref)
    }

    fn entry(&self, id: EntryId) -> Result<&ShardRouting> {
        self.get(id)
            .ok_or_else(|| ClusterError::NotFound(format!("routing entry #{}", id.0)))
    }

    fn entry_mut(&mut self, id: EntryId) -> Result<&mut ShardRouting> {
        self.arena
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| ClusterError::NotFound(format!("routing entry #{}", id.0)))
    }

    /// Handles of unassigned copies, in the order they became unassigned
    pub fn unassigned(&self) -> &[EntryId] {
        &self.unassigned
    }

    /// Unassigned copies
    pub fn unassigned_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.unassigned.iter().filter_map(move |id| self.get(*id))
    }

    /// Copies on a node, in placement order. Empty for unknown nodes.
    pub fn shards_on<'a>(&'a self, node_id: &str) -> impl Iterator<Item = &'a ShardRouting> + 'a {
        self.nodes
            .get(node_id)
            .map(|node| node.entries.as_slice())
            .unwrap_or_default()
            .iter()
            .filter_map(move |id| self.get(*id))
    }

    /// Every live copy with its handle
    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &ShardRouting)> {
        self.arena
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|shard| (EntryId(i), shard)))
    }

    /// Every live copy, consuming the working copy
    pub fn into_shards(self) -> impl Iterator<Item = ShardRouting> {
        self.arena.into_iter().flatten()
    }

    /// Whether any copy of the shard exists
    pub fn has_shard(&self, shard_id: &ShardId) -> bool {
        self.iter().any(|(_, s)| &s.shard_id == shard_id)
    }

    /// All copies of one shard
    pub fn copies(&self, shard_id: &ShardId) -> impl Iterator<Item = (EntryId, &ShardRouting)> {
        let shard_id = shard_id.clone();
        self.iter().filter(move |(_, s)| s.shard_id == shard_id)
    }

    /// First unassigned copy of the shard. Primaries are preferred when
    /// `primary` is `None`.
    pub fn find_unassigned(&self, shard_id: &ShardId, primary: Option<bool>) -> Option<EntryId> {
        let mut candidates = self
            .unassigned
            .iter()
            .copied()
            .filter(|id| {
                self.get(*id).is_some_and(|s| {
                    &s.shard_id == shard_id && primary.map_or(true, |p| s.primary == p)
                })
            })
            .collect::<Vec<_>>();
        candidates.sort_by_key(|id| self.get(*id).map_or(true, |s| !s.primary));
        candidates.first().copied()
    }

    /// The copy of the shard held by `node_id`, if any
    pub fn find_on_node(&self, shard_id: &ShardId, node_id: &str) -> Option<EntryId> {
        self.nodes.get(node_id)?.entries.iter().copied().find(|id| {
            self.get(*id)
                .is_some_and(|s| &s.shard_id == shard_id)
        })
    }

    /// The active primary copy of the shard, if any
    pub fn active_primary(&self, shard_id: &ShardId) -> Option<&ShardRouting> {
        self.copies(shard_id)
            .map(|(_, s)| s)
            .find(|s| s.primary && s.active())
    }

    /// Number of initializing copies on a node
    pub fn initializing_on(&self, node_id: &str) -> usize {
        self.shards_on(node_id).filter(|s| s.initializing()).count()
    }

    /// Number of copies with the given state
    pub fn count_with_state(&self, state: ShardRoutingState) -> usize {
        self.iter().filter(|(_, s)| s.state == state).count()
    }

    // ========================================
    // Mutations
    // ========================================

    fn push(&mut self, shard: ShardRouting) -> EntryId {
        let id = EntryId(self.arena.len());
        match shard.current_node.clone() {
            Some(node_id) if shard.assigned() => self
                .nodes
                .entry(node_id.clone())
                .or_insert_with(|| RoutingNode::new(node_id))
                .entries
                .push(id),
            _ => self.unassigned.push(id),
        }
        self.arena.push(Some(shard));
        id
    }

    /// Detach a copy from its node list or the unassigned pool and take it
    /// out of the arena
    fn detach(&mut self, id: EntryId) -> Option<ShardRouting> {
        let shard = self.arena.get_mut(id.0)?.take()?;
        match shard.current_node.as_deref() {
            Some(node_id) if shard.assigned() => {
                if let Some(node) = self.nodes.get_mut(node_id) {
                    node.entries.retain(|e| *e != id);
                }
            }
            _ => self.unassigned.retain(|e| *e != id),
        }
        Some(shard)
    }

    /// Put a detached copy back into the unassigned pool under the same handle
    fn reattach_unassigned(&mut self, id: EntryId, mut shard: ShardRouting) {
        shard.move_to_unassigned();
        self.arena[id.0] = Some(shard);
        self.unassigned.push(id);
    }

    /// Drop an empty node from the working copy
    pub fn remove_node(&mut self, node_id: &str) -> Result<()> {
        let node = self.node(node_id)?;
        if !node.is_empty() {
            return Err(ClusterError::Conflict(format!(
                "node [{}] still holds {} shard copies",
                node_id,
                node.len()
            )));
        }
        self.nodes.remove(node_id);
        Ok(())
    }

    /// Place an unassigned copy on a node in `INITIALIZING` state
    pub fn initialize(&mut self, id: EntryId, node_id: &str) -> Result<()> {
        let shard = self.entry(id)?;
        if !shard.is_unassigned() {
            return Err(ClusterError::Conflict(format!(
                "{} is {} and cannot be initialized",
                shard.short_summary(),
                shard.state
            )));
        }
        if self.find_on_node(&shard.shard_id, node_id).is_some() {
            return Err(ClusterError::Conflict(format!(
                "node [{}] already holds a copy of {}",
                node_id, shard.shard_id
            )));
        }
        let node = self
            .nodes
            .get_mut(node_id)
            .ok_or_else(|| ClusterError::NotFound(format!("node [{}]", node_id)))?;
        node.entries.push(id);
        self.unassigned.retain(|e| *e != id);

        let shard = self.entry_mut(id)?;
        shard.initialize(node_id);
        debug!("Initializing {}", shard.short_summary());
        Ok(())
    }

    /// Start relocating a started copy from `from` to `to`.
    ///
    /// Returns the handle of the new initializing target entry.
    pub fn relocate(&mut self, id: EntryId, from: &str, to: &str) -> Result<EntryId> {
        let shard = self.entry(id)?;
        if !shard.started() || !shard.is_on(from) {
            return Err(ClusterError::Conflict(format!(
                "{} is not STARTED on node [{}]",
                shard.short_summary(),
                from
            )));
        }
        if !self.nodes.contains_key(to) {
            return Err(ClusterError::NotFound(format!("node [{}]", to)));
        }
        if self.find_on_node(&shard.shard_id, to).is_some() {
            return Err(ClusterError::Conflict(format!(
                "node [{}] already holds a copy of {}",
                to, shard.shard_id
            )));
        }

        let shard = self.entry_mut(id)?;
        shard.relocate(to);
        let target = shard.relocation_target().ok_or_else(|| {
            ClusterError::Conflict(format!("{} has no current node", shard.short_summary()))
        })?;
        debug!("Relocating {}", shard.short_summary());
        Ok(self.push(target))
    }

    /// Mark an initializing copy as started. Completing a relocation target
    /// removes its relocating source.
    pub fn start(&mut self, id: EntryId) -> Result<()> {
        let shard = self.entry(id)?;
        if !shard.initializing() {
            return Err(ClusterError::Conflict(format!(
                "{} is {} and cannot be started",
                shard.short_summary(),
                shard.state
            )));
        }
        if shard.is_relocation_target() {
            if let Some(source) = self.relocation_source(id) {
                self.detach(source);
            }
        }
        let shard = self.entry_mut(id)?;
        shard.move_to_started();
        debug!("Started {}", shard.short_summary());
        Ok(())
    }

    /// Remove the copy from `node_id`.
    ///
    /// Cancelling a relocation target restores the source to `STARTED`.
    /// Any other copy goes back to the unassigned pool (taking its
    /// relocation target with it).
    pub fn cancel(&mut self, id: EntryId, node_id: &str) -> Result<()> {
        let shard = self.entry(id)?;
        if !shard.assigned() || !shard.is_on(node_id) {
            return Err(ClusterError::Conflict(format!(
                "{} is not assigned to node [{}]",
                shard.short_summary(),
                node_id
            )));
        }
        self.unassign(id)
    }

    /// Fail an assigned copy wherever it sits, returning it to the pool
    pub fn fail(&mut self, id: EntryId) -> Result<()> {
        let shard = self.entry(id)?;
        if !shard.assigned() {
            return Err(ClusterError::Conflict(format!(
                "{} is not assigned",
                shard.short_summary()
            )));
        }
        self.unassign(id)
    }

    fn unassign(&mut self, id: EntryId) -> Result<()> {
        let shard = self.entry(id)?.clone();

        if shard.is_relocation_target() {
            if let Some(source) = self.relocation_source(id) {
                self.entry_mut(source)?.cancel_relocation();
            }
            self.detach(id);
            debug!("Cancelled relocation target {}", shard.short_summary());
            return Ok(());
        }

        if shard.relocating() {
            if let Some(target) = self.relocation_target(id) {
                self.detach(target);
            }
        }

        let Some(mut shard) = self.detach(id) else {
            return Ok(());
        };
        if shard.primary {
            if self.promote_replica(&shard.shard_id) {
                shard.primary = false;
            } else {
                self.fail_initializing_replicas(&shard.shard_id);
            }
        }
        debug!("Unassigned {}", shard.short_summary());
        self.reattach_unassigned(id, shard);
        Ok(())
    }

    /// Promote an active replica of the shard to primary. A relocating
    /// replica takes its relocation target with it.
    fn promote_replica(&mut self, shard_id: &ShardId) -> bool {
        let Some(replica) = self
            .copies(shard_id)
            .find(|(_, s)| !s.primary && s.active())
            .map(|(id, _)| id)
        else {
            return false;
        };
        let target = self.relocation_target(replica);
        for id in std::iter::once(replica).chain(target) {
            if let Some(Some(shard)) = self.arena.get_mut(id.0) {
                shard.primary = true;
                debug!("Promoted {} to primary", shard.short_summary());
            }
        }
        true
    }

    /// Replicas recovering from a primary that just went away cannot finish
    fn fail_initializing_replicas(&mut self, shard_id: &ShardId) {
        let recovering: Vec<EntryId> = self
            .copies(shard_id)
            .filter(|(_, s)| !s.primary && s.initializing() && !s.is_relocation_target())
            .map(|(id, _)| id)
            .collect();
        for id in recovering {
            if let Some(shard) = self.detach(id) {
                self.reattach_unassigned(id, shard);
            }
        }
    }

    /// The relocating source entry of an initializing relocation target
    fn relocation_source(&self, target: EntryId) -> Option<EntryId> {
        let t = self.get(target)?;
        let from = t.relocating_node.as_deref()?;
        let to = t.current_node.as_deref()?;
        self.find_on_node(&t.shard_id, from).filter(|id| {
            self.get(*id).is_some_and(|s| {
                s.relocating() && s.relocating_node.as_deref() == Some(to)
            })
        })
    }

    /// The initializing target entry of a relocating source
    fn relocation_target(&self, source: EntryId) -> Option<EntryId> {
        let s = self.get(source)?;
        if !s.relocating() {
            return None;
        }
        let to = s.relocating_node.as_deref()?;
        let from = s.current_node.as_deref()?;
        self.find_on_node(&s.shard_id, to).filter(|id| {
            self.get(*id)
                .is_some_and(|t| t.is_relocation_target() && t.relocating_node.as_deref() == Some(from))
        })
    }

    // ========================================
    // Validation
    // ========================================

    /// Check the structural invariants of the working copy
    pub fn assert_invariants(&self) -> std::result::Result<(), String> {
        let mut seen: HashSet<EntryId> = HashSet::new();

        for node in self.nodes.values() {
            let mut shards_here: HashSet<&ShardId> = HashSet::new();
            for id in &node.entries {
                if !seen.insert(*id) {
                    return Err(format!("entry #{} listed twice", id.0));
                }
                let shard = self
                    .get(*id)
                    .ok_or_else(|| format!("node [{}] lists dead entry #{}", node.node_id, id.0))?;
                if !shard.assigned() || !shard.is_on(&node.node_id) {
                    return Err(format!(
                        "{} listed under node [{}]",
                        shard.short_summary(),
                        node.node_id
                    ));
                }
                if !shards_here.insert(&shard.shard_id) {
                    return Err(format!(
                        "node [{}] holds two copies of {}",
                        node.node_id, shard.shard_id
                    ));
                }
            }
        }

        for id in &self.unassigned {
            if !seen.insert(*id) {
                return Err(format!("entry #{} listed twice", id.0));
            }
            let shard = self
                .get(*id)
                .ok_or_else(|| format!("unassigned pool lists dead entry #{}", id.0))?;
            if shard.assigned() || shard.current_node.is_some() {
                return Err(format!("{} in unassigned pool", shard.short_summary()));
            }
        }

        let mut active_primaries: HashMap<&ShardId, usize> = HashMap::new();
        for (id, shard) in self.iter() {
            if !seen.contains(&id) {
                return Err(format!("{} is not reachable", shard.short_summary()));
            }
            let needs_peer = shard.relocating() || shard.is_relocation_target();
            if needs_peer != shard.relocating_node.is_some() {
                return Err(format!("{} has a dangling relocation link", shard.short_summary()));
            }
            if shard.relocating() && self.relocation_target(id).is_none() {
                return Err(format!("{} has no relocation target", shard.short_summary()));
            }
            if shard.is_relocation_target() && self.relocation_source(id).is_none() {
                return Err(format!("{} has no relocation source", shard.short_summary()));
            }
            if shard.primary && shard.active() {
                *active_primaries.entry(&shard.shard_id).or_insert(0) += 1;
            }
        }

        if let Some((shard_id, _)) = active_primaries.iter().find(|(_, count)| **count > 1) {
            return Err(format!("{} has more than one active primary", shard_id));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard_id() -> ShardId {
        ShardId::new("test", 0)
    }

    /// Two nodes, one shard with one replica, nothing assigned
    fn make_routing() -> RoutingNodes {
        RoutingNodes::new(
            vec!["node1".to_string(), "node2".to_string()],
            vec![
                ShardRouting::unassigned(shard_id(), true),
                ShardRouting::unassigned(shard_id(), false),
            ],
        )
    }

    fn primary(routing: &RoutingNodes) -> EntryId {
        routing.find_unassigned(&shard_id(), Some(true)).unwrap()
    }

    #[test]
    fn test_remove_node_requires_empty_node() {
        let mut routing = make_routing();
        let id = primary(&routing);
        routing.initialize(id, "node1").unwrap();

        assert!(matches!(
            routing.remove_node("node1"),
            Err(ClusterError::Conflict(_))
        ));
        routing.remove_node("node2").unwrap();
        assert!(!routing.has_node("node2"));
        assert!(routing.has_node("node1"));
    }

    #[test]
    fn test_node_lookup() {
        let routing = make_routing();
        assert!(routing.node("node1").is_ok());
        assert!(matches!(
            routing.node("node9"),
            Err(ClusterError::NotFound(_))
        ));
        assert_eq!(routing.unassigned().len(), 2);
    }

    #[test]
    fn test_find_unassigned_prefers_primary() {
        let routing = make_routing();
        let id = routing.find_unassigned(&shard_id(), None).unwrap();
        assert!(routing.get(id).unwrap().primary);
    }

    #[test]
    fn test_initialize() {
        let mut routing = make_routing();
        let id = primary(&routing);
        routing.initialize(id, "node1").unwrap();

        let shard = routing.get(id).unwrap();
        assert_eq!(shard.state, ShardRoutingState::Initializing);
        assert_eq!(shard.current_node.as_deref(), Some("node1"));
        assert_eq!(routing.unassigned().len(), 1);
        assert_eq!(routing.node("node1").unwrap().entries(), &[id]);
        routing.assert_invariants().unwrap();
    }

    #[test]
    fn test_initialize_twice_conflicts() {
        let mut routing = make_routing();
        let id = primary(&routing);
        routing.initialize(id, "node1").unwrap();
        let err = routing.initialize(id, "node2").unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
        assert!(routing.shards_on("node2").next().is_none());
    }

    #[test]
    fn test_initialize_same_shard_on_same_node_conflicts() {
        let mut routing = make_routing();
        routing.initialize(primary(&routing), "node1").unwrap();
        let replica = routing.find_unassigned(&shard_id(), Some(false)).unwrap();
        let err = routing.initialize(replica, "node1").unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[test]
    fn test_relocate_and_start_target() {
        let mut routing = make_routing();
        let id = primary(&routing);
        routing.initialize(id, "node1").unwrap();
        routing.start(id).unwrap();

        let target = routing.relocate(id, "node1", "node2").unwrap();
        let source = routing.get(id).unwrap();
        assert_eq!(source.state, ShardRoutingState::Relocating);
        assert_eq!(source.relocating_node.as_deref(), Some("node2"));
        let t = routing.get(target).unwrap();
        assert_eq!(t.state, ShardRoutingState::Initializing);
        assert_eq!(t.relocating_node.as_deref(), Some("node1"));
        routing.assert_invariants().unwrap();

        routing.start(target).unwrap();
        assert!(routing.get(id).is_none());
        assert!(routing.node("node1").unwrap().is_empty());
        let t = routing.get(target).unwrap();
        assert_eq!(t.state, ShardRoutingState::Started);
        assert!(t.relocating_node.is_none());
        routing.assert_invariants().unwrap();
    }

    #[test]
    fn test_relocate_requires_started_on_source() {
        let mut routing = make_routing();
        let id = primary(&routing);
        routing.initialize(id, "node1").unwrap();

        let err = routing.relocate(id, "node1", "node2").unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));

        routing.start(id).unwrap();
        let err = routing.relocate(id, "node2", "node1").unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[test]
    fn test_cancel_relocation_target_restores_source() {
        let mut routing = make_routing();
        let id = primary(&routing);
        routing.initialize(id, "node1").unwrap();
        routing.start(id).unwrap();
        let target = routing.relocate(id, "node1", "node2").unwrap();

        routing.cancel(target, "node2").unwrap();
        assert!(routing.get(target).is_none());
        assert_eq!(routing.get(id).unwrap().state, ShardRoutingState::Started);
        routing.assert_invariants().unwrap();
    }

    #[test]
    fn test_cancel_relocation_source_drops_target() {
        let mut routing = make_routing();
        let id = primary(&routing);
        routing.initialize(id, "node1").unwrap();
        routing.start(id).unwrap();
        let target = routing.relocate(id, "node1", "node2").unwrap();

        routing.cancel(id, "node1").unwrap();
        assert!(routing.get(target).is_none());
        assert!(routing.get(id).unwrap().is_unassigned());
        assert_eq!(routing.unassigned().len(), 2);
        routing.assert_invariants().unwrap();
    }

    #[test]
    fn test_cancel_primary_promotes_active_replica() {
        let mut routing = make_routing();
        let p = primary(&routing);
        routing.initialize(p, "node1").unwrap();
        routing.start(p).unwrap();
        let r = routing.find_unassigned(&shard_id(), Some(false)).unwrap();
        routing.initialize(r, "node2").unwrap();
        routing.start(r).unwrap();

        routing.cancel(p, "node1").unwrap();
        assert!(routing.get(r).unwrap().primary);
        let demoted = routing.get(p).unwrap();
        assert!(!demoted.primary);
        assert!(demoted.is_unassigned());
        routing.assert_invariants().unwrap();
    }

    #[test]
    fn test_cancel_primary_fails_recovering_replica() {
        let mut routing = make_routing();
        let p = primary(&routing);
        routing.initialize(p, "node1").unwrap();
        routing.start(p).unwrap();
        let r = routing.find_unassigned(&shard_id(), Some(false)).unwrap();
        routing.initialize(r, "node2").unwrap();

        routing.cancel(p, "node1").unwrap();
        assert!(routing.get(p).unwrap().primary);
        assert!(routing.get(r).unwrap().is_unassigned());
        assert_eq!(routing.unassigned().len(), 2);
        routing.assert_invariants().unwrap();
    }

    #[test]
    fn test_cancel_on_wrong_node_conflicts() {
        let mut routing = make_routing();
        let id = primary(&routing);
        routing.initialize(id, "node1").unwrap();
        let err = routing.cancel(id, "node2").unwrap_err();
        assert!(matches!(err, ClusterError::Conflict(_)));
    }

    #[test]
    fn test_start_requires_initializing() {
        let mut routing = make_routing();
        let id = primary(&routing);
        assert!(matches!(
            routing.start(id),
            Err(ClusterError::Conflict(_))
        ));
    }
}
