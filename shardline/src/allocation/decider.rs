//! Allocation deciders
//!
//! Each decider answers one question about a proposed placement of a shard
//! copy on a node. The composite [`AllocationDeciders`] asks all of them:
//! a single `No` rejects the placement, otherwise a single `Throttle`
//! postpones it, otherwise it is allowed.

use super::{Decision, RoutingAllocation};
use crate::config::AllocationConfig;
use crate::routing::{RoutingNode, ShardRouting};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

/// Policy oracle for shard placement
pub trait AllocationDecider: Send + Sync + fmt::Debug {
    /// Short name used in logs and decision reasons
    fn name(&self) -> &'static str;

    /// Whether `shard` may be placed on `node`
    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision;
}

/// Never place two copies of the same shard on one node
#[derive(Debug, Default)]
pub struct SameShardDecider;

impl AllocationDecider for SameShardDecider {
    fn name(&self) -> &'static str {
        "same_shard"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        let held = allocation
            .routing_nodes()
            .shards_on(node.node_id())
            .any(|s| s.shard_id == shard.shard_id);
        if held {
            Decision::No(format!(
                "node [{}] already holds a copy of {}",
                node.node_id(),
                shard.shard_id
            ))
        } else {
            Decision::Yes
        }
    }
}

/// Replicas recover from the primary, so they wait until it is active
#[derive(Debug, Default)]
pub struct ReplicaAfterPrimaryActiveDecider;

impl AllocationDecider for ReplicaAfterPrimaryActiveDecider {
    fn name(&self) -> &'static str {
        "replica_after_primary_active"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        if shard.primary || allocation.routing_nodes().active_primary(&shard.shard_id).is_some() {
            Decision::Yes
        } else {
            Decision::No(format!("primary of {} is not active", shard.shard_id))
        }
    }
}

/// Cluster-wide switches for automatic allocation.
///
/// Explicit commands bypass these switches.
#[derive(Debug)]
pub struct DisableAllocationDecider {
    settings: Arc<RwLock<AllocationConfig>>,
}

impl DisableAllocationDecider {
    pub fn new(settings: Arc<RwLock<AllocationConfig>>) -> Self {
        Self { settings }
    }
}

impl AllocationDecider for DisableAllocationDecider {
    fn name(&self) -> &'static str {
        "disable"
    }

    fn can_allocate(
        &self,
        shard: &ShardRouting,
        _node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        if allocation.ignore_disable() {
            return Decision::Yes;
        }
        let settings = self.settings.read();
        if settings.disable_allocation {
            return Decision::No("allocation is disabled".into());
        }
        if shard.primary && settings.disable_new_allocation {
            return Decision::No("new primary allocation is disabled".into());
        }
        if !shard.primary && settings.disable_replica_allocation {
            return Decision::No("replica allocation is disabled".into());
        }
        Decision::Yes
    }
}

/// Limit concurrent recoveries per node
#[derive(Debug)]
pub struct ThrottlingDecider {
    settings: Arc<RwLock<AllocationConfig>>,
}

impl ThrottlingDecider {
    pub fn new(settings: Arc<RwLock<AllocationConfig>>) -> Self {
        Self { settings }
    }
}

impl AllocationDecider for ThrottlingDecider {
    fn name(&self) -> &'static str {
        "throttling"
    }

    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        let limit = self.settings.read().node_concurrent_recoveries;
        let recovering = allocation.routing_nodes().initializing_on(node.node_id());
        if recovering >= limit {
            Decision::Throttle(format!(
                "node [{}] has {} recoveries in flight (limit {})",
                node.node_id(),
                recovering,
                limit
            ))
        } else {
            Decision::Yes
        }
    }
}

/// Keep copies off excluded nodes
#[derive(Debug)]
pub struct FilterDecider {
    settings: Arc<RwLock<AllocationConfig>>,
}

impl FilterDecider {
    pub fn new(settings: Arc<RwLock<AllocationConfig>>) -> Self {
        Self { settings }
    }
}

impl AllocationDecider for FilterDecider {
    fn name(&self) -> &'static str {
        "filter"
    }

    fn can_allocate(
        &self,
        _shard: &ShardRouting,
        node: &RoutingNode,
        _allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        let settings = self.settings.read();
        if settings.exclude_nodes.iter().any(|n| n == node.node_id()) {
            Decision::No(format!("node [{}] is excluded", node.node_id()))
        } else {
            Decision::Yes
        }
    }
}

/// Ordered set of deciders combined into one verdict
#[derive(Debug, Clone, Default)]
pub struct AllocationDeciders {
    deciders: Vec<Arc<dyn AllocationDecider>>,
}

impl AllocationDeciders {
    pub fn new(deciders: Vec<Arc<dyn AllocationDecider>>) -> Self {
        Self { deciders }
    }

    /// The built-in deciders, reading their settings from `settings`
    pub fn from_settings(settings: Arc<RwLock<AllocationConfig>>) -> Self {
        Self::new(vec![
            Arc::new(SameShardDecider),
            Arc::new(ReplicaAfterPrimaryActiveDecider),
            Arc::new(FilterDecider::new(Arc::clone(&settings))),
            Arc::new(DisableAllocationDecider::new(Arc::clone(&settings))),
            Arc::new(ThrottlingDecider::new(settings)),
        ])
    }

    pub fn with_decider(mut self, decider: Arc<dyn AllocationDecider>) -> Self {
        self.deciders.push(decider);
        self
    }

    pub fn push(&mut self, decider: Arc<dyn AllocationDecider>) {
        self.deciders.push(decider);
    }

    pub fn len(&self) -> usize {
        self.deciders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deciders.is_empty()
    }

    /// Combined verdict. `No` short-circuits; the first `Throttle` is kept
    /// in case a later decider says `No`.
    pub fn can_allocate(
        &self,
        shard: &ShardRouting,
        node: &RoutingNode,
        allocation: &RoutingAllocation<'_>,
    ) -> Decision {
        let mut verdict = Decision::Yes;
        for decider in &self.deciders {
            match decider.can_allocate(shard, node, allocation) {
                Decision::Yes => {}
                Decision::No(reason) => {
                    return Decision::No(format!("[{}] {}", decider.name(), reason));
                }
                Decision::Throttle(reason) => {
                    if verdict.is_yes() {
                        verdict = Decision::Throttle(format!("[{}] {}", decider.name(), reason));
                    }
                }
            }
        }
        verdict
    }
}
