//! Shard allocation
//!
//! A reroute builds a [`RoutingAllocation`] around a fresh
//! [`RoutingNodes`] working copy, applies [`AllocationCommand`]s to it in
//! order and, unless it is a dry run, lets the [`AllocationService`] place
//! the remaining unassigned copies. Every placement is checked against the
//! configured [`AllocationDeciders`].

pub mod command;
pub mod decider;
mod service;

pub use command::AllocationCommand;
pub use decider::{
    AllocationDecider, AllocationDeciders, DisableAllocationDecider, FilterDecider,
    ReplicaAfterPrimaryActiveDecider, SameShardDecider, ThrottlingDecider,
};
pub use service::{
    AllocationService, FailedShard, RerouteFailure, RerouteOptions, RerouteResult, StartedShard,
};

use crate::error::{ClusterError, Result};
use crate::routing::{NodeId, RoutingNodes, ShardRouting};
use crate::state::{ClusterState, DiscoveryNodes, IndexMetadata};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Verdict of a decider on a proposed placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "reason", rename_all = "lowercase")]
pub enum Decision {
    Yes,
    No(String),
    /// Allowed in principle, but not right now
    Throttle(String),
}

impl Decision {
    pub fn decision_type(&self) -> DecisionType {
        match self {
            Decision::Yes => DecisionType::Yes,
            Decision::No(_) => DecisionType::No,
            Decision::Throttle(_) => DecisionType::Throttle,
        }
    }

    pub fn is_yes(&self) -> bool {
        matches!(self, Decision::Yes)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Decision::Yes => None,
            Decision::No(reason) | Decision::Throttle(reason) => Some(reason),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Yes => f.write_str("YES"),
            Decision::No(reason) => write!(f, "NO({})", reason),
            Decision::Throttle(reason) => write!(f, "THROTTLE({})", reason),
        }
    }
}

/// Outcome class of a decision or command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionType {
    Yes,
    No,
    Throttle,
}

/// Per-command explanation returned by a reroute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerouteExplanation {
    pub command: AllocationCommand,
    pub decision: DecisionType,
    pub message: String,
}

impl RerouteExplanation {
    pub fn accepted(command: &AllocationCommand, message: impl Into<String>) -> Self {
        Self {
            command: command.clone(),
            decision: DecisionType::Yes,
            message: message.into(),
        }
    }

    pub fn rejected(command: &AllocationCommand, error: &ClusterError) -> Self {
        Self {
            command: command.clone(),
            decision: DecisionType::No,
            message: error.to_string(),
        }
    }
}

/// Working state of one reroute: the mutable routing plus read-only
/// access to the node registry, index metadata and deciders
pub struct RoutingAllocation<'a> {
    routing_nodes: RoutingNodes,
    nodes: &'a DiscoveryNodes,
    metadata: &'a BTreeMap<String, IndexMetadata>,
    deciders: &'a AllocationDeciders,
    ignore_disable: bool,
}

impl<'a> RoutingAllocation<'a> {
    pub fn new(
        routing_nodes: RoutingNodes,
        state: &'a ClusterState,
        deciders: &'a AllocationDeciders,
    ) -> Self {
        Self {
            routing_nodes,
            nodes: state.nodes(),
            metadata: state.metadata(),
            deciders,
            ignore_disable: false,
        }
    }

    pub fn routing_nodes(&self) -> &RoutingNodes {
        &self.routing_nodes
    }

    pub fn routing_nodes_mut(&mut self) -> &mut RoutingNodes {
        &mut self.routing_nodes
    }

    pub fn nodes(&self) -> &DiscoveryNodes {
        self.nodes
    }

    pub fn metadata(&self) -> &BTreeMap<String, IndexMetadata> {
        self.metadata
    }

    /// Whether the `disable_*` allocation settings are bypassed. Set while
    /// explicit commands are applied.
    pub fn ignore_disable(&self) -> bool {
        self.ignore_disable
    }

    pub fn set_ignore_disable(&mut self, ignore: bool) {
        self.ignore_disable = ignore;
    }

    /// Resolve a node id or name to a node id that can hold copies
    pub fn resolve_node(&self, id_or_name: &str) -> Result<NodeId> {
        let node = self.nodes.resolve_node(id_or_name)?;
        if !self.routing_nodes.has_node(&node.id) {
            return Err(ClusterError::NotFound(format!("node [{}]", id_or_name)));
        }
        Ok(node.id.clone())
    }

    /// Ask every decider whether `shard` may be placed on `node_id`
    pub fn can_allocate(&self, shard: &ShardRouting, node_id: &str) -> Result<Decision> {
        let node = self.routing_nodes.node(node_id)?;
        Ok(self.deciders.can_allocate(shard, node, self))
    }

    pub fn into_routing_nodes(self) -> RoutingNodes {
        self.routing_nodes
    }
}
