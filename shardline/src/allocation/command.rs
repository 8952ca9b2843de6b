//! Explicit allocation commands
//!
//! Commands are applied in order to the working copy of one reroute. A
//! command validates everything it needs before touching the routing, so a
//! rejected command leaves the working copy as it found it.

use super::{Decision, RerouteExplanation, RoutingAllocation};
use crate::error::{ClusterError, Result};
use crate::routing::{NodeId, ShardId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

/// A manual override of shard placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AllocationCommand {
    /// Place an unassigned copy of the shard on `node`
    Allocate {
        index: String,
        shard: u32,
        node: String,
        /// Required to place the primary copy
        #[serde(default)]
        allow_primary: bool,
    },

    /// Relocate the started copy on `from_node` to `to_node`
    Move {
        index: String,
        shard: u32,
        from_node: String,
        to_node: String,
    },

    /// Take the copy on `node` off that node
    Cancel {
        index: String,
        shard: u32,
        node: String,
    },
}

impl AllocationCommand {
    pub fn allocate(shard_id: ShardId, node: impl Into<String>, allow_primary: bool) -> Self {
        AllocationCommand::Allocate {
            index: shard_id.index,
            shard: shard_id.shard,
            node: node.into(),
            allow_primary,
        }
    }

    pub fn move_shard(
        shard_id: ShardId,
        from_node: impl Into<String>,
        to_node: impl Into<String>,
    ) -> Self {
        AllocationCommand::Move {
            index: shard_id.index,
            shard: shard_id.shard,
            from_node: from_node.into(),
            to_node: to_node.into(),
        }
    }

    pub fn cancel(shard_id: ShardId, node: impl Into<String>) -> Self {
        AllocationCommand::Cancel {
            index: shard_id.index,
            shard: shard_id.shard,
            node: node.into(),
        }
    }

    /// Command kind, as used in the `kind` tag and metric labels
    pub fn name(&self) -> &'static str {
        match self {
            AllocationCommand::Allocate { .. } => "allocate",
            AllocationCommand::Move { .. } => "move",
            AllocationCommand::Cancel { .. } => "cancel",
        }
    }

    pub fn shard_id(&self) -> ShardId {
        match self {
            AllocationCommand::Allocate { index, shard, .. }
            | AllocationCommand::Move { index, shard, .. }
            | AllocationCommand::Cancel { index, shard, .. } => ShardId::new(index.clone(), *shard),
        }
    }

    /// Apply the command to the working copy
    pub fn apply(&self, allocation: &mut RoutingAllocation<'_>) -> Result<RerouteExplanation> {
        let shard_id = self.shard_id();
        if !allocation.routing_nodes().has_shard(&shard_id) {
            return Err(ClusterError::NotFound(format!("shard {}", shard_id)));
        }

        let message = match self {
            AllocationCommand::Allocate {
                node,
                allow_primary,
                ..
            } => apply_allocate(allocation, &shard_id, node, *allow_primary)?,
            AllocationCommand::Move {
                from_node, to_node, ..
            } => apply_move(allocation, &shard_id, from_node, to_node)?,
            AllocationCommand::Cancel { node, .. } => apply_cancel(allocation, &shard_id, node)?,
        };
        debug!("Applied {}: {}", self, message);
        Ok(RerouteExplanation::accepted(self, message))
    }
}

fn apply_allocate(
    allocation: &mut RoutingAllocation<'_>,
    shard_id: &ShardId,
    node: &str,
    allow_primary: bool,
) -> Result<String> {
    let id = allocation
        .routing_nodes()
        .find_unassigned(shard_id, None)
        .ok_or_else(|| ClusterError::Conflict(format!("{} has no unassigned copy", shard_id)))?;
    let shard = allocation
        .routing_nodes()
        .get(id)
        .cloned()
        .ok_or_else(|| ClusterError::NotFound(format!("shard {}", shard_id)))?;
    if shard.primary && !allow_primary {
        return Err(ClusterError::Validation(format!(
            "primary allocation not permitted for {}, set allow_primary to force it",
            shard_id
        )));
    }
    let node_id = allocation.resolve_node(node)?;
    ensure_allowed(allocation.can_allocate(&shard, &node_id)?, shard_id, &node_id)?;

    allocation.routing_nodes_mut().initialize(id, &node_id)?;
    Ok(format!(
        "allocated {} copy of {} on [{}]",
        if shard.primary { "primary" } else { "replica" },
        shard_id,
        node_id
    ))
}

fn apply_move(
    allocation: &mut RoutingAllocation<'_>,
    shard_id: &ShardId,
    from_node: &str,
    to_node: &str,
) -> Result<String> {
    let from = allocation.resolve_node(from_node)?;
    let to = allocation.resolve_node(to_node)?;
    if from == to {
        return Err(ClusterError::Validation(format!(
            "cannot move {} from [{}] onto itself",
            shard_id, from
        )));
    }
    let routing = allocation.routing_nodes();
    let (id, shard) = routing
        .find_on_node(shard_id, &from)
        .and_then(|id| routing.get(id).map(|s| (id, s.clone())))
        .filter(|(_, s)| s.started())
        .ok_or_else(|| {
            ClusterError::Conflict(format!("{} is not STARTED on node [{}]", shard_id, from))
        })?;
    ensure_allowed(allocation.can_allocate(&shard, &to)?, shard_id, &to)?;

    allocation.routing_nodes_mut().relocate(id, &from, &to)?;
    Ok(format!("moving {} from [{}] to [{}]", shard_id, from, to))
}

fn apply_cancel(
    allocation: &mut RoutingAllocation<'_>,
    shard_id: &ShardId,
    node: &str,
) -> Result<String> {
    let node_id = allocation.resolve_node(node)?;
    let id = allocation
        .routing_nodes()
        .find_on_node(shard_id, &node_id)
        .ok_or_else(|| {
            ClusterError::Conflict(format!("{} is not assigned to node [{}]", shard_id, node_id))
        })?;
    allocation.routing_nodes_mut().cancel(id, &node_id)?;
    Ok(format!("cancelled {} on [{}]", shard_id, node_id))
}

/// Commands need an unconditional yes; a throttled placement is refused
fn ensure_allowed(decision: Decision, shard_id: &ShardId, node_id: &NodeId) -> Result<()> {
    match decision {
        Decision::Yes => Ok(()),
        Decision::No(reason) | Decision::Throttle(reason) => Err(ClusterError::AllocationDenied(
            format!("{} on node [{}]: {}", shard_id, node_id, reason),
        )),
    }
}

impl fmt::Display for AllocationCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocationCommand::Allocate {
                node,
                allow_primary,
                ..
            } => {
                write!(f, "allocate {} on [{}]", self.shard_id(), node)?;
                if *allow_primary {
                    f.write_str(" (allow_primary)")?;
                }
                Ok(())
            }
            AllocationCommand::Move {
                from_node, to_node, ..
            } => write!(f, "move {} from [{}] to [{}]", self.shard_id(), from_node, to_node),
            AllocationCommand::Cancel { node, .. } => {
                write!(f, "cancel {} on [{}]", self.shard_id(), node)
            }
        }
    }
}

/// Compact form used on the command line:
///
/// ```text
/// allocate:<index>:<shard>:<node>[:allow_primary]
/// move:<index>:<shard>:<from>:<to>
/// cancel:<index>:<shard>:<node>
/// ```
impl FromStr for AllocationCommand {
    type Err = ClusterError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        let invalid = || ClusterError::Validation(format!("invalid command '{}'", s));
        if parts.len() < 4 || parts[1].is_empty() {
            return Err(invalid());
        }
        let shard_id = ShardId::new(parts[1], parts[2].parse::<u32>().map_err(|_| invalid())?);

        match (parts[0], &parts[3..]) {
            ("allocate", [node]) => Ok(Self::allocate(shard_id, *node, false)),
            ("allocate", [node, "allow_primary"]) => Ok(Self::allocate(shard_id, *node, true)),
            ("move", [from, to]) => Ok(Self::move_shard(shard_id, *from, *to)),
            ("cancel", [node]) => Ok(Self::cancel(shard_id, *node)),
            _ => Err(invalid()),
        }
    }
}
