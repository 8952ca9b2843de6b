//! Allocation service
//!
//! Turns a cluster state plus commands or shard confirmations into the next
//! cluster state. The service is stateless apart from its deciders and
//! their settings; callers decide whether a result gets published.

use super::{
    AllocationCommand, AllocationDecider, AllocationDeciders, Decision, RerouteExplanation,
    RoutingAllocation,
};
use crate::config::AllocationConfig;
use crate::error::{ClusterError, Result};
use crate::metrics;
use crate::routing::{EntryId, NodeId, RoutingTable, ShardId};
use crate::state::ClusterState;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Flags of one reroute request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerouteOptions {
    /// Preview only: no automatic allocation, never published
    #[serde(default)]
    pub dry_run: bool,

    /// Return a per-command explanation
    #[serde(default)]
    pub explain: bool,
}

impl RerouteOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Default::default()
        }
    }

    pub fn explain() -> Self {
        Self {
            explain: true,
            ..Default::default()
        }
    }
}

/// Successful reroute
#[derive(Debug, Clone)]
pub struct RerouteResult {
    /// The resulting state. For a dry run this is a preview only.
    pub state: Arc<ClusterState>,

    /// One entry per applied command; empty unless `explain` was set
    pub explanations: Vec<RerouteExplanation>,

    pub dry_run: bool,
}

/// Rejected reroute: nothing was applied
#[derive(Debug, Clone, thiserror::Error)]
#[error("reroute failed: {error}")]
pub struct RerouteFailure {
    pub error: ClusterError,

    /// Explanations of the commands up to and including the failed one
    pub explanations: Vec<RerouteExplanation>,

    /// The unchanged authoritative state
    pub state: Arc<ClusterState>,
}

/// Confirmation that a copy finished recovering on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedShard {
    pub shard_id: ShardId,
    pub node_id: NodeId,
}

impl StartedShard {
    pub fn new(shard_id: ShardId, node_id: impl Into<String>) -> Self {
        Self {
            shard_id,
            node_id: node_id.into(),
        }
    }
}

/// Report that a copy failed on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedShard {
    pub shard_id: ShardId,
    pub node_id: NodeId,
    #[serde(default)]
    pub reason: String,
}

impl FailedShard {
    pub fn new(shard_id: ShardId, node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            shard_id,
            node_id: node_id.into(),
            reason: reason.into(),
        }
    }
}

/// Computes new routing for a cluster state
#[derive(Debug)]
pub struct AllocationService {
    settings: Arc<RwLock<AllocationConfig>>,
    deciders: AllocationDeciders,
}

impl AllocationService {
    /// Create a service with the built-in deciders
    pub fn new(config: AllocationConfig) -> Self {
        let settings = Arc::new(RwLock::new(config));
        let deciders = AllocationDeciders::from_settings(Arc::clone(&settings));
        Self { settings, deciders }
    }

    /// Add a decider after the built-in ones
    pub fn add_decider(&mut self, decider: Arc<dyn AllocationDecider>) {
        self.deciders.push(decider);
    }

    pub fn deciders(&self) -> &AllocationDeciders {
        &self.deciders
    }

    /// Current decider settings
    pub fn settings(&self) -> AllocationConfig {
        self.settings.read().clone()
    }

    /// Replace the decider settings; the next allocation round sees them
    pub fn update_settings(&self, config: AllocationConfig) {
        info!(
            "Updating allocation settings: disable_allocation={}, disable_new_allocation={}, disable_replica_allocation={}",
            config.disable_allocation, config.disable_new_allocation, config.disable_replica_allocation
        );
        *self.settings.write() = config;
    }

    // ========================================
    // Reroute
    // ========================================

    /// Apply `commands` in order and, unless this is a dry run, allocate
    /// what is left unassigned.
    ///
    /// All-or-nothing: the first failing command aborts the whole request
    /// and the original state is handed back.
    pub fn reroute(
        &self,
        state: &Arc<ClusterState>,
        commands: &[AllocationCommand],
        options: RerouteOptions,
    ) -> std::result::Result<RerouteResult, RerouteFailure> {
        let start = Instant::now();
        let mut allocation = RoutingAllocation::new(state.routing_nodes(), state, &self.deciders);
        allocation.set_ignore_disable(true);

        let mut explanations = Vec::new();
        for command in commands {
            match command.apply(&mut allocation) {
                Ok(explanation) => {
                    metrics::record_command(command.name(), "ok");
                    if options.explain {
                        explanations.push(explanation);
                    }
                }
                Err(error) => {
                    warn!("Rejected {}: {}", command, error);
                    metrics::record_command(command.name(), error.error_type());
                    metrics::record_reroute(options.dry_run, false, start.elapsed());
                    if options.explain {
                        explanations.push(RerouteExplanation::rejected(command, &error));
                    }
                    return Err(RerouteFailure {
                        error,
                        explanations,
                        state: Arc::clone(state),
                    });
                }
            }
        }

        if !options.dry_run {
            allocation.set_ignore_disable(false);
            self.allocate_unassigned(&mut allocation);
        }

        let routing_table = RoutingTable::from_routing_nodes(allocation.into_routing_nodes());
        let next = Arc::new(state.with_routing_table(routing_table));
        metrics::record_reroute(options.dry_run, true, start.elapsed());
        if options.dry_run {
            debug!(
                "Dry-run reroute of {} commands previewed version {}",
                commands.len(),
                next.version()
            );
        } else {
            info!(
                "Rerouted with {} commands: version {} -> {}",
                commands.len(),
                state.version(),
                next.version()
            );
        }

        Ok(RerouteResult {
            state: next,
            explanations,
            dry_run: options.dry_run,
        })
    }

    /// Run only the automatic allocation pass. Returns the same state when
    /// nothing could be placed.
    pub fn reroute_automatic(&self, state: &Arc<ClusterState>) -> Arc<ClusterState> {
        let mut allocation = RoutingAllocation::new(state.routing_nodes(), state, &self.deciders);
        if self.allocate_unassigned(&mut allocation) == 0 {
            return Arc::clone(state);
        }
        let routing_table = RoutingTable::from_routing_nodes(allocation.into_routing_nodes());
        Arc::new(state.with_routing_table(routing_table))
    }

    // ========================================
    // Confirmation channel
    // ========================================

    /// Mark copies that finished recovering as started, then allocate.
    ///
    /// Confirmations that no longer match an initializing copy are stale
    /// and ignored.
    pub fn apply_started_shards(
        &self,
        state: &Arc<ClusterState>,
        started: &[StartedShard],
    ) -> Arc<ClusterState> {
        let mut routing = state.routing_nodes();
        let mut applied = 0;
        for shard in started {
            let Some(id) = routing
                .find_on_node(&shard.shard_id, &shard.node_id)
                .filter(|id| routing.get(*id).is_some_and(|s| s.initializing()))
            else {
                debug!(
                    "Ignoring stale started confirmation for {} on [{}]",
                    shard.shard_id, shard.node_id
                );
                continue;
            };
            match routing.start(id) {
                Ok(()) => {
                    applied += 1;
                    metrics::record_shard_event("started");
                }
                Err(e) => warn!("Failed to start {} on [{}]: {}", shard.shard_id, shard.node_id, e),
            }
        }
        if applied == 0 {
            return Arc::clone(state);
        }

        let mut allocation = RoutingAllocation::new(routing, state, &self.deciders);
        self.allocate_unassigned(&mut allocation);
        let routing_table = RoutingTable::from_routing_nodes(allocation.into_routing_nodes());
        Arc::new(state.with_routing_table(routing_table))
    }

    /// Return failed copies to the unassigned pool, then allocate
    pub fn apply_failed_shards(
        &self,
        state: &Arc<ClusterState>,
        failed: &[FailedShard],
    ) -> Arc<ClusterState> {
        let mut routing = state.routing_nodes();
        let mut applied = 0;
        for shard in failed {
            let Some(id) = routing.find_on_node(&shard.shard_id, &shard.node_id) else {
                debug!(
                    "Ignoring failure report for {} on [{}]: no such copy",
                    shard.shard_id, shard.node_id
                );
                continue;
            };
            match routing.fail(id) {
                Ok(()) => {
                    applied += 1;
                    metrics::record_shard_event("failed");
                    warn!(
                        "Shard {} failed on [{}]: {}",
                        shard.shard_id, shard.node_id, shard.reason
                    );
                }
                Err(e) => warn!("Failed to fail {} on [{}]: {}", shard.shard_id, shard.node_id, e),
            }
        }
        if applied == 0 {
            return Arc::clone(state);
        }

        let mut allocation = RoutingAllocation::new(routing, state, &self.deciders);
        self.allocate_unassigned(&mut allocation);
        let routing_table = RoutingTable::from_routing_nodes(allocation.into_routing_nodes());
        Arc::new(state.with_routing_table(routing_table))
    }

    /// A node left the cluster: fail every copy it held, drop it from the
    /// registry and reallocate
    pub fn disassociate_dead_node(
        &self,
        state: &Arc<ClusterState>,
        node_id: &str,
    ) -> Result<Arc<ClusterState>> {
        if !state.nodes().contains(node_id) {
            return Err(ClusterError::NotFound(format!("node [{}]", node_id)));
        }

        let mut routing = state.routing_nodes();
        let held: Vec<EntryId> = routing.node(node_id)?.entries().to_vec();
        for id in held {
            if routing.get(id).is_some() {
                routing.fail(id)?;
                metrics::record_shard_event("failed");
            }
        }
        routing.remove_node(node_id)?;

        let mut allocation = RoutingAllocation::new(routing, state, &self.deciders);
        self.allocate_unassigned(&mut allocation);
        let routing_table = RoutingTable::from_routing_nodes(allocation.into_routing_nodes());
        let next = state.with_node_removed(node_id, routing_table)?;
        info!("Node [{}] left, now at version {}", node_id, next.version());
        Ok(Arc::new(next))
    }

    // ========================================
    // Automatic allocation
    // ========================================

    /// Place unassigned copies, primaries first. Each copy goes to the
    /// least loaded node (ties broken by node id) the deciders accept.
    /// Returns the number of copies placed.
    fn allocate_unassigned(&self, allocation: &mut RoutingAllocation<'_>) -> usize {
        let mut pending: Vec<EntryId> = allocation.routing_nodes().unassigned().to_vec();
        pending.sort_by_key(|id| {
            allocation
                .routing_nodes()
                .get(*id)
                .map_or(true, |s| !s.primary)
        });

        let mut allocated = 0;
        for id in pending {
            let Some(shard) = allocation.routing_nodes().get(id).cloned() else {
                continue;
            };
            if !shard.is_unassigned() {
                continue;
            }

            let mut candidates: Vec<(usize, NodeId)> = allocation
                .routing_nodes()
                .nodes()
                .map(|node| (node.len(), node.node_id().to_string()))
                .collect();
            candidates.sort();

            let mut throttled = false;
            let target = candidates.into_iter().find_map(|(_, node_id)| {
                match allocation.can_allocate(&shard, &node_id) {
                    Ok(Decision::Yes) => Some(node_id),
                    Ok(Decision::Throttle(_)) => {
                        throttled = true;
                        None
                    }
                    _ => None,
                }
            });

            match target {
                Some(node_id) => match allocation.routing_nodes_mut().initialize(id, &node_id) {
                    Ok(()) => allocated += 1,
                    Err(e) => warn!("Failed to allocate {}: {}", shard.short_summary(), e),
                },
                None if throttled => debug!("Allocation of {} throttled", shard.short_summary()),
                None => debug!("No node accepts {}", shard.short_summary()),
            }
        }

        if allocated > 0 {
            info!("Automatically allocated {} shard copies", allocated);
            metrics::record_shards_allocated(allocated);
        }
        allocated
    }
}
