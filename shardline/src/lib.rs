//! Shardline - shard allocation and rerouting for clustered search indices
//!
//! Decides which node holds which copy of every index shard, accepts manual
//! placement commands, previews them as dry runs, and reports cluster health
//! that callers can wait on.
//!
//! # Architecture
//!
//! - **Routing**: per-copy [`ShardRouting`] values, the mutable
//!   [`RoutingNodes`] arena used during one reroute and the immutable
//!   [`RoutingTable`] stored in a published state
//! - **State**: immutable, versioned [`ClusterState`] snapshots
//! - **Allocation**: [`AllocationCommand`]s (allocate / move / cancel),
//!   pluggable [`AllocationDecider`]s and the [`AllocationService`] that
//!   combines them with automatic allocation
//! - **Service**: [`ClusterService`], the single worker that serializes
//!   updates and publishes new states
//! - **Health**: [`ClusterHealth`] derived from a state, with timeout-bounded
//!   waits that never fail on expiry
//!
//! # Example
//!
//! ```no_run
//! use shardline::{
//!     AllocationCommand, ClusterService, ClusterState, DiscoveryNode, IndexMetadata,
//!     RerouteOptions, ShardId, ShardlineConfig,
//! };
//!
//! # async fn run() -> shardline::Result<()> {
//! let (service, _worker) = ClusterService::start(&ShardlineConfig::default(), ClusterState::new("demo"));
//! service.add_node(DiscoveryNode::new("node1")).await?;
//! service.create_index(IndexMetadata::new("logs", 1, 1)).await?;
//!
//! let preview = service
//!     .reroute(
//!         vec![AllocationCommand::allocate(ShardId::new("logs", 0), "node1", true)],
//!         RerouteOptions::dry_run(),
//!     )
//!     .await
//!     .map_err(|failure| failure.error)?;
//! println!("preview version {}", preview.state.version());
//! # Ok(())
//! # }
//! ```

pub mod allocation;
pub mod api;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod routing;
pub mod service;
pub mod state;

pub use allocation::{
    AllocationCommand, AllocationDecider, AllocationDeciders, AllocationService, Decision,
    DecisionType, FailedShard, RerouteExplanation, RerouteFailure, RerouteOptions, RerouteResult,
    RoutingAllocation, StartedShard,
};
pub use api::{RerouteRequest, RerouteResponse};
pub use config::{AllocationConfig, HealthConfig, ServiceConfig, ShardlineConfig};
pub use error::{ClusterError, Result};
pub use health::{ClusterHealth, ClusterHealthStatus, HealthRequest, IndexHealth, NodeCountCondition};
pub use routing::{
    EntryId, IndexRoutingTable, NodeId, RoutingNode, RoutingNodes, RoutingTable, ShardId,
    ShardRouting, ShardRoutingState,
};
pub use service::ClusterService;
pub use state::{ClusterState, ClusterStateSnapshot, DiscoveryNode, DiscoveryNodes, IndexMetadata};
