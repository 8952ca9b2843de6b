//! Shardline configuration
//!
//! Loaded from TOML. Every field has a default so an empty file (or no
//! file at all) yields a usable configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ShardlineConfig {
    /// Name reported in cluster health
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Allocation decider settings
    #[serde(default)]
    pub allocation: AllocationConfig,

    /// Health request defaults
    #[serde(default)]
    pub health: HealthConfig,

    /// Cluster service worker settings
    #[serde(default)]
    pub service: ServiceConfig,
}

fn default_cluster_name() -> String {
    "shardline".to_string()
}

impl Default for ShardlineConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            allocation: AllocationConfig::default(),
            health: HealthConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

impl ShardlineConfig {
    /// Load config from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: ShardlineConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load config from file path, or fall back to defaults if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Settings consumed by the built-in allocation deciders.
///
/// The `disable_*` switches only gate automatic allocation; explicit
/// allocation commands bypass them.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct AllocationConfig {
    /// Disable automatic allocation of every shard copy
    #[serde(default)]
    pub disable_allocation: bool,

    /// Disable automatic allocation of unassigned primaries
    #[serde(default)]
    pub disable_new_allocation: bool,

    /// Disable automatic allocation of replicas
    #[serde(default)]
    pub disable_replica_allocation: bool,

    /// Maximum initializing copies per node before allocation is throttled
    #[serde(default = "default_node_concurrent_recoveries")]
    pub node_concurrent_recoveries: usize,

    /// Nodes that must never receive shard copies
    #[serde(default)]
    pub exclude_nodes: Vec<String>,
}

fn default_node_concurrent_recoveries() -> usize {
    2
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            disable_allocation: false,
            disable_new_allocation: false,
            disable_replica_allocation: false,
            node_concurrent_recoveries: default_node_concurrent_recoveries(),
            exclude_nodes: Vec::new(),
        }
    }
}

impl AllocationConfig {
    /// Settings with every automatic allocation switch turned off
    pub fn disabled() -> Self {
        Self {
            disable_allocation: true,
            disable_new_allocation: true,
            ..Default::default()
        }
    }
}

/// Health request defaults
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct HealthConfig {
    /// Timeout applied when a health request does not carry one
    #[serde(default = "default_health_timeout")]
    pub default_timeout_ms: u64,
}

fn default_health_timeout() -> u64 {
    30_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_health_timeout(),
        }
    }
}

impl HealthConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// Cluster service worker settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceConfig {
    /// Capacity of the cluster-state update queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}
