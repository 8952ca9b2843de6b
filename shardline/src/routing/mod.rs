//! Shard routing model
//!
//! Every copy of every shard is tracked as its own [`ShardRouting`] entry.
//! A copy moves through the following states:
//!
//! ```text
//!   UNASSIGNED → INITIALIZING → STARTED → RELOCATING
//!        ↑            │             │          │
//!        └────────────┴─────────────┴──────────┘  (cancel / fail)
//! ```
//!
//! A relocation is represented by two linked entries: the source copy in
//! `RELOCATING` (pointing at the target node) and a target copy in
//! `INITIALIZING` (pointing back at the source node). Starting the target
//! removes the source.
//!
//! [`RoutingNodes`] is the mutable per-reroute working copy, [`RoutingTable`]
//! the immutable projection stored in a published cluster state.

mod nodes;
mod table;

pub use nodes::{EntryId, RoutingNode, RoutingNodes};
pub use table::{IndexRoutingTable, RoutingTable};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier
pub type NodeId = String;

/// Identifies a logical shard slot of an index
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    /// Index this shard belongs to
    pub index: String,
    /// Shard number within the index
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// State of a single shard copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardRoutingState {
    /// Not placed on any node
    #[default]
    Unassigned,
    /// Placed on a node and recovering
    Initializing,
    /// Serving on its node
    Started,
    /// Serving on its node while a copy initializes elsewhere
    Relocating,
}

impl ShardRoutingState {
    /// Started or relocating: the copy holds usable data
    pub fn active(&self) -> bool {
        matches!(self, ShardRoutingState::Started | ShardRoutingState::Relocating)
    }

    /// Anything but unassigned
    pub fn assigned(&self) -> bool {
        !matches!(self, ShardRoutingState::Unassigned)
    }

    /// Get state as a string for metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ShardRoutingState::Unassigned => "UNASSIGNED",
            ShardRoutingState::Initializing => "INITIALIZING",
            ShardRoutingState::Started => "STARTED",
            ShardRoutingState::Relocating => "RELOCATING",
        }
    }
}

impl fmt::Display for ShardRoutingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Placement and state of one shard copy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    /// Logical shard this copy belongs to
    pub shard_id: ShardId,

    /// Whether this is the primary copy
    pub primary: bool,

    /// Lifecycle state
    pub state: ShardRoutingState,

    /// Node holding the copy; `None` iff unassigned
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_node: Option<NodeId>,

    /// Relocation peer: the target node on a `RELOCATING` source, the source
    /// node on an `INITIALIZING` relocation target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relocating_node: Option<NodeId>,

    /// Bumped on every state transition of this copy
    #[serde(default)]
    pub version: u64,
}

impl ShardRouting {
    /// Create a fresh unassigned copy
    pub fn unassigned(shard_id: ShardId, primary: bool) -> Self {
        Self {
            shard_id,
            primary,
            state: ShardRoutingState::Unassigned,
            current_node: None,
            relocating_node: None,
            version: 0,
        }
    }

    pub fn active(&self) -> bool {
        self.state.active()
    }

    pub fn assigned(&self) -> bool {
        self.state.assigned()
    }

    pub fn is_unassigned(&self) -> bool {
        self.state == ShardRoutingState::Unassigned
    }

    pub fn initializing(&self) -> bool {
        self.state == ShardRoutingState::Initializing
    }

    pub fn started(&self) -> bool {
        self.state == ShardRoutingState::Started
    }

    pub fn relocating(&self) -> bool {
        self.state == ShardRoutingState::Relocating
    }

    /// The initializing side of an in-flight relocation
    pub fn is_relocation_target(&self) -> bool {
        self.initializing() && self.relocating_node.is_some()
    }

    /// Whether the copy currently sits on `node_id`
    pub fn is_on(&self, node_id: &str) -> bool {
        self.current_node.as_deref() == Some(node_id)
    }

    /// One-line description used in logs and error messages
    pub fn short_summary(&self) -> String {
        let role = if self.primary { "P" } else { "R" };
        match (&self.current_node, &self.relocating_node) {
            (Some(node), Some(peer)) if self.relocating() => {
                format!("{}[{}] {} on {} -> {}", self.shard_id, role, self.state, node, peer)
            }
            (Some(node), Some(peer)) => {
                format!("{}[{}] {} on {} <- {}", self.shard_id, role, self.state, node, peer)
            }
            (Some(node), None) => format!("{}[{}] {} on {}", self.shard_id, role, self.state, node),
            (None, _) => format!("{}[{}] {}", self.shard_id, role, self.state),
        }
    }

    // ========================================
    // Transitions (driven by RoutingNodes)
    // ========================================

    pub(crate) fn initialize(&mut self, node_id: &str) {
        self.state = ShardRoutingState::Initializing;
        self.current_node = Some(node_id.to_string());
        self.relocating_node = None;
        self.version += 1;
    }

    pub(crate) fn relocate(&mut self, target_node: &str) {
        self.state = ShardRoutingState::Relocating;
        self.relocating_node = Some(target_node.to_string());
        self.version += 1;
    }

    pub(crate) fn cancel_relocation(&mut self) {
        self.state = ShardRoutingState::Started;
        self.relocating_node = None;
        self.version += 1;
    }

    pub(crate) fn move_to_started(&mut self) {
        self.state = ShardRoutingState::Started;
        self.relocating_node = None;
        self.version += 1;
    }

    pub(crate) fn move_to_unassigned(&mut self) {
        self.state = ShardRoutingState::Unassigned;
        self.current_node = None;
        self.relocating_node = None;
        self.version += 1;
    }

    /// Build the initializing target entry for a copy that was just marked relocating
    pub(crate) fn relocation_target(&self) -> Option<ShardRouting> {
        Some(ShardRouting {
            shard_id: self.shard_id.clone(),
            primary: self.primary,
            state: ShardRoutingState::Initializing,
            current_node: self.relocating_node.clone(),
            relocating_node: Some(self.current_node.clone()?),
            version: self.version,
        })
    }
}

impl fmt::Display for ShardRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.short_summary())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shard_id_display() {
        assert_eq!(ShardId::new("test", 3).to_string(), "[test][3]");
    }

    #[test]
    fn test_state_helpers() {
        assert!(ShardRoutingState::Started.active());
        assert!(ShardRoutingState::Relocating.active());
        assert!(!ShardRoutingState::Initializing.active());
        assert!(ShardRoutingState::Initializing.assigned());
        assert!(!ShardRoutingState::Unassigned.assigned());
        assert_eq!(ShardRoutingState::default(), ShardRoutingState::Unassigned);
    }

    #[test]
    fn test_state_serializes_uppercase() {
        let json = serde_json::to_string(&ShardRoutingState::Initializing).unwrap();
        assert_eq!(json, "\"INITIALIZING\"");
    }

    #[test]
    fn test_relocation_target_links_back_to_source() {
        let mut shard = ShardRouting::unassigned(ShardId::new("test", 0), true);
        shard.initialize("node1");
        shard.move_to_started();
        shard.relocate("node2");

        let target = shard.relocation_target().unwrap();
        assert_eq!(target.state, ShardRoutingState::Initializing);
        assert_eq!(target.current_node.as_deref(), Some("node2"));
        assert_eq!(target.relocating_node.as_deref(), Some("node1"));
        assert!(target.is_relocation_target());
        assert!(target.primary);
    }

    #[test]
    fn test_transitions_bump_version() {
        let mut shard = ShardRouting::unassigned(ShardId::new("test", 0), false);
        shard.initialize("node1");
        shard.move_to_started();
        assert_eq!(shard.version, 2);
        shard.move_to_unassigned();
        assert_eq!(shard.version, 3);
        assert!(shard.current_node.is_none());
    }

    #[test]
    fn test_short_summary() {
        let mut shard = ShardRouting::unassigned(ShardId::new("test", 0), true);
        assert_eq!(shard.short_summary(), "[test][0][P] UNASSIGNED");
        shard.initialize("node1");
        shard.move_to_started();
        shard.relocate("node2");
        assert_eq!(shard.short_summary(), "[test][0][P] RELOCATING on node1 -> node2");
    }
}
