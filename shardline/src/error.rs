//! Cluster-specific error types

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while routing shards or updating cluster state
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterError {
    /// Malformed or disallowed command parameters
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unknown node, index or shard reference
    #[error("Not found: {0}")]
    NotFound(String),

    /// A state precondition of the operation was not met
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A decider rejected the placement
    #[error("Allocation denied: {0}")]
    AllocationDenied(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The cluster service worker is no longer accepting tasks
    #[error("Cluster service closed")]
    ServiceClosed,
}

impl ClusterError {
    /// Get the error type as a string for metrics labeling
    pub fn error_type(&self) -> &'static str {
        match self {
            ClusterError::Validation(_) => "validation",
            ClusterError::NotFound(_) => "not_found",
            ClusterError::Conflict(_) => "conflict",
            ClusterError::AllocationDenied(_) => "allocation_denied",
            ClusterError::Config(_) => "config",
            ClusterError::Serialization(_) => "serialization",
            ClusterError::ServiceClosed => "service_closed",
        }
    }
}

impl From<std::io::Error> for ClusterError {
    fn from(err: std::io::Error) -> Self {
        ClusterError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for ClusterError {
    fn from(err: toml::de::Error) -> Self {
        ClusterError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_type_labels() {
        assert_eq!(
            ClusterError::Conflict("x".into()).error_type(),
            "conflict"
        );
        assert_eq!(
            ClusterError::AllocationDenied("x".into()).error_type(),
            "allocation_denied"
        );
        assert_eq!(ClusterError::ServiceClosed.error_type(), "service_closed");
    }

    #[test]
    fn test_error_display() {
        let err = ClusterError::NotFound("node [node9]".into());
        assert_eq!(err.to_string(), "Not found: node [node9]");
    }
}
