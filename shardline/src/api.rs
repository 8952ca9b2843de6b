//! Request and response shapes for a transport layer
//!
//! These are plain serde types; moving them over a wire is up to the
//! embedding application.

use crate::allocation::{
    AllocationCommand, RerouteExplanation, RerouteFailure, RerouteOptions, RerouteResult,
};
use crate::error::ClusterError;
use crate::state::ClusterStateSnapshot;
use serde::{Deserialize, Serialize};

pub use crate::health::{ClusterHealth as HealthResponse, HealthRequest};

/// Reroute request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerouteRequest {
    /// Applied in order; the whole request fails on the first rejection
    #[serde(default)]
    pub commands: Vec<AllocationCommand>,

    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub explain: bool,
}

impl RerouteRequest {
    pub fn new(commands: Vec<AllocationCommand>) -> Self {
        Self {
            commands,
            ..Default::default()
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn explain(mut self, explain: bool) -> Self {
        self.explain = explain;
        self
    }

    pub fn options(&self) -> RerouteOptions {
        RerouteOptions {
            dry_run: self.dry_run,
            explain: self.explain,
        }
    }
}

/// Error body of a rejected request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(rename = "type")]
    pub error_type: String,
    pub reason: String,
}

impl From<&ClusterError> for ErrorResponse {
    fn from(err: &ClusterError) -> Self {
        Self {
            error_type: err.error_type().to_string(),
            reason: err.to_string(),
        }
    }
}

/// Reroute response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerouteResponse {
    /// Whether the request was applied (or previewed) without error
    pub acknowledged: bool,

    /// When set, `state` is a preview and not the authoritative state
    pub dry_run: bool,

    /// Resulting state, or the unchanged state on error
    pub state: ClusterStateSnapshot,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanations: Option<Vec<RerouteExplanation>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorResponse>,
}

impl RerouteResponse {
    pub fn from_result(result: &RerouteResult, explain: bool) -> Self {
        Self {
            acknowledged: true,
            dry_run: result.dry_run,
            state: result.state.snapshot(),
            explanations: explain.then(|| result.explanations.clone()),
            error: None,
        }
    }

    pub fn from_failure(failure: &RerouteFailure, request: &RerouteRequest) -> Self {
        Self {
            acknowledged: false,
            dry_run: request.dry_run,
            state: failure.state.snapshot(),
            explanations: request.explain.then(|| failure.explanations.clone()),
            error: Some(ErrorResponse::from(&failure.error)),
        }
    }

    pub fn from_outcome(
        outcome: &Result<RerouteResult, RerouteFailure>,
        request: &RerouteRequest,
    ) -> Self {
        match outcome {
            Ok(result) => Self::from_result(result, request.explain),
            Err(failure) => Self::from_failure(failure, request),
        }
    }
}
