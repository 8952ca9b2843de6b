//! Cluster state file and the in-process service built around it

use anyhow::{Context, Result};
use shardline::{ClusterService, ClusterState, ClusterStateSnapshot, ShardlineConfig};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Read a cluster state file
pub fn load_state(path: &Path) -> Result<ClusterState> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file {}", path.display()))?;
    let snapshot: ClusterStateSnapshot = serde_json::from_str(&content)
        .with_context(|| format!("Invalid state file {}", path.display()))?;
    Ok(ClusterState::from_snapshot(snapshot)?)
}

/// Write a cluster state file, replacing it atomically
pub fn save_state(path: &Path, state: &ClusterState) -> Result<()> {
    let json = serde_json::to_string_pretty(&state.snapshot())?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {}", path.display()))?;
    debug!("Saved state version {} to {}", state.version(), path.display());
    Ok(())
}

/// A cluster service loaded from the state file
pub struct Session {
    pub service: ClusterService,
    state_path: PathBuf,
    loaded_version: u64,
}

impl Session {
    pub fn open(config: &ShardlineConfig, state_path: &Path) -> Result<Self> {
        let state = load_state(state_path)?;
        let loaded_version = state.version();
        let (service, _worker) = ClusterService::start(config, state);
        Ok(Self {
            service,
            state_path: state_path.to_path_buf(),
            loaded_version,
        })
    }

    pub fn state(&self) -> Arc<ClusterState> {
        self.service.state()
    }

    /// Write the authoritative state back if it changed
    pub fn persist(&self) -> Result<()> {
        let state = self.service.state();
        if state.version() == self.loaded_version {
            return Ok(());
        }
        save_state(&self.state_path, &state)?;
        info!(
            "Cluster state updated to version {} in {}",
            state.version(),
            self.state_path.display()
        );
        Ok(())
    }
}
