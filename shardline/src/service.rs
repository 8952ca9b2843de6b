//! Cluster service
//!
//! One worker task owns the authoritative cluster state. Every update is a
//! [`ClusterTask`] sent over a bounded queue; the worker runs tasks one at a
//! time, publishes each new state on a `watch` channel and answers through
//! a oneshot. Readers only ever see complete, published states whose
//! versions never go down.
//!
//! Dry-run reroutes go through the same queue so they read a consistent
//! state, but their result is never published.

use crate::allocation::{
    AllocationCommand, AllocationService, FailedShard, RerouteFailure, RerouteOptions,
    RerouteResult, StartedShard,
};
use crate::config::{AllocationConfig, ShardlineConfig};
use crate::error::{ClusterError, Result};
use crate::health::{self, ClusterHealth, HealthRequest};
use crate::metrics::{self, TaskTimer};
use crate::state::{ClusterState, DiscoveryNode, IndexMetadata};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply<T> = oneshot::Sender<T>;

/// Unit of work for the cluster service worker
enum ClusterTask {
    Reroute {
        commands: Vec<AllocationCommand>,
        options: RerouteOptions,
        reply: Reply<std::result::Result<RerouteResult, RerouteFailure>>,
    },
    ShardStarted {
        shards: Vec<StartedShard>,
        reply: Reply<Arc<ClusterState>>,
    },
    ShardFailed {
        shards: Vec<FailedShard>,
        reply: Reply<Arc<ClusterState>>,
    },
    AddNode {
        node: DiscoveryNode,
        reply: Reply<Arc<ClusterState>>,
    },
    RemoveNode {
        node_id: String,
        reply: Reply<Result<Arc<ClusterState>>>,
    },
    CreateIndex {
        metadata: IndexMetadata,
        reply: Reply<Result<Arc<ClusterState>>>,
    },
    DeleteIndex {
        name: String,
        reply: Reply<Result<Arc<ClusterState>>>,
    },
    UpdateSettings {
        settings: AllocationConfig,
        reply: Reply<Arc<ClusterState>>,
    },
}

impl ClusterTask {
    fn name(&self) -> &'static str {
        match self {
            ClusterTask::Reroute { .. } => "reroute",
            ClusterTask::ShardStarted { .. } => "shard_started",
            ClusterTask::ShardFailed { .. } => "shard_failed",
            ClusterTask::AddNode { .. } => "add_node",
            ClusterTask::RemoveNode { .. } => "remove_node",
            ClusterTask::CreateIndex { .. } => "create_index",
            ClusterTask::DeleteIndex { .. } => "delete_index",
            ClusterTask::UpdateSettings { .. } => "update_settings",
        }
    }
}

/// Handle to the cluster service worker. Cheap to clone; the worker stops
/// once every handle is dropped.
#[derive(Clone)]
pub struct ClusterService {
    tasks: mpsc::Sender<ClusterTask>,
    states: watch::Receiver<Arc<ClusterState>>,
    default_health_timeout: Duration,
}

impl ClusterService {
    /// Spawn the worker with the built-in deciders. Must be called within a
    /// tokio runtime.
    pub fn start(config: &ShardlineConfig, initial: ClusterState) -> (Self, JoinHandle<()>) {
        let allocation = AllocationService::new(config.allocation.clone());
        Self::start_with(config, initial, allocation)
    }

    /// Spawn the worker around a preconfigured allocation service
    pub fn start_with(
        config: &ShardlineConfig,
        initial: ClusterState,
        allocation: AllocationService,
    ) -> (Self, JoinHandle<()>) {
        let (task_tx, task_rx) = mpsc::channel(config.service.queue_capacity.max(1));
        let initial = Arc::new(initial);
        let (state_tx, state_rx) = watch::channel(Arc::clone(&initial));
        metrics::update_cluster_state_metrics(&initial);

        let worker = ClusterWorker {
            allocation,
            state: initial,
            publisher: state_tx,
        };
        let handle = tokio::spawn(worker.run(task_rx));
        info!("Cluster service started for [{}]", config.cluster_name);

        (
            Self {
                tasks: task_tx,
                states: state_rx,
                default_health_timeout: config.health.default_timeout(),
            },
            handle,
        )
    }

    /// The current authoritative state
    pub fn state(&self) -> Arc<ClusterState> {
        Arc::clone(&self.states.borrow())
    }

    /// Receiver notified on every publication
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.states.clone()
    }

    async fn submit<T>(&self, make: impl FnOnce(Reply<T>) -> ClusterTask) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tasks
            .send(make(reply))
            .await
            .map_err(|_| ClusterError::ServiceClosed)?;
        rx.await.map_err(|_| ClusterError::ServiceClosed)
    }

    /// Apply commands; see [`AllocationService::reroute`]
    pub async fn reroute(
        &self,
        commands: Vec<AllocationCommand>,
        options: RerouteOptions,
    ) -> std::result::Result<RerouteResult, RerouteFailure> {
        match self
            .submit(|reply| ClusterTask::Reroute {
                commands,
                options,
                reply,
            })
            .await
        {
            Ok(result) => result,
            Err(error) => Err(RerouteFailure {
                error,
                explanations: Vec::new(),
                state: self.state(),
            }),
        }
    }

    /// Confirm that copies finished recovering
    pub async fn shard_started(&self, shards: Vec<StartedShard>) -> Result<Arc<ClusterState>> {
        self.submit(|reply| ClusterTask::ShardStarted { shards, reply })
            .await
    }

    /// Report copies that failed
    pub async fn shard_failed(&self, shards: Vec<FailedShard>) -> Result<Arc<ClusterState>> {
        self.submit(|reply| ClusterTask::ShardFailed { shards, reply })
            .await
    }

    pub async fn add_node(&self, node: DiscoveryNode) -> Result<Arc<ClusterState>> {
        self.submit(|reply| ClusterTask::AddNode { node, reply }).await
    }

    /// Node left: its copies are failed and reallocated
    pub async fn remove_node(&self, node_id: impl Into<String>) -> Result<Arc<ClusterState>> {
        let node_id = node_id.into();
        self.submit(|reply| ClusterTask::RemoveNode { node_id, reply })
            .await?
    }

    pub async fn create_index(&self, metadata: IndexMetadata) -> Result<Arc<ClusterState>> {
        self.submit(|reply| ClusterTask::CreateIndex { metadata, reply })
            .await?
    }

    pub async fn delete_index(&self, name: impl Into<String>) -> Result<Arc<ClusterState>> {
        let name = name.into();
        self.submit(|reply| ClusterTask::DeleteIndex { name, reply })
            .await?
    }

    /// Replace the allocation settings and run an allocation round
    pub async fn update_settings(&self, settings: AllocationConfig) -> Result<Arc<ClusterState>> {
        self.submit(|reply| ClusterTask::UpdateSettings { settings, reply })
            .await
    }

    /// Health of the authoritative state, waiting for the request's
    /// conditions up to its timeout
    pub async fn health(&self, request: &HealthRequest) -> ClusterHealth {
        let health =
            health::wait_for_health(self.subscribe(), request, self.default_health_timeout).await;
        metrics::update_health_metrics(&health);
        health
    }
}

/// Owner of the authoritative state
struct ClusterWorker {
    allocation: AllocationService,
    state: Arc<ClusterState>,
    publisher: watch::Sender<Arc<ClusterState>>,
}

impl ClusterWorker {
    async fn run(mut self, mut tasks: mpsc::Receiver<ClusterTask>) {
        while let Some(task) = tasks.recv().await {
            let timer = TaskTimer::new(task.name());
            self.handle(task);
            timer.finish();
        }
        info!("Cluster service stopped at version {}", self.state.version());
    }

    fn handle(&mut self, task: ClusterTask) {
        match task {
            ClusterTask::Reroute {
                commands,
                options,
                reply,
            } => {
                let result = self.allocation.reroute(&self.state, &commands, options);
                if let Ok(result) = &result {
                    if !result.dry_run {
                        self.publish(Arc::clone(&result.state));
                    }
                }
                respond(reply, result);
            }
            ClusterTask::ShardStarted { shards, reply } => {
                let next = self.allocation.apply_started_shards(&self.state, &shards);
                respond(reply, self.publish(next));
            }
            ClusterTask::ShardFailed { shards, reply } => {
                let next = self.allocation.apply_failed_shards(&self.state, &shards);
                respond(reply, self.publish(next));
            }
            ClusterTask::AddNode { node, reply } => {
                info!("Node [{}] joined", node.id);
                let next = Arc::new(self.state.with_node(node));
                let next = self.allocation.reroute_automatic(&next);
                respond(reply, self.publish(next));
            }
            ClusterTask::RemoveNode { node_id, reply } => {
                let result = self
                    .allocation
                    .disassociate_dead_node(&self.state, &node_id)
                    .map(|next| self.publish(next));
                respond(reply, result);
            }
            ClusterTask::CreateIndex { metadata, reply } => {
                let result = self.state.with_index(metadata).map(|next| {
                    let next = self.allocation.reroute_automatic(&Arc::new(next));
                    self.publish(next)
                });
                respond(reply, result);
            }
            ClusterTask::DeleteIndex { name, reply } => {
                let result = self
                    .state
                    .without_index(&name)
                    .map(|next| self.publish(Arc::new(next)));
                respond(reply, result);
            }
            ClusterTask::UpdateSettings { settings, reply } => {
                self.allocation.update_settings(settings);
                let next = self.allocation.reroute_automatic(&self.state);
                respond(reply, self.publish(next));
            }
        }
    }

    /// Make `next` the authoritative state. A no-op when it is the current one.
    fn publish(&mut self, next: Arc<ClusterState>) -> Arc<ClusterState> {
        if Arc::ptr_eq(&next, &self.state) {
            return next;
        }
        debug!(
            "Publishing cluster state version {} ({})",
            next.version(),
            next.state_uuid()
        );
        metrics::update_cluster_state_metrics(&next);
        self.state = Arc::clone(&next);
        self.publisher.send_replace(Arc::clone(&next));
        next
    }
}

fn respond<T>(reply: Reply<T>, value: T) {
    if reply.send(value).is_err() {
        warn!("Cluster task caller went away before the reply");
    }
}
