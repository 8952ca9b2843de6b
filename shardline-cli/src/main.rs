use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shardline::{AllocationCommand, ClusterHealthStatus, NodeCountCondition, ShardId, ShardlineConfig};
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod store;

use store::Session;

#[derive(Parser, Debug)]
#[command(name = "shardline")]
#[command(about = "Shardline CLI - shard allocation, rerouting and cluster health")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, env = "SHARDLINE_CONFIG", default_value = "shardline.toml")]
    config: PathBuf,

    /// Cluster state file (JSON)
    #[arg(long, env = "SHARDLINE_STATE", default_value = "cluster-state.json")]
    state: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an empty cluster state file
    Init {
        /// Cluster name, defaults to the configured one
        #[arg(long)]
        name: Option<String>,

        /// Overwrite an existing state file
        #[arg(long)]
        force: bool,
    },

    #[command(flatten)]
    Cluster(ClusterCommand),
}

/// Subcommands that run against a loaded cluster state
#[derive(Subcommand, Debug)]
enum ClusterCommand {
    /// Register a node
    AddNode {
        node_id: String,

        /// Human-readable node name
        #[arg(long)]
        name: Option<String>,

        /// Transport address
        #[arg(long)]
        address: Option<String>,
    },

    /// Remove a node, failing every copy it holds
    RemoveNode { node_id: String },

    /// Create an index with unassigned copies
    CreateIndex {
        name: String,

        #[arg(long, default_value = "1")]
        shards: u32,

        #[arg(long, default_value = "1")]
        replicas: u32,
    },

    /// Delete an index and its routing
    DeleteIndex { name: String },

    /// Apply allocation commands
    ///
    /// Commands are written `allocate:INDEX:SHARD:NODE[:allow_primary]`,
    /// `move:INDEX:SHARD:FROM:TO` or `cancel:INDEX:SHARD:NODE`.
    Reroute {
        #[arg(short, long = "command")]
        commands: Vec<AllocationCommand>,

        /// Compute the result without committing it
        #[arg(long)]
        dry_run: bool,

        /// Include per-command decisions in the output
        #[arg(long)]
        explain: bool,
    },

    /// Confirm recoveries (all initializing copies when no --shard is given)
    Started {
        /// Copy as INDEX:SHARD:NODE
        #[arg(long = "shard", value_parser = parse_shard_copy)]
        shards: Vec<(ShardId, String)>,
    },

    /// Report a failed copy
    Failed {
        /// Copy as INDEX:SHARD:NODE
        #[arg(value_parser = parse_shard_copy)]
        shard: (ShardId, String),

        #[arg(long, default_value = "reported by operator")]
        reason: String,
    },

    /// Apply the allocation settings from the config file
    Settings,

    /// Show cluster health, optionally waiting for conditions
    Health {
        /// Restrict to these indices
        #[arg(short, long = "index")]
        indices: Vec<String>,

        #[arg(long)]
        wait_for_status: Option<ClusterHealthStatus>,

        #[arg(long)]
        wait_for_relocating_shards: Option<usize>,

        /// Node count condition such as `3`, `>=2` or `<5`
        #[arg(long)]
        wait_for_nodes: Option<NodeCountCondition>,

        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Print the cluster state
    State {
        /// Print the full JSON snapshot
        #[arg(long)]
        json: bool,
    },
}

fn parse_shard_copy(s: &str) -> std::result::Result<(ShardId, String), String> {
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        [index, shard, node] if !index.is_empty() && !node.is_empty() => {
            let shard = shard
                .parse::<u32>()
                .map_err(|_| format!("invalid shard number '{}'", shard))?;
            Ok((ShardId::new(*index, shard), node.to_string()))
        }
        _ => Err(format!("expected INDEX:SHARD:NODE, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,shardline=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = ShardlineConfig::load_or_default(&cli.config)
        .with_context(|| format!("Failed to load config {}", cli.config.display()))?;

    match cli.command {
        Commands::Init { name, force } => {
            let name = name.as_deref().unwrap_or(&config.cluster_name);
            commands::run_init(&cli.state, name, force)
        }
        Commands::Cluster(command) => run_session(&config, &cli.state, command).await,
    }
}

async fn run_session(config: &ShardlineConfig, state_path: &Path, command: ClusterCommand) -> Result<()> {
    let session = Session::open(config, state_path)?;

    match command {
        ClusterCommand::AddNode {
            node_id,
            name,
            address,
        } => commands::run_add_node(&session, &node_id, name, address).await?,
        ClusterCommand::RemoveNode { node_id } => commands::run_remove_node(&session, &node_id).await?,
        ClusterCommand::CreateIndex {
            name,
            shards,
            replicas,
        } => commands::run_create_index(&session, &name, shards, replicas).await?,
        ClusterCommand::DeleteIndex { name } => commands::run_delete_index(&session, &name).await?,
        ClusterCommand::Reroute {
            commands: reroute,
            dry_run,
            explain,
        } => commands::run_reroute(&session, reroute, dry_run, explain).await?,
        ClusterCommand::Started { shards } => commands::run_started(&session, shards).await?,
        ClusterCommand::Failed {
            shard: (shard_id, node),
            reason,
        } => commands::run_failed(&session, shard_id, &node, &reason).await?,
        ClusterCommand::Settings => commands::run_settings(&session, config).await?,
        ClusterCommand::Health {
            indices,
            wait_for_status,
            wait_for_relocating_shards,
            wait_for_nodes,
            timeout_ms,
        } => {
            commands::run_health(
                &session,
                indices,
                wait_for_status,
                wait_for_relocating_shards,
                wait_for_nodes,
                timeout_ms,
            )
            .await?
        }
        ClusterCommand::State { json } => commands::run_state(&session, json)?,
    }

    session.persist()
}
