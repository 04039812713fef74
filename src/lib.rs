//! Meridian - cluster-state coordination and shard recovery.
//!
//! Meridian keeps one authoritative, versioned cluster state per cluster. The
//! elected master batches state-update tasks, applies them as pure
//! transforms, commits the result and publishes it to every node. Nodes react
//! to routing changes in the states they apply by recovering the shard copies
//! assigned to them.
//!
//! # Features
//!
//! - **Task batching**: tasks sharing a topic run as one batch; one failing
//!   task never blocks its siblings.
//! - **Versioned commits**: every committed state is exactly one version
//!   newer than the last; a lost race fails with `StaleVersion`.
//! - **Quorum publication**: full states or diffs fanned out to every node,
//!   committed once enough nodes acknowledge.
//! - **Shard recovery**: file copy, translog replay and finalize, with
//!   per-phase retries, cancellation and mapping updates.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  submit(task) ──► TaskQueue ──► ClusterStateTaskExecutor    │
//! │                                         │                   │
//! │                         ClusterStateStore::commit           │
//! │                                         │                   │
//! │        Publisher ──► PublishTransport ──► ClusterStateApplier│
//! │                                         │                   │
//! │          RecoveryCoordinator ◄── routing changes            │
//! │                 │                                           │
//! │   shard-started / shard-failed ──► back to the master       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use meridian::config::MeridianConfig;
//!
//! #[tokio::main]
//! async fn main() -> meridian::Result<()> {
//!     let config = MeridianConfig::development();
//!     meridian::run(config).await
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod actions;
pub mod master;
pub mod node;
pub mod publish;
pub mod recovery;
pub mod resilience;
pub mod shutdown;
pub mod simulate;
pub mod state;

pub mod cli;
pub mod observability;

// Re-exports
pub use error::{MeridianError, Result};
pub use types::*;

use config::MeridianConfig;
use node::LocalCluster;
use shutdown::SignalHandler;
use std::sync::Arc;
use tracing::{error, info};

/// Run a single Meridian node, elected master of its own cluster, until a
/// shutdown signal arrives.
pub async fn run(config: MeridianConfig) -> Result<()> {
    observability::init(&config.observability)?;
    info!(
        node = %config.node.id,
        cluster = %config.node.cluster_name,
        "Starting Meridian node"
    );

    let cluster = LocalCluster::bootstrap(config.clone(), Arc::new(SystemClock))?;
    let coordinator = cluster.shutdown_coordinator().clone();

    let metrics = if config.observability.metrics_enabled {
        info!("Starting metrics server on {}", config.observability.metrics_addr);
        let obs_config = config.observability.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = observability::run_metrics_server(obs_config).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let signal_coordinator = coordinator.clone();
    tokio::spawn(async move {
        if let Err(e) = SignalHandler::new(signal_coordinator).run().await {
            error!("Signal handler error: {}", e);
        }
    });

    coordinator.wait_for_shutdown().await;
    info!("Shutting down Meridian gracefully...");

    cluster.shutdown().await;
    if let Some(handle) = metrics {
        handle.abort();
    }

    info!("Meridian shutdown complete");
    Ok(())
}
