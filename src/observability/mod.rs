//! Observability module for Meridian.
//!
//! Provides logging and metrics for the master service, publication and
//! shard recovery.

use crate::config::ObservabilityConfig;
use crate::error::{MeridianError, Result};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::net::TcpListener;
use ::tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize logging.
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| MeridianError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| MeridianError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Run the Prometheus metrics server.
pub async fn run_metrics_server(config: ObservabilityConfig) -> Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MeridianError::Internal(format!("Failed to install metrics recorder: {}", e)))?;

    register_metrics();

    let app = axum::Router::new()
        .route("/metrics", axum::routing::get(move || async move {
            handle.render()
        }))
        .route("/health", axum::routing::get(|| async { "OK" }));

    let listener = TcpListener::bind(config.metrics_addr).await?;
    info!(addr = %config.metrics_addr, "Metrics server listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| MeridianError::ConnectionFailed(e.to_string()))?;

    Ok(())
}

fn register_metrics() {
    // Cluster state
    gauge!("meridian_cluster_state_version").set(0.0);
    gauge!("meridian_cluster_nodes_total").set(0.0);
    gauge!("meridian_cluster_indices_total").set(0.0);
    gauge!("meridian_cluster_shards_total").set(0.0);

    // Master service
    counter!("meridian_tasks_submitted_total").absolute(0);
    counter!("meridian_batches_total").absolute(0);
    counter!("meridian_listener_panics_total").absolute(0);

    // Publication
    counter!("meridian_publications_total").absolute(0);
    counter!("meridian_publication_failures_total").absolute(0);

    // Recovery
    gauge!("meridian_recoveries_active").set(0.0);
    counter!("meridian_recovery_retries_total").absolute(0);
}

/// Record the version of the state a store just applied.
pub fn record_state_version(version: u64) {
    gauge!("meridian_cluster_state_version").set(version as f64);
}

/// Record a task submission.
pub fn record_task_submitted(priority: &str) {
    counter!("meridian_tasks_submitted_total", "priority" => priority.to_string()).increment(1);
}

/// Record the terminal outcome of a task.
pub fn record_task_outcome(outcome: &'static str) {
    counter!("meridian_task_outcomes_total", "outcome" => outcome).increment(1);
}

/// Record an executed batch.
pub fn record_batch(size: usize, elapsed_ms: f64, changed: bool) {
    counter!("meridian_batches_total", "changed" => changed.to_string()).increment(1);
    histogram!("meridian_batch_size").record(size as f64);
    histogram!("meridian_batch_execution_ms").record(elapsed_ms);
}

/// Record a publication round.
pub fn record_publication(success: bool, acks: usize, elapsed_ms: f64) {
    counter!("meridian_publications_total").increment(1);
    if !success {
        counter!("meridian_publication_failures_total").increment(1);
    }
    histogram!("meridian_publication_acks").record(acks as f64);
    histogram!("meridian_publication_ms").record(elapsed_ms);
}

/// Record a listener that panicked while being notified.
pub fn record_listener_panic() {
    counter!("meridian_listener_panics_total").increment(1);
}

/// Record a finished recovery session.
pub fn record_recovery(outcome: &'static str, elapsed_ms: u64) {
    counter!("meridian_recoveries_total", "outcome" => outcome).increment(1);
    histogram!("meridian_recovery_ms").record(elapsed_ms as f64);
}

/// Record a failed phase attempt that will be retried.
pub fn record_recovery_retry(phase: &str) {
    counter!("meridian_recovery_retries_total", "phase" => phase.to_string()).increment(1);
}

/// Update the number of running recovery sessions.
pub fn update_active_recoveries(active: usize) {
    gauge!("meridian_recoveries_active").set(active as f64);
}

/// Update cluster shape metrics.
pub fn update_cluster_metrics(nodes: usize, indices: usize, shards: usize) {
    gauge!("meridian_cluster_nodes_total").set(nodes as f64);
    gauge!("meridian_cluster_indices_total").set(indices as f64);
    gauge!("meridian_cluster_shards_total").set(shards as f64);
}
