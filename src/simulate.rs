//! Scripted run of an in-process cluster.
//!
//! Bootstraps a cluster, creates an index, writes documents to every active
//! copy, then removes a node so that its copies are reallocated and recovered
//! from the surviving primaries.

use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use crate::actions::CreateIndexRequest;
use crate::config::MeridianConfig;
use crate::error::Result;
use crate::node::LocalCluster;
use crate::state::{DiscoveryNode, ShardRoutingState};
use crate::types::{ShardId, SystemClock};

/// Shape of a simulation.
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub nodes: usize,
    pub index: String,
    pub shards: u32,
    pub replicas: u32,
    pub documents: usize,
    /// Remove the last node once the cluster is green.
    pub fail_node: bool,
    pub timeout: Duration,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            nodes: 3,
            index: "logs".to_string(),
            shards: 2,
            replicas: 1,
            documents: 100,
            fail_node: true,
            timeout: Duration::from_secs(30),
        }
    }
}

/// What the cluster looked like at the end.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub version: u64,
    pub nodes: usize,
    pub started_copies: usize,
    pub unassigned_copies: usize,
    pub mapping_fields: Vec<String>,
    pub removed_node: Option<String>,
    pub took_ms: u64,
}

pub async fn run_simulation(mut config: MeridianConfig, options: SimulationOptions) -> Result<SimulationReport> {
    let started = Instant::now();
    config.node.id = "node-1".to_string();
    config.node.name = "node-1".to_string();
    let mut cluster = LocalCluster::bootstrap(config, Arc::new(SystemClock))?;

    for i in 2..=options.nodes.max(1) {
        let id = format!("node-{}", i);
        cluster
            .join(DiscoveryNode::new(id.clone(), format!("127.0.0.1:{}", 9300 + i)))
            .await?;
    }
    info!(nodes = cluster.nodes().count(), "All nodes joined");

    let mut request = CreateIndexRequest::new(options.index.clone(), options.shards, options.replicas);
    request.mapping.insert("message".to_string(), "text".to_string());
    cluster.create_index(request).await?;
    cluster.wait_for_green(options.timeout).await?;

    write_documents(&cluster, &options);

    let removed_node = if options.fail_node && options.nodes > 1 {
        let id = format!("node-{}", options.nodes);
        cluster.remove(&id).await?;
        cluster
            .wait_for(options.timeout, |state| {
                state.routing_table.all_shards().all(|c| {
                    c.state == ShardRoutingState::Started || c.state == ShardRoutingState::Unassigned
                }) && !state.nodes.contains_key(&id)
            })
            .await?;
        Some(id)
    } else {
        None
    };

    let state = cluster.state();
    let report = SimulationReport {
        version: state.version,
        nodes: state.nodes.len(),
        started_copies: state
            .routing_table
            .all_shards()
            .filter(|c| c.state == ShardRoutingState::Started)
            .count(),
        unassigned_copies: state
            .routing_table
            .all_shards()
            .filter(|c| c.state == ShardRoutingState::Unassigned)
            .count(),
        mapping_fields: state
            .index(&options.index)
            .map(|m| m.mapping.fields.keys().cloned().collect())
            .unwrap_or_default(),
        removed_node,
        took_ms: started.elapsed().as_millis() as u64,
    };
    cluster.shutdown().await;
    Ok(report)
}

/// Index documents into every started copy, with a new field now and then
/// so that later recoveries need a mapping update.
fn write_documents(cluster: &LocalCluster, options: &SimulationOptions) {
    let state = cluster.state();
    let mut rng = rand::thread_rng();

    for doc in 0..options.documents {
        let shard = ShardId::new(options.index.clone(), doc as u32 % options.shards.max(1));
        let mut fields = BTreeMap::new();
        fields.insert("message".to_string(), "text".to_string());
        if doc % 10 == 0 {
            fields.insert(format!("tag_{}", doc / 10), "keyword".to_string());
        }

        let segment: Option<Vec<u8>> = (doc % 25 == 0).then(|| (0..1024).map(|_| rng.gen()).collect());
        let holders = state
            .routing_table
            .copies(&shard)
            .into_iter()
            .flatten()
            .filter(|c| c.state == ShardRoutingState::Started)
            .filter_map(|c| c.node_id.as_deref());
        for node_id in holders {
            if let Some(node) = cluster.node(node_id) {
                node.shards()
                    .index_document(&shard, format!("doc-{}", doc), fields.clone());
                if let Some(segment) = &segment {
                    node.shards()
                        .put_file(&shard, format!("_{}.seg", doc / 25), segment.clone());
                }
            }
        }
    }
    info!(documents = options.documents, "Documents written");
}
