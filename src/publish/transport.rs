//! Publication transport seam and its in-memory implementation.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::applier::ClusterStateApplier;
use crate::error::{MeridianError, Result};
use crate::state::{ClusterState, ClusterStateDiff, DiscoveryNode};
use crate::types::{NodeId, Version, WireMessage};

/// What the master sends to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PublishRequest {
    Full(ClusterState),
    Diff(ClusterStateDiff),
}

impl PublishRequest {
    pub fn version(&self) -> Version {
        match self {
            PublishRequest::Full(state) => state.version,
            PublishRequest::Diff(diff) => diff.to_version,
        }
    }

    pub fn is_diff(&self) -> bool {
        matches!(self, PublishRequest::Diff(_))
    }
}

impl WireMessage for PublishRequest {}

/// Acknowledgement of an applied state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResponse {
    pub node_id: NodeId,
    pub version: Version,
}

impl WireMessage for PublishResponse {}

/// Delivers publication requests to nodes.
#[async_trait]
pub trait PublishTransport: Send + Sync {
    async fn send_state(&self, node: &DiscoveryNode, request: PublishRequest) -> Result<PublishResponse>;
}

/// Per-node delivery counters, for tests and the simulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub full: u64,
    pub diffs: u64,
    pub rejected: u64,
}

struct Endpoint {
    applier: Arc<ClusterStateApplier>,
    disconnected: bool,
    delay: Option<Duration>,
    stats: DeliveryStats,
}

/// Transport delivering to appliers in the same process.
///
/// Every request and response goes through its wire encoding. Nodes can be
/// disconnected or slowed down to simulate failures.
#[derive(Default)]
pub struct InMemoryTransport {
    endpoints: RwLock<HashMap<NodeId, Endpoint>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: impl Into<NodeId>, applier: Arc<ClusterStateApplier>) {
        self.endpoints.write().insert(
            node_id.into(),
            Endpoint {
                applier,
                disconnected: false,
                delay: None,
                stats: DeliveryStats::default(),
            },
        );
    }

    pub fn disconnect(&self, node_id: &str) {
        if let Some(endpoint) = self.endpoints.write().get_mut(node_id) {
            endpoint.disconnected = true;
        }
    }

    pub fn reconnect(&self, node_id: &str) {
        if let Some(endpoint) = self.endpoints.write().get_mut(node_id) {
            endpoint.disconnected = false;
        }
    }

    /// Delay every delivery to `node_id`.
    pub fn set_delay(&self, node_id: &str, delay: Option<Duration>) {
        if let Some(endpoint) = self.endpoints.write().get_mut(node_id) {
            endpoint.delay = delay;
        }
    }

    pub fn stats(&self, node_id: &str) -> DeliveryStats {
        self.endpoints
            .read()
            .get(node_id)
            .map(|e| e.stats)
            .unwrap_or_default()
    }

    fn record(&self, node_id: &str, update: impl FnOnce(&mut DeliveryStats)) {
        if let Some(endpoint) = self.endpoints.write().get_mut(node_id) {
            update(&mut endpoint.stats);
        }
    }
}

#[async_trait]
impl PublishTransport for InMemoryTransport {
    async fn send_state(&self, node: &DiscoveryNode, request: PublishRequest) -> Result<PublishResponse> {
        let (applier, delay) = {
            let endpoints = self.endpoints.read();
            let endpoint = endpoints
                .get(&node.id)
                .ok_or_else(|| MeridianError::ConnectionFailed(format!("unknown node {}", node.id)))?;
            if endpoint.disconnected {
                return Err(MeridianError::NodeDisconnected(node.id.clone()));
            }
            (endpoint.applier.clone(), endpoint.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let bytes = request.encode()?;
        let request = PublishRequest::decode(&bytes)?;
        let is_diff = request.is_diff();

        match applier.apply(request) {
            Ok(response) => {
                self.record(&node.id, |s| {
                    if is_diff {
                        s.diffs += 1
                    } else {
                        s.full += 1
                    }
                });
                PublishResponse::decode(&response.encode()?)
            }
            Err(e) => {
                self.record(&node.id, |s| s.rejected += 1);
                Err(e)
            }
        }
    }
}
