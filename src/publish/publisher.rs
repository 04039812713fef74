//! Fan-out publication with quorum aggregation.
//!
//! ```text
//!            ┌──────────── spawn per node ────────────┐
//!  publish ──┤ node-1: send (diff | full) + timeout   ├──► mpsc ──► round
//!            │ node-2: send (diff | full) + timeout   │           (acks / failures)
//!            │ ...                                    │
//!            └────────────────────────────────────────┘
//! ```
//!
//! The round returns as soon as the required acks arrive, fails as soon as
//! enough nodes failed that the quorum can no longer be reached, and fails
//! when the publication timeout expires. Slow nodes keep their request
//! running in the background and still record their ack.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::transport::{PublishRequest, PublishResponse, PublishTransport};
use crate::error::{MeridianError, Result};
use crate::observability;
use crate::state::{ClusterState, ClusterStateDiff, DiscoveryNode};
use crate::types::{NodeId, Version};

/// Where a publication round stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Pending,
    Committed,
    Failed,
}

/// Acknowledgements and failures collected for one published version.
#[derive(Debug, Clone)]
pub struct PublicationRound {
    pub version: Version,
    pub required: usize,
    pub total: usize,
    pub acked: BTreeSet<NodeId>,
    pub failed: BTreeSet<NodeId>,
}

impl PublicationRound {
    pub fn new(version: Version, required: usize, total: usize) -> Self {
        Self {
            version,
            required,
            total,
            acked: BTreeSet::new(),
            failed: BTreeSet::new(),
        }
    }

    pub fn on_ack(&mut self, node: NodeId) -> RoundStatus {
        self.failed.remove(&node);
        self.acked.insert(node);
        self.status()
    }

    pub fn on_failure(&mut self, node: NodeId) -> RoundStatus {
        if !self.acked.contains(&node) {
            self.failed.insert(node);
        }
        self.status()
    }

    pub fn status(&self) -> RoundStatus {
        if self.acked.len() >= self.required {
            RoundStatus::Committed
        } else if self.total.saturating_sub(self.failed.len()) < self.required {
            RoundStatus::Failed
        } else {
            RoundStatus::Pending
        }
    }

    fn failure(&self) -> MeridianError {
        MeridianError::PublicationFailed {
            version: self.version,
            acks: self.acked.len(),
            required: self.required,
        }
    }
}

/// A version that reached its quorum.
#[derive(Debug, Clone)]
pub struct Committed {
    pub version: Version,
    pub acked: Vec<NodeId>,
    pub failed: Vec<NodeId>,
}

/// Sends committed states to every node of the cluster.
pub struct Publisher {
    transport: Arc<dyn PublishTransport>,
    diffs_enabled: bool,
    /// Last version each node acknowledged.
    acked_versions: Arc<Mutex<HashMap<NodeId, Version>>>,
}

impl Publisher {
    pub fn new(transport: Arc<dyn PublishTransport>, diffs_enabled: bool) -> Self {
        Self {
            transport,
            diffs_enabled,
            acked_versions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Last version `node` is known to hold.
    pub fn acked_version(&self, node: &str) -> Option<Version> {
        self.acked_versions.lock().get(node).copied()
    }

    /// Publish `state` to every node it lists and wait for `required_acks`.
    pub async fn publish(
        &self,
        state: Arc<ClusterState>,
        previous: &ClusterState,
        required_acks: usize,
        timeout: Duration,
    ) -> Result<Committed> {
        let started = Instant::now();
        let nodes: Vec<DiscoveryNode> = state.nodes.values().cloned().collect();
        let mut round = PublicationRound::new(state.version, required_acks, nodes.len());

        if round.status() == RoundStatus::Failed {
            warn!(
                version = state.version,
                nodes = nodes.len(),
                required = required_acks,
                "Quorum cannot be reached with the current node set"
            );
            observability::record_publication(false, 0, 0.0);
            return Err(round.failure());
        }

        let diff = (self.diffs_enabled && previous.version + 1 == state.version)
            .then(|| Arc::new(ClusterStateDiff::between(previous, &state)));

        let (tx, mut rx) = mpsc::channel(nodes.len().max(1));
        for node in nodes {
            let use_diff = diff.is_some() && self.acked_version(&node.id) == Some(previous.version);
            let send = NodeSend {
                transport: self.transport.clone(),
                acked_versions: self.acked_versions.clone(),
                state: state.clone(),
                diff: if use_diff { diff.clone() } else { None },
                timeout,
                node,
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let node_id = send.node.id.clone();
                let result = send.run().await;
                let _ = tx.send((node_id, result)).await;
            });
        }
        drop(tx);

        let deadline = tokio::time::Instant::now() + timeout;
        let status = loop {
            let received = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(received)) => received,
                Ok(None) => break round.status(),
                Err(_) => {
                    warn!(
                        version = state.version,
                        acks = round.acked.len(),
                        required = required_acks,
                        "Publication timed out"
                    );
                    break RoundStatus::Failed;
                }
            };

            let status = match received {
                (node_id, Ok(_)) => round.on_ack(node_id),
                (node_id, Err(e)) => {
                    debug!(node = %node_id, version = state.version, error = %e, "Node failed to apply state");
                    round.on_failure(node_id)
                }
            };
            if status != RoundStatus::Pending {
                break status;
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if status == RoundStatus::Committed {
            observability::record_publication(true, round.acked.len(), elapsed_ms);
            info!(
                version = state.version,
                acks = round.acked.len(),
                required = required_acks,
                elapsed_ms = elapsed_ms as u64,
                "Cluster state published"
            );
            Ok(Committed {
                version: state.version,
                acked: round.acked.into_iter().collect(),
                failed: round.failed.into_iter().collect(),
            })
        } else {
            observability::record_publication(false, round.acked.len(), elapsed_ms);
            warn!(
                version = state.version,
                acks = round.acked.len(),
                failed = round.failed.len(),
                required = required_acks,
                "Cluster state publication failed"
            );
            Err(round.failure())
        }
    }
}

/// One node's share of a publication.
struct NodeSend {
    transport: Arc<dyn PublishTransport>,
    acked_versions: Arc<Mutex<HashMap<NodeId, Version>>>,
    node: DiscoveryNode,
    state: Arc<ClusterState>,
    diff: Option<Arc<ClusterStateDiff>>,
    timeout: Duration,
}

impl NodeSend {
    async fn run(self) -> Result<PublishResponse> {
        let result = tokio::time::timeout(self.timeout, self.send())
            .await
            .unwrap_or_else(|_| Err(MeridianError::Timeout(self.timeout.as_millis() as u64)));

        let mut acked = self.acked_versions.lock();
        match &result {
            Ok(response) => {
                let entry = acked.entry(self.node.id.clone()).or_insert(0);
                *entry = (*entry).max(response.version);
            }
            Err(_) => {
                acked.remove(&self.node.id);
            }
        }
        result
    }

    async fn send(&self) -> Result<PublishResponse> {
        if let Some(diff) = &self.diff {
            match self
                .transport
                .send_state(&self.node, PublishRequest::Diff((**diff).clone()))
                .await
            {
                Err(MeridianError::IncompatibleClusterStateVersion { local, base }) => {
                    debug!(
                        node = %self.node.id,
                        local,
                        base,
                        "Diff rejected, resending full state"
                    );
                }
                other => return other,
            }
        }
        self.transport
            .send_state(&self.node, PublishRequest::Full((*self.state).clone()))
            .await
    }
}
