//! Receiving side of a publication.

use std::sync::Arc;
use tracing::{debug, info};

use super::transport::{PublishRequest, PublishResponse};
use crate::error::{MeridianError, Result};
use crate::state::{ClusterState, ClusterStateStore};
use crate::types::NodeId;

/// Applies published states to the local store and acknowledges them.
pub struct ClusterStateApplier {
    node_id: NodeId,
    store: Arc<ClusterStateStore>,
}

impl ClusterStateApplier {
    pub fn new(node_id: impl Into<NodeId>, store: Arc<ClusterStateStore>) -> Self {
        Self {
            node_id: node_id.into(),
            store,
        }
    }

    pub fn store(&self) -> &Arc<ClusterStateStore> {
        &self.store
    }

    /// Apply a full state or a diff.
    ///
    /// A state equal to the one already applied is acknowledged again; older
    /// states are rejected. A diff that does not fit the local state is
    /// rejected with `IncompatibleClusterStateVersion`.
    pub fn apply(&self, request: PublishRequest) -> Result<PublishResponse> {
        let local = self.store.current();
        let incoming_version = request.version();

        if incoming_version == local.version {
            debug!(node = %self.node_id, version = incoming_version, "State already applied");
            return Ok(self.ack(incoming_version));
        }
        if incoming_version < local.version {
            return Err(MeridianError::StaleVersion {
                current: local.version,
                candidate: incoming_version,
            });
        }

        let state: ClusterState = match request {
            PublishRequest::Full(state) => state,
            PublishRequest::Diff(diff) => diff.apply(&local)?,
        };

        let installed = self.store.install(Arc::new(state))?;
        info!(
            node = %self.node_id,
            version = installed.version,
            master = ?installed.master_node,
            "Applied cluster state"
        );
        Ok(self.ack(installed.version))
    }

    fn ack(&self, version: u64) -> PublishResponse {
        PublishResponse {
            node_id: self.node_id.clone(),
            version,
        }
    }
}
