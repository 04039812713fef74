//! Mapping updates and the seam recovery uses to confirm them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::{MeridianError, Result};
use crate::master::{MasterService, Task, TaskContext, TaskOutcome};
use crate::state::{ClusterState, ClusterStateStore};
use crate::types::{Priority, ShardId, WireMessage};

/// Fields to add to an index mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingUpdate {
    pub index: String,
    pub fields: BTreeMap<String, String>,
}

impl WireMessage for MappingUpdate {}

impl MappingUpdate {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Merge `fields` into the mapping of `index`.
pub fn put_mapping(state: &ClusterState, index: &str, fields: &BTreeMap<String, String>) -> Result<ClusterState> {
    let mut next = state.clone();
    let meta = next.metadata.index_mut(index)?;
    if !meta.mapping.merge(fields)? {
        return Ok(state.clone());
    }
    Ok(next)
}

pub fn put_mapping_task(update: MappingUpdate) -> Task {
    Task::new(
        format!("put-mapping [{}]", update.index),
        Priority::High,
        move |state: &ClusterState, _: &TaskContext| put_mapping(state, &update.index, &update.fields),
    )
}

/// Applies mapping updates found during recovery and checks that they became
/// visible.
#[async_trait]
pub trait MappingUpdatePerformer: Send + Sync {
    /// Ask the master to merge the update.
    async fn update_mappings(&self, update: &MappingUpdate, shard: &ShardId) -> Result<()>;

    /// Succeeds once the local cluster state carries the update, otherwise
    /// fails with `RetryOnPrimary`.
    async fn verify_mappings(&self, update: &MappingUpdate, shard: &ShardId) -> Result<()>;
}

/// Submits `put-mapping` tasks to the master and verifies against the state
/// applied on this node.
pub struct MasterMappingUpdater {
    master: Arc<MasterService>,
    local_store: Arc<ClusterStateStore>,
}

impl MasterMappingUpdater {
    pub fn new(master: Arc<MasterService>, local_store: Arc<ClusterStateStore>) -> Self {
        Self {
            master,
            local_store,
        }
    }
}

#[async_trait]
impl MappingUpdatePerformer for MasterMappingUpdater {
    async fn update_mappings(&self, update: &MappingUpdate, shard: &ShardId) -> Result<()> {
        debug!(shard = %shard, fields = update.fields.len(), "Requesting mapping update");
        let outcome = self
            .master
            .submit_task("put-mapping", put_mapping_task(update.clone()))
            .outcome()
            .await;
        match outcome {
            TaskOutcome::Processed { .. } => Ok(()),
            TaskOutcome::Failed { error, .. } => Err(error),
            TaskOutcome::NoLongerMaster { .. } => Err(MeridianError::RetryOnPrimary(format!(
                "no master to apply mapping update for {}",
                shard
            ))),
        }
    }

    async fn verify_mappings(&self, update: &MappingUpdate, shard: &ShardId) -> Result<()> {
        let state = self.local_store.current();
        let meta = state
            .index(&update.index)
            .ok_or_else(|| MeridianError::IndexNotFound(update.index.clone()))?;
        if meta.mapping.contains_all(&update.fields) {
            Ok(())
        } else {
            Err(MeridianError::RetryOnPrimary(format!(
                "mapping update for {} not yet applied at version {}",
                shard, state.version
            )))
        }
    }
}
