//! Shard lifecycle actions: started, failed, node join/leave, relocation.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{MeridianError, Result};
use crate::master::{MasterService, Task, TaskContext, TaskOutcome};
use crate::recovery::ShardStateReporter;
use crate::state::{
    ClusterState, DiscoveryNode, ShardRouting, ShardRoutingState, UnassignedInfo, UnassignedReason,
};
use crate::types::{NodeId, Priority, ShardId};

fn stale_report(shard: &ShardId, allocation_id: u64) -> MeridianError {
    MeridianError::InvalidState(format!(
        "{} has no copy with allocation id {}",
        shard, allocation_id
    ))
}

/// Mark an initializing copy as started. A relocation target replaces its
/// source copy.
pub fn start_shard(state: &ClusterState, shard: &ShardId, allocation_id: u64) -> Result<ClusterState> {
    let mut next = state.clone();
    let copies = next
        .routing_table
        .copies_mut(shard)
        .ok_or_else(|| MeridianError::ShardNotFound(shard.to_string()))?;
    let pos = copies
        .iter()
        .position(|c| c.allocation_id == Some(allocation_id))
        .ok_or_else(|| stale_report(shard, allocation_id))?;

    match copies[pos].state {
        ShardRoutingState::Initializing => {}
        ShardRoutingState::Started => return Ok(state.clone()),
        other => {
            return Err(MeridianError::InvalidState(format!(
                "cannot start copy {} of {} in state {}",
                allocation_id, shard, other
            )))
        }
    }

    let relocation_source = copies[pos].relocating_node_id.take();
    copies[pos].state = ShardRoutingState::Started;
    copies[pos].unassigned_info = None;
    let target_node = copies[pos].node_id.clone();

    if let Some(source) = relocation_source {
        copies.retain(|c| {
            !(c.state == ShardRoutingState::Relocating
                && c.node_id.as_deref() == Some(source.as_str())
                && c.relocating_node_id == target_node)
        });
    }
    Ok(next)
}

/// Fail a copy.
///
/// A failed relocation target restores its source. Any other copy becomes
/// unassigned with its failure recorded; a failed primary hands over to a
/// started replica when there is one.
pub fn fail_shard(
    state: &ClusterState,
    shard: &ShardId,
    allocation_id: u64,
    reason: &str,
    now_millis: u64,
) -> Result<ClusterState> {
    let mut next = state.clone();
    fail_copy(&mut next, shard, allocation_id, reason, now_millis, true)?;
    Ok(next)
}

fn fail_copy(
    state: &mut ClusterState,
    shard: &ShardId,
    allocation_id: u64,
    reason: &str,
    now_millis: u64,
    count_failure: bool,
) -> Result<()> {
    let copies = state
        .routing_table
        .copies_mut(shard)
        .ok_or_else(|| MeridianError::ShardNotFound(shard.to_string()))?;
    let failed = copies
        .iter()
        .find(|c| c.allocation_id == Some(allocation_id))
        .cloned()
        .ok_or_else(|| stale_report(shard, allocation_id))?;

    if failed.is_relocation_target() {
        copies.retain(|c| c.allocation_id != Some(allocation_id));
        if let Some(source) = copies.iter_mut().find(|c| {
            c.state == ShardRoutingState::Relocating && c.node_id == failed.relocating_node_id
        }) {
            source.state = ShardRoutingState::Started;
            source.relocating_node_id = None;
        }
        return Ok(());
    }

    if failed.state == ShardRoutingState::Relocating {
        let target = failed.relocating_node_id.clone();
        copies.retain(|c| !(c.is_relocation_target() && c.node_id == target));
    }

    let failed_attempts = failed.failed_attempts() + u32::from(count_failure);
    let kind = if failed.recovers_from_empty_store() {
        UnassignedReason::IndexCreated
    } else if count_failure {
        UnassignedReason::AllocationFailed
    } else {
        UnassignedReason::NodeLeft
    };
    let mut replacement = ShardRouting::unassigned(
        shard.clone(),
        failed.primary,
        UnassignedInfo {
            reason: kind,
            message: reason.to_string(),
            failed_attempts,
            last_failed_node: failed.node_id.clone(),
            at_millis: now_millis,
        },
    );

    if failed.primary {
        // Replicas recovering from this primary cannot finish.
        for copy in copies
            .iter_mut()
            .filter(|c| !c.primary && c.state == ShardRoutingState::Initializing && !c.is_relocation_target())
        {
            let info = UnassignedInfo {
                reason: UnassignedReason::PrimaryFailed,
                message: format!("primary failed: {}", reason),
                failed_attempts: copy.failed_attempts(),
                last_failed_node: copy.node_id.clone(),
                at_millis: now_millis,
            };
            *copy = ShardRouting::unassigned(shard.clone(), false, info);
        }

        if let Some(replica) = copies
            .iter_mut()
            .find(|c| !c.primary && c.state == ShardRoutingState::Started)
        {
            debug!(shard = %shard, node = ?replica.node_id, "Promoting replica to primary");
            replica.primary = true;
            replacement.primary = false;
        }
    }

    if let Some(slot) = copies
        .iter_mut()
        .find(|c| c.allocation_id == Some(allocation_id))
    {
        *slot = replacement;
    }
    Ok(())
}

/// Add a node to the cluster.
pub fn add_node(state: &ClusterState, node: &DiscoveryNode) -> Result<ClusterState> {
    if state.nodes.get(&node.id) == Some(node) {
        return Ok(state.clone());
    }
    let mut next = state.clone();
    next.nodes.insert(node.id.clone(), node.clone());
    Ok(next)
}

/// Remove a node and fail every copy it held.
pub fn remove_node(state: &ClusterState, node_id: &str, now_millis: u64) -> Result<ClusterState> {
    if !state.nodes.contains_key(node_id) {
        return Err(MeridianError::NodeNotFound(node_id.to_string()));
    }
    let mut next = state.clone();
    next.nodes.remove(node_id);
    if next.master_node.as_deref() == Some(node_id) {
        next.master_node = None;
    }

    let affected: Vec<(ShardId, u64)> = next
        .routing_table
        .all_shards()
        .filter(|c| c.node_id.as_deref() == Some(node_id))
        .filter_map(|c| c.allocation_id.map(|id| (c.shard_id.clone(), id)))
        .collect();
    for (shard, allocation_id) in affected {
        // Failing a relocation endpoint may already have removed this copy.
        if next.routing_table.find(&shard, allocation_id).is_some() {
            fail_copy(
                &mut next,
                &shard,
                allocation_id,
                &format!("node [{}] left", node_id),
                now_millis,
                false,
            )?;
        }
    }
    Ok(next)
}

/// Start relocating the started copy of `shard` on `from` to `to`.
pub fn move_shard(state: &ClusterState, shard: &ShardId, from: &str, to: &str) -> Result<ClusterState> {
    let target = state
        .node(to)
        .ok_or_else(|| MeridianError::NodeNotFound(to.to_string()))?;
    if !target.is_data() {
        return Err(MeridianError::Validation(format!("node [{}] is not a data node", to)));
    }
    let copies = state
        .routing_table
        .copies(shard)
        .ok_or_else(|| MeridianError::ShardNotFound(shard.to_string()))?;
    let source = copies
        .iter()
        .find(|c| c.node_id.as_deref() == Some(from))
        .ok_or_else(|| MeridianError::InvalidState(format!("{} has no copy on [{}]", shard, from)))?;
    if source.state != ShardRoutingState::Started {
        return Err(MeridianError::InvalidState(format!(
            "copy of {} on [{}] is {}, only started copies can move",
            shard, from, source.state
        )));
    }
    if copies.iter().any(|c| c.node_id.as_deref() == Some(to)) {
        return Err(MeridianError::Validation(format!(
            "node [{}] already holds a copy of {}",
            to, shard
        )));
    }
    let primary = source.primary;

    let mut next = state.clone();
    let allocation_id = next.routing_table.allocate_id();
    let copies = next
        .routing_table
        .copies_mut(shard)
        .ok_or_else(|| MeridianError::ShardNotFound(shard.to_string()))?;
    for copy in copies.iter_mut() {
        if copy.node_id.as_deref() == Some(from) {
            copy.state = ShardRoutingState::Relocating;
            copy.relocating_node_id = Some(to.to_string());
        }
    }
    copies.push(ShardRouting {
        shard_id: shard.clone(),
        primary,
        state: ShardRoutingState::Initializing,
        node_id: Some(to.to_string()),
        relocating_node_id: Some(from.to_string()),
        allocation_id: Some(allocation_id),
        unassigned_info: None,
    });
    Ok(next)
}

pub fn shard_started_task(shard: ShardId, allocation_id: u64, message: impl Into<String>) -> Task {
    let message = message.into();
    Task::new(
        format!("shard-started {} [{}]", shard, message),
        Priority::Urgent,
        move |state: &ClusterState, _: &TaskContext| start_shard(state, &shard, allocation_id),
    )
    .with_reroute()
}

pub fn shard_failed_task(shard: ShardId, allocation_id: u64, reason: impl Into<String>) -> Task {
    let reason = reason.into();
    Task::new(
        format!("shard-failed {} [{}]", shard, reason),
        Priority::High,
        move |state: &ClusterState, ctx: &TaskContext| {
            fail_shard(state, &shard, allocation_id, &reason, ctx.now_millis())
        },
    )
    .with_reroute()
}

pub fn node_join_task(node: DiscoveryNode) -> Task {
    Task::new(
        format!("node-join [{}]", node.id),
        Priority::Urgent,
        move |state: &ClusterState, _: &TaskContext| add_node(state, &node),
    )
    .with_reroute()
}

pub fn node_left_task(node_id: impl Into<NodeId>) -> Task {
    let node_id = node_id.into();
    Task::new(
        format!("node-left [{}]", node_id),
        Priority::Immediate,
        move |state: &ClusterState, ctx: &TaskContext| remove_node(state, &node_id, ctx.now_millis()),
    )
    .with_reroute()
}

pub fn move_shard_task(shard: ShardId, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Task {
    let from = from.into();
    let to = to.into();
    Task::new(
        format!("move-shard {} [{}] -> [{}]", shard, from, to),
        Priority::Urgent,
        move |state: &ClusterState, _: &TaskContext| move_shard(state, &shard, &from, &to),
    )
}

/// Reports recovery results as tasks on the master.
pub struct MasterShardStateReporter {
    master: Arc<MasterService>,
}

impl MasterShardStateReporter {
    pub fn new(master: Arc<MasterService>) -> Self {
        Self { master }
    }

    async fn submit(&self, topic: &str, task: Task) -> Result<()> {
        match self.master.submit_task(topic, task).outcome().await {
            TaskOutcome::Processed { .. } => Ok(()),
            TaskOutcome::Failed { source, error } => {
                warn!(source = %source, error = %error, "Shard state report rejected");
                Err(error)
            }
            TaskOutcome::NoLongerMaster { .. } => Err(MeridianError::NotMaster { master: None }),
        }
    }
}

#[async_trait]
impl ShardStateReporter for MasterShardStateReporter {
    async fn shard_started(&self, routing: &ShardRouting, message: &str) -> Result<()> {
        let allocation_id = routing
            .allocation_id
            .ok_or_else(|| MeridianError::InvalidState(format!("{} is not assigned", routing.shard_id)))?;
        self.submit(
            "shard-started",
            shard_started_task(routing.shard_id.clone(), allocation_id, message),
        )
        .await
    }

    async fn shard_failed(&self, routing: &ShardRouting, reason: &str) -> Result<()> {
        let allocation_id = routing
            .allocation_id
            .ok_or_else(|| MeridianError::InvalidState(format!("{} is not assigned", routing.shard_id)))?;
        self.submit(
            "shard-failed",
            shard_failed_task(routing.shard_id.clone(), allocation_id, reason),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::IndexMetadata;

    fn two_nodes() -> ClusterState {
        let mut state = ClusterState::bootstrap("test", DiscoveryNode::new("node-1", "127.0.0.1:9300"));
        state
            .nodes
            .insert("node-2".into(), DiscoveryNode::new("node-2", "127.0.0.1:9301"));
        state
            .nodes
            .insert("node-3".into(), DiscoveryNode::new("node-3", "127.0.0.1:9302"));
        let meta = IndexMetadata::new("logs", 1, 1);
        state.routing_table.add_index(&meta, 0);
        state.metadata.indices.insert("logs".into(), meta);
        state
    }

    fn shard() -> ShardId {
        ShardId::new("logs", 0)
    }

    /// Primary started on node-1, replica started on node-2.
    fn started() -> ClusterState {
        let mut state = two_nodes();
        let p = state.routing_table.allocate_id();
        let r = state.routing_table.allocate_id();
        let copies = state.routing_table.copies_mut(&shard()).unwrap();
        copies[0] = copies[0].initialize("node-1", p);
        copies[1] = copies[1].initialize("node-2", r);
        let state = start_shard(&state, &shard(), p).unwrap();
        start_shard(&state, &shard(), r).unwrap()
    }

    fn copy_on<'a>(state: &'a ClusterState, node: &str) -> &'a ShardRouting {
        state
            .routing_table
            .copies(&shard())
            .unwrap()
            .iter()
            .find(|c| c.node_id.as_deref() == Some(node))
            .unwrap()
    }

    #[test]
    fn test_start_shard_is_keyed_by_allocation() {
        let state = started();
        assert!(state
            .routing_table
            .all_shards()
            .all(|c| c.state == ShardRoutingState::Started));

        let err = start_shard(&state, &shard(), 99).unwrap_err();
        assert!(matches!(err, MeridianError::InvalidState(_)));
    }

    #[test]
    fn test_failed_primary_promotes_replica() {
        let state = started();
        let primary_id = copy_on(&state, "node-1").allocation_id.unwrap();

        let next = fail_shard(&state, &shard(), primary_id, "disk broke", 7).unwrap();
        assert!(copy_on(&next, "node-2").primary);

        let unassigned = next
            .routing_table
            .copies(&shard())
            .unwrap()
            .iter()
            .find(|c| c.state == ShardRoutingState::Unassigned)
            .unwrap();
        assert!(!unassigned.primary);
        let info = unassigned.unassigned_info.as_ref().unwrap();
        assert_eq!(info.reason, UnassignedReason::AllocationFailed);
        assert_eq!(info.failed_attempts, 1);
        assert_eq!(info.last_failed_node.as_deref(), Some("node-1"));
        assert_eq!(info.at_millis, 7);
    }

    #[test]
    fn test_stale_failure_is_rejected() {
        let state = started();
        assert!(matches!(
            fail_shard(&state, &shard(), 42, "old", 0),
            Err(MeridianError::InvalidState(_))
        ));
    }

    #[test]
    fn test_relocation_completes_on_start() {
        let state = started();
        let moving = move_shard(&state, &shard(), "node-2", "node-3").unwrap();
        assert_eq!(copy_on(&moving, "node-2").state, ShardRoutingState::Relocating);
        let target = copy_on(&moving, "node-3").clone();
        assert!(target.is_relocation_target());

        let done = start_shard(&moving, &shard(), target.allocation_id.unwrap()).unwrap();
        let copies = done.routing_table.copies(&shard()).unwrap();
        assert_eq!(copies.len(), 2);
        assert!(copies.iter().all(|c| c.state == ShardRoutingState::Started));
        assert!(copies.iter().all(|c| c.node_id.as_deref() != Some("node-2")));
    }

    #[test]
    fn test_failed_relocation_target_restores_source() {
        let state = started();
        let moving = move_shard(&state, &shard(), "node-2", "node-3").unwrap();
        let target_id = copy_on(&moving, "node-3").allocation_id.unwrap();

        let restored = fail_shard(&moving, &shard(), target_id, "copy failed", 0).unwrap();
        assert_eq!(copy_on(&restored, "node-2").state, ShardRoutingState::Started);
        assert_eq!(copy_on(&restored, "node-2").relocating_node_id, None);
        assert_eq!(restored.routing_table.copies(&shard()).unwrap().len(), 2);
    }

    #[test]
    fn test_move_requires_started_source_and_free_target() {
        let state = started();
        assert!(move_shard(&state, &shard(), "node-1", "node-2").is_err());
        assert!(move_shard(&state, &shard(), "node-3", "node-1").is_err());
        assert!(matches!(
            move_shard(&state, &shard(), "node-1", "node-9"),
            Err(MeridianError::NodeNotFound(_))
        ));
    }

    #[test]
    fn test_node_left_fails_its_copies() {
        let state = started();
        let next = remove_node(&state, "node-1", 5).unwrap();
        assert!(!next.nodes.contains_key("node-1"));
        assert!(copy_on(&next, "node-2").primary);

        let unassigned = next
            .routing_table
            .copies(&shard())
            .unwrap()
            .iter()
            .find(|c| c.state == ShardRoutingState::Unassigned)
            .unwrap();
        assert_eq!(unassigned.failed_attempts(), 0);
        assert_eq!(
            unassigned.unassigned_info.as_ref().map(|i| i.reason),
            Some(UnassignedReason::NodeLeft)
        );
    }

    #[test]
    fn test_unstarted_primary_keeps_index_created() {
        let mut state = two_nodes();
        let p = state.routing_table.allocate_id();
        let copies = state.routing_table.copies_mut(&shard()).unwrap();
        copies[0] = copies[0].initialize("node-1", p);

        let failed = fail_shard(&state, &shard(), p, "disk full", 3).unwrap();
        let primary = failed.routing_table.primary(&shard()).unwrap();
        assert_eq!(primary.state, ShardRoutingState::Unassigned);
        let info = primary.unassigned_info.as_ref().unwrap();
        assert_eq!(info.reason, UnassignedReason::IndexCreated);
        assert_eq!(info.message, "disk full");
        assert_eq!(info.failed_attempts, 1);
    }

    #[test]
    fn test_lost_started_primary_is_not_new() {
        let mut state = two_nodes();
        let p = state.routing_table.allocate_id();
        let copies = state.routing_table.copies_mut(&shard()).unwrap();
        copies[0] = copies[0].initialize("node-1", p);
        let state = start_shard(&state, &shard(), p).unwrap();

        let failed = fail_shard(&state, &shard(), p, "disk broke", 3).unwrap();
        let primary = failed.routing_table.primary(&shard()).unwrap();
        assert!(primary.primary);
        assert_eq!(
            primary.unassigned_info.as_ref().map(|i| i.reason),
            Some(UnassignedReason::AllocationFailed)
        );
        assert!(!primary.initialize("node-2", 9).recovers_from_empty_store());
    }

    #[test]
    fn test_node_join_is_idempotent() {
        let state = two_nodes();
        let node = DiscoveryNode::new("node-4", "127.0.0.1:9303");
        let next = add_node(&state, &node).unwrap();
        assert!(next.nodes.contains_key("node-4"));
        assert!(add_node(&next, &node).unwrap().same_content(&next));
    }
}
