//! Shard allocation.
//!
//! Runs once at the end of every batch that asked for it. Decisions only
//! depend on the input state: candidate nodes are ordered by load and then
//! id, and allocation ids come from the routing table's counter.

use tracing::debug;

use crate::error::Result;
use crate::master::{StateTransform, TaskContext};
use crate::state::{ClusterState, ShardRoutingState};
use crate::types::{NodeId, ShardId};

/// Copies that failed this many times stay unassigned.
pub const MAX_ALLOCATION_ATTEMPTS: u32 = 5;

/// Assign unassigned copies to data nodes.
///
/// Primaries are placed first; a replica is only placed once its primary is
/// active. A primary is only placed while its shard has never started, as
/// it then starts from an empty store. A node never holds two copies of the
/// same shard, and the node a copy last failed on is avoided when another
/// candidate exists.
pub fn reroute(state: &ClusterState) -> Result<ClusterState> {
    let mut next = state.clone();
    let data_nodes: Vec<NodeId> = next.data_nodes().map(|n| n.id.clone()).collect();
    if data_nodes.is_empty() {
        return Ok(next);
    }

    let shard_ids = next.routing_table.shard_ids();
    for primaries in [true, false] {
        for shard in &shard_ids {
            allocate_shard(&mut next, shard, primaries, &data_nodes);
        }
    }
    Ok(next)
}

fn allocate_shard(state: &mut ClusterState, shard: &ShardId, primaries: bool, data_nodes: &[NodeId]) {
    loop {
        let Some(copies) = state.routing_table.copies(shard) else {
            return;
        };

        let primary_active = copies.iter().any(|c| c.primary && c.active());
        if !primaries && !primary_active {
            return;
        }

        // A lost primary has no copy to recover from and stays unassigned.
        let Some(pos) = copies.iter().position(|c| {
            c.state == ShardRoutingState::Unassigned
                && c.primary == primaries
                && (!c.primary || c.recovers_from_empty_store())
                && c.failed_attempts() < MAX_ALLOCATION_ATTEMPTS
        }) else {
            return;
        };
        let copy = &copies[pos];
        let last_failed = copy
            .unassigned_info
            .as_ref()
            .and_then(|i| i.last_failed_node.clone());

        let candidates: Vec<&NodeId> = data_nodes
            .iter()
            .filter(|node| {
                !copies
                    .iter()
                    .any(|c| c.node_id.as_ref() == Some(*node) || c.relocating_node_id.as_ref() == Some(*node))
            })
            .collect();
        let preferred: Vec<&NodeId> = candidates
            .iter()
            .copied()
            .filter(|node| Some(*node) != last_failed.as_ref())
            .collect();
        let pool = if preferred.is_empty() { candidates } else { preferred };

        let Some(target) = pool
            .into_iter()
            .min_by(|a, b| {
                state
                    .routing_table
                    .node_load(a)
                    .cmp(&state.routing_table.node_load(b))
                    .then_with(|| a.cmp(b))
            })
            .cloned()
        else {
            debug!(shard = %shard, primary = primaries, "No node can hold another copy");
            return;
        };

        let allocation_id = state.routing_table.allocate_id();
        if let Some(copies) = state.routing_table.copies_mut(shard) {
            copies[pos] = copies[pos].initialize(&target, allocation_id);
        }
        debug!(
            shard = %shard,
            primary = primaries,
            node = %target,
            allocation_id,
            "Allocated shard copy"
        );
    }
}

/// The allocation step plugged into the task executor.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllocationService;

impl StateTransform for AllocationService {
    fn apply(&self, state: &ClusterState, _ctx: &TaskContext) -> Result<ClusterState> {
        reroute(state)
    }
}
