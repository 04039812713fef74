//! Shard routing table.
//!
//! Each index maps shard numbers to the list of copies of that shard. A copy
//! is identified by its allocation id, handed out from a counter stored in
//! the table itself so that allocation decisions replay deterministically.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::metadata::IndexMetadata;
use crate::types::{NodeId, ShardId};

/// Lifecycle state of a single shard copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardRoutingState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
}

impl std::fmt::Display for ShardRoutingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShardRoutingState::Unassigned => write!(f, "UNASSIGNED"),
            ShardRoutingState::Initializing => write!(f, "INITIALIZING"),
            ShardRoutingState::Started => write!(f, "STARTED"),
            ShardRoutingState::Relocating => write!(f, "RELOCATING"),
        }
    }
}

/// Why a copy is unassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnassignedReason {
    /// The shard has never had a started primary. Kept across failed
    /// initial allocations, since no copy holds data yet.
    IndexCreated,
    /// The copy failed on its node.
    AllocationFailed,
    /// The node holding the copy left the cluster.
    NodeLeft,
    /// A replica whose primary failed while it was recovering.
    PrimaryFailed,
}

impl std::fmt::Display for UnassignedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnassignedReason::IndexCreated => write!(f, "INDEX_CREATED"),
            UnassignedReason::AllocationFailed => write!(f, "ALLOCATION_FAILED"),
            UnassignedReason::NodeLeft => write!(f, "NODE_LEFT"),
            UnassignedReason::PrimaryFailed => write!(f, "PRIMARY_FAILED"),
        }
    }
}

/// Unassignment details, carried by the copy until it starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnassignedInfo {
    pub reason: UnassignedReason,
    pub message: String,
    pub failed_attempts: u32,
    pub last_failed_node: Option<NodeId>,
    pub at_millis: u64,
}

/// A single copy of a shard and where it lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    pub primary: bool,
    pub state: ShardRoutingState,
    pub node_id: Option<NodeId>,
    /// For a relocating copy, the target node; for a relocation target, the
    /// source node.
    pub relocating_node_id: Option<NodeId>,
    pub allocation_id: Option<u64>,
    pub unassigned_info: Option<UnassignedInfo>,
}

impl ShardRouting {
    pub fn unassigned(shard_id: ShardId, primary: bool, info: UnassignedInfo) -> Self {
        Self {
            shard_id,
            primary,
            state: ShardRoutingState::Unassigned,
            node_id: None,
            relocating_node_id: None,
            allocation_id: None,
            unassigned_info: Some(info),
        }
    }

    /// Assign this unassigned copy to `node_id`.
    ///
    /// The unassigned info is kept so that failed attempts keep counting
    /// until the copy starts.
    pub fn initialize(&self, node_id: &str, allocation_id: u64) -> Self {
        Self {
            shard_id: self.shard_id.clone(),
            primary: self.primary,
            state: ShardRoutingState::Initializing,
            node_id: Some(node_id.to_string()),
            relocating_node_id: None,
            allocation_id: Some(allocation_id),
            unassigned_info: self.unassigned_info.clone(),
        }
    }

    pub fn is_assigned(&self) -> bool {
        self.node_id.is_some()
    }

    /// Started or relocating: the copy holds data and serves requests.
    pub fn active(&self) -> bool {
        matches!(
            self.state,
            ShardRoutingState::Started | ShardRoutingState::Relocating
        )
    }

    /// An initializing copy that is the target of a relocation.
    pub fn is_relocation_target(&self) -> bool {
        self.state == ShardRoutingState::Initializing && self.relocating_node_id.is_some()
    }

    /// A primary of a shard that never started: it has no data to recover
    /// and may start from an empty store.
    pub fn recovers_from_empty_store(&self) -> bool {
        self.primary
            && !self.is_relocation_target()
            && self
                .unassigned_info
                .as_ref()
                .is_some_and(|i| i.reason == UnassignedReason::IndexCreated)
    }

    /// Number of previous failed attempts recorded for this copy.
    pub fn failed_attempts(&self) -> u32 {
        self.unassigned_info
            .as_ref()
            .map(|i| i.failed_attempts)
            .unwrap_or(0)
    }
}

/// Routing for every shard of one index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    pub index: String,
    pub shards: BTreeMap<u32, Vec<ShardRouting>>,
}

/// Routing for all indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub indices: BTreeMap<String, IndexRoutingTable>,
    pub next_allocation_id: u64,
}

impl RoutingTable {
    /// Add unassigned copies for every shard of a new index.
    pub fn add_index(&mut self, index: &IndexMetadata, at_millis: u64) {
        let mut table = IndexRoutingTable {
            index: index.name.clone(),
            shards: BTreeMap::new(),
        };
        for shard in 0..index.number_of_shards {
            let shard_id = ShardId::new(index.name.clone(), shard);
            let copies = (0..index.copies_per_shard())
                .map(|copy| {
                    ShardRouting::unassigned(
                        shard_id.clone(),
                        copy == 0,
                        UnassignedInfo {
                            reason: UnassignedReason::IndexCreated,
                            message: "index created".to_string(),
                            failed_attempts: 0,
                            last_failed_node: None,
                            at_millis,
                        },
                    )
                })
                .collect();
            table.shards.insert(shard, copies);
        }
        self.indices.insert(index.name.clone(), table);
    }

    pub fn remove_index(&mut self, index: &str) -> bool {
        self.indices.remove(index).is_some()
    }

    pub fn copies(&self, shard: &ShardId) -> Option<&Vec<ShardRouting>> {
        self.indices
            .get(&shard.index)
            .and_then(|t| t.shards.get(&shard.shard))
    }

    pub fn copies_mut(&mut self, shard: &ShardId) -> Option<&mut Vec<ShardRouting>> {
        self.indices
            .get_mut(&shard.index)
            .and_then(|t| t.shards.get_mut(&shard.shard))
    }

    /// Every copy of every shard, in index and shard order.
    pub fn all_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.indices
            .values()
            .flat_map(|t| t.shards.values())
            .flat_map(|copies| copies.iter())
    }

    /// Every shard id in the table, in order.
    pub fn shard_ids(&self) -> Vec<ShardId> {
        self.indices
            .values()
            .flat_map(|t| t.shards.keys().map(move |s| ShardId::new(t.index.clone(), *s)))
            .collect()
    }

    /// The copy of `shard` with `allocation_id`.
    pub fn find(&self, shard: &ShardId, allocation_id: u64) -> Option<&ShardRouting> {
        self.copies(shard)?
            .iter()
            .find(|c| c.allocation_id == Some(allocation_id))
    }

    pub fn primary(&self, shard: &ShardId) -> Option<&ShardRouting> {
        self.copies(shard)?.iter().find(|c| c.primary)
    }

    /// Number of copies assigned to `node_id`, counting relocation targets.
    pub fn node_load(&self, node_id: &str) -> usize {
        self.all_shards()
            .filter(|s| s.node_id.as_deref() == Some(node_id))
            .count()
    }

    /// Hand out the next allocation id.
    pub fn allocate_id(&mut self) -> u64 {
        self.next_allocation_id += 1;
        self.next_allocation_id
    }
}
