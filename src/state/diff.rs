//! Cluster state diffs and routing change detection.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::cluster_state::{ClusterState, DiscoveryNode};
use super::metadata::IndexMetadata;
use super::routing::{IndexRoutingTable, ShardRouting, ShardRoutingState};
use crate::error::{MeridianError, Result};
use crate::types::{NodeId, Version, WireMessage};

/// Difference between two consecutive cluster states.
///
/// Only applicable to a node whose current state is exactly `from_version`
/// with the same cluster UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterStateDiff {
    pub cluster_uuid: String,
    pub from_version: Version,
    pub to_version: Version,
    pub master_node: Option<NodeId>,
    /// Full node set, present only when it changed.
    pub nodes: Option<BTreeMap<NodeId, DiscoveryNode>>,
    pub upserted_indices: BTreeMap<String, IndexMetadata>,
    pub removed_indices: Vec<String>,
    pub upserted_routing: BTreeMap<String, IndexRoutingTable>,
    pub removed_routing: Vec<String>,
    pub next_allocation_id: u64,
}

impl WireMessage for ClusterStateDiff {}

impl ClusterStateDiff {
    /// Compute the diff turning `previous` into `next`.
    pub fn between(previous: &ClusterState, next: &ClusterState) -> Self {
        let nodes = (previous.nodes != next.nodes).then(|| next.nodes.clone());

        let upserted_indices = next
            .metadata
            .indices
            .iter()
            .filter(|(name, meta)| previous.metadata.indices.get(*name) != Some(*meta))
            .map(|(name, meta)| (name.clone(), meta.clone()))
            .collect();
        let removed_indices = previous
            .metadata
            .indices
            .keys()
            .filter(|name| !next.metadata.indices.contains_key(*name))
            .cloned()
            .collect();

        let upserted_routing = next
            .routing_table
            .indices
            .iter()
            .filter(|(name, table)| previous.routing_table.indices.get(*name) != Some(*table))
            .map(|(name, table)| (name.clone(), table.clone()))
            .collect();
        let removed_routing = previous
            .routing_table
            .indices
            .keys()
            .filter(|name| !next.routing_table.indices.contains_key(*name))
            .cloned()
            .collect();

        Self {
            cluster_uuid: next.cluster_uuid.clone(),
            from_version: previous.version,
            to_version: next.version,
            master_node: next.master_node.clone(),
            nodes,
            upserted_indices,
            removed_indices,
            upserted_routing,
            removed_routing,
            next_allocation_id: next.routing_table.next_allocation_id,
        }
    }

    /// Apply the diff on top of `base`.
    pub fn apply(&self, base: &ClusterState) -> Result<ClusterState> {
        if base.version != self.from_version || base.cluster_uuid != self.cluster_uuid {
            return Err(MeridianError::IncompatibleClusterStateVersion {
                local: base.version,
                base: self.from_version,
            });
        }

        let mut state = base.clone();
        state.version = self.to_version;
        state.master_node = self.master_node.clone();
        if let Some(nodes) = &self.nodes {
            state.nodes = nodes.clone();
        }
        for name in &self.removed_indices {
            state.metadata.indices.remove(name);
        }
        for (name, meta) in &self.upserted_indices {
            state.metadata.indices.insert(name.clone(), meta.clone());
        }
        for name in &self.removed_routing {
            state.routing_table.indices.remove(name);
        }
        for (name, table) in &self.upserted_routing {
            state.routing_table.indices.insert(name.clone(), table.clone());
        }
        state.routing_table.next_allocation_id = self.next_allocation_id;
        Ok(state)
    }
}

/// Shard copies whose state changed between two cluster states.
#[derive(Debug, Clone, Default)]
pub struct RoutingChanges {
    /// Copies that became INITIALIZING.
    pub initializing: Vec<ShardRouting>,
    /// Copies that became STARTED.
    pub started: Vec<ShardRouting>,
    /// Assigned copies that disappeared, keyed by their previous routing.
    pub removed: Vec<ShardRouting>,
}

impl RoutingChanges {
    /// Compare two states copy by copy, matching copies by allocation id.
    pub fn between(previous: &ClusterState, next: &ClusterState) -> Self {
        let state_of = |state: &ClusterState| -> BTreeMap<u64, ShardRouting> {
            state
                .routing_table
                .all_shards()
                .filter_map(|c| c.allocation_id.map(|id| (id, c.clone())))
                .collect()
        };
        let before = state_of(previous);
        let after = state_of(next);

        let mut changes = RoutingChanges::default();
        for (id, copy) in &after {
            let old_state = before.get(id).map(|c| c.state);
            if old_state == Some(copy.state) {
                continue;
            }
            match copy.state {
                ShardRoutingState::Initializing => changes.initializing.push(copy.clone()),
                ShardRoutingState::Started => changes.started.push(copy.clone()),
                _ => {}
            }
        }
        for (id, copy) in &before {
            if !after.contains_key(id) {
                changes.removed.push(copy.clone());
            }
        }
        changes
    }

    /// Newly initializing copies assigned to `node_id`.
    pub fn initializing_on<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ShardRouting> {
        self.initializing
            .iter()
            .filter(move |c| c.node_id.as_deref() == Some(node_id))
    }

    pub fn is_empty(&self) -> bool {
        self.initializing.is_empty() && self.started.is_empty() && self.removed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::cluster_state::DiscoveryNode;

    fn base() -> ClusterState {
        ClusterState::bootstrap("test", DiscoveryNode::new("node-1", "127.0.0.1:9300"))
    }

    #[test]
    fn test_diff_roundtrip() {
        let previous = base();
        let mut next = previous.with_version(2);
        let meta = IndexMetadata::new("logs", 1, 0);
        next.routing_table.add_index(&meta, 0);
        next.metadata.indices.insert("logs".into(), meta);
        next.nodes
            .insert("node-2".into(), DiscoveryNode::new("node-2", "127.0.0.1:9301"));

        let diff = ClusterStateDiff::between(&previous, &next);
        assert!(diff.nodes.is_some());
        assert_eq!(diff.apply(&previous).unwrap(), next);
    }

    #[test]
    fn test_diff_removes_index() {
        let mut previous = base();
        let meta = IndexMetadata::new("logs", 1, 0);
        previous.routing_table.add_index(&meta, 0);
        previous.metadata.indices.insert("logs".into(), meta);

        let mut next = previous.with_version(2);
        next.metadata.indices.remove("logs");
        next.routing_table.remove_index("logs");

        let diff = ClusterStateDiff::between(&previous, &next);
        assert_eq!(diff.removed_indices, vec!["logs".to_string()]);
        assert!(diff.nodes.is_none());
        assert_eq!(diff.apply(&previous).unwrap(), next);
    }

    #[test]
    fn test_diff_rejects_wrong_base() {
        let previous = base();
        let next = previous.with_version(2);
        let diff = ClusterStateDiff::between(&previous, &next);

        let err = diff.apply(&previous.with_version(5)).unwrap_err();
        assert!(matches!(
            err,
            MeridianError::IncompatibleClusterStateVersion { local: 5, base: 1 }
        ));
    }

    #[test]
    fn test_routing_changes() {
        let mut previous = base();
        let meta = IndexMetadata::new("logs", 1, 0);
        previous.routing_table.add_index(&meta, 0);
        previous.metadata.indices.insert("logs".into(), meta);

        let mut next = previous.with_version(2);
        let id = next.routing_table.allocate_id();
        let shard = crate::types::ShardId::new("logs", 0);
        let copies = next.routing_table.copies_mut(&shard).unwrap();
        copies[0] = copies[0].initialize("node-1", id);

        let changes = RoutingChanges::between(&previous, &next);
        assert_eq!(changes.initializing_on("node-1").count(), 1);
        assert_eq!(changes.initializing_on("node-2").count(), 0);
        assert!(changes.started.is_empty());
    }
}
