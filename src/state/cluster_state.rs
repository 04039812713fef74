//! The immutable cluster state snapshot.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::metadata::{IndexMetadata, Metadata};
use super::routing::{RoutingTable, ShardRouting, ShardRoutingState};
use crate::types::{NodeId, ShardId, Version, WireMessage};

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeRole {
    /// May be elected master and runs the master service.
    Master,
    /// Holds shard copies.
    Data,
}

/// A node known to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub id: NodeId,
    pub name: String,
    pub address: String,
    pub roles: BTreeSet<NodeRole>,
}

impl DiscoveryNode {
    /// A node carrying both the master and the data role.
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            address: address.into(),
            roles: [NodeRole::Master, NodeRole::Data].into_iter().collect(),
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = NodeRole>) -> Self {
        self.roles = roles.into_iter().collect();
        self
    }

    pub fn is_data(&self) -> bool {
        self.roles.contains(&NodeRole::Data)
    }

    pub fn is_master_eligible(&self) -> bool {
        self.roles.contains(&NodeRole::Master)
    }
}

/// Versioned, immutable snapshot of topology, metadata and shard routing.
///
/// States are shared as `Arc<ClusterState>` and never mutated once committed;
/// a task clones the state it is given and returns the modified copy. Every
/// map is ordered so that equal states encode to identical bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    /// Strictly increasing with every committed state.
    pub version: Version,
    pub cluster_name: String,
    pub cluster_uuid: String,
    /// Node that published this state.
    pub master_node: Option<NodeId>,
    pub nodes: BTreeMap<NodeId, DiscoveryNode>,
    pub metadata: Metadata,
    pub routing_table: RoutingTable,
}

impl WireMessage for ClusterState {}

impl ClusterState {
    /// Version 0 state of a cluster that has not been bootstrapped yet.
    pub fn empty(cluster_name: impl Into<String>) -> Self {
        Self {
            version: 0,
            cluster_name: cluster_name.into(),
            cluster_uuid: "_na_".to_string(),
            master_node: None,
            nodes: BTreeMap::new(),
            metadata: Metadata::default(),
            routing_table: RoutingTable::default(),
        }
    }

    /// Initial state of a freshly bootstrapped cluster elected around `master`.
    pub fn bootstrap(cluster_name: impl Into<String>, master: DiscoveryNode) -> Self {
        let mut state = Self::empty(cluster_name);
        state.version = 1;
        state.cluster_uuid = uuid::Uuid::new_v4().to_string();
        state.master_node = Some(master.id.clone());
        state.nodes.insert(master.id.clone(), master);
        state
    }

    /// Whether two states carry the same content, ignoring their versions.
    pub fn same_content(&self, other: &ClusterState) -> bool {
        self.cluster_name == other.cluster_name
            && self.cluster_uuid == other.cluster_uuid
            && self.master_node == other.master_node
            && self.nodes == other.nodes
            && self.metadata == other.metadata
            && self.routing_table == other.routing_table
    }

    pub fn index(&self, name: &str) -> Option<&IndexMetadata> {
        self.metadata.indices.get(name)
    }

    pub fn node(&self, id: &str) -> Option<&DiscoveryNode> {
        self.nodes.get(id)
    }

    /// Data nodes in id order.
    pub fn data_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.is_data())
    }

    pub fn master_eligible_nodes(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values().filter(|n| n.is_master_eligible())
    }

    /// All shard copies assigned to `node_id`.
    pub fn shards_on_node<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a ShardRouting> {
        self.routing_table
            .all_shards()
            .filter(move |s| s.node_id.as_deref() == Some(node_id))
    }

    /// Whether `node_id` still holds an initializing copy of `shard` with the
    /// given allocation id.
    pub fn has_initializing_copy(&self, node_id: &str, shard: &ShardId, allocation_id: u64) -> bool {
        self.routing_table
            .copies(shard)
            .map(|copies| {
                copies.iter().any(|c| {
                    c.state == ShardRoutingState::Initializing
                        && c.allocation_id == Some(allocation_id)
                        && c.node_id.as_deref() == Some(node_id)
                })
            })
            .unwrap_or(false)
    }

    /// Return a copy of this state carrying `version`.
    pub fn with_version(&self, version: Version) -> Self {
        let mut state = self.clone();
        state.version = version;
        state
    }
}
