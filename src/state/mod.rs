//! Cluster state model.
//!
//! - [`ClusterState`]: immutable, versioned snapshot shared as `Arc`
//! - [`ClusterStateStore`]: the node-local holder with compare-and-swap commit
//! - [`ClusterStateDiff`]: what the publisher sends to nodes that are one
//!   version behind
//! - [`RoutingChanges`]: per-copy transitions between two states, used to
//!   trigger recoveries

pub mod cluster_state;
pub mod diff;
pub mod metadata;
pub mod routing;
pub mod store;

pub use cluster_state::{ClusterState, DiscoveryNode, NodeRole};
pub use diff::{ClusterStateDiff, RoutingChanges};
pub use metadata::{AliasMetadata, IndexMetadata, Mapping, Metadata};
pub use routing::{IndexRoutingTable, RoutingTable, ShardRouting, ShardRoutingState, UnassignedInfo, UnassignedReason};
pub use store::ClusterStateStore;
