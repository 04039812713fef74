// Test fixtures: cluster states, configurations and shard data

use meridian::actions::allocation::reroute;
use meridian::actions::indices::create_index;
use meridian::actions::shard_state::start_shard;
use meridian::actions::CreateIndexRequest;
use meridian::config::{MasterConfig, MeridianConfig, PublishConfig, QuorumPolicy, RecoveryConfig};
use meridian::recovery::InMemoryShardStore;
use meridian::state::{ClusterState, DiscoveryNode, NodeRole, ShardRouting, ShardRoutingState};
use meridian::types::ShardId;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::time::Duration;

pub const INDEX: &str = "logs";

pub fn shard(n: u32) -> ShardId {
    ShardId::new(INDEX, n)
}

pub fn node(id: &str) -> DiscoveryNode {
    DiscoveryNode::new(id, format!("{}.local:9300", id))
}

/// A node that can be master but holds no shards.
pub fn master_only_node(id: &str) -> DiscoveryNode {
    node(id).with_roles([NodeRole::Master])
}

/// Bootstrapped state with `ids[0]` as master and every id as a member.
pub fn cluster_state(ids: &[&str]) -> ClusterState {
    let mut state = ClusterState::bootstrap("test-cluster", node(ids[0]));
    for id in &ids[1..] {
        state.nodes.insert(id.to_string(), node(id));
    }
    state
}

pub fn fields(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Nodes `a` and `b`; index `logs` with one shard and one replica. The
/// primary is started on `a`, the replica initializing on `b`.
pub fn replica_recovery_state() -> ClusterState {
    let base = cluster_state(&["a", "b"]);
    let mut request = CreateIndexRequest::new(INDEX, 1, 1);
    request.mapping = fields(&[("message", "text")]);
    let created = reroute(&create_index(&base, &request, 0).expect("create index")).expect("reroute");
    let primary = created
        .routing_table
        .primary(&shard(0))
        .and_then(|p| p.allocation_id)
        .expect("primary allocated");
    let started = start_shard(&created, &shard(0), primary).expect("start primary");
    reroute(&started).expect("reroute")
}

/// The copy of `shard` in `state` that is initializing on `node_id`.
pub fn initializing_copy(state: &ClusterState, shard: &ShardId, node_id: &str) -> ShardRouting {
    state
        .routing_table
        .copies(shard)
        .into_iter()
        .flatten()
        .find(|c| c.state == ShardRoutingState::Initializing && c.node_id.as_deref() == Some(node_id))
        .cloned()
        .expect("initializing copy")
}

/// Fast retries and small chunks.
pub fn recovery_config() -> RecoveryConfig {
    RecoveryConfig {
        max_concurrent_recoveries: 2,
        max_retries: 3,
        phase_timeout: Duration::from_secs(2),
        retry_backoff: Duration::from_millis(5),
        max_retry_backoff: Duration::from_millis(20),
        chunk_size: 64,
        mapping_retries: 3,
    }
}

pub fn master_config() -> MasterConfig {
    MasterConfig {
        republish_backoff: Duration::from_millis(10),
        ..MasterConfig::default()
    }
}

pub fn publish_config(required_acks: QuorumPolicy) -> PublishConfig {
    PublishConfig {
        timeout: Duration::from_millis(500),
        required_acks,
        diffs_enabled: true,
    }
}

pub fn cluster_config() -> MeridianConfig {
    let mut config = MeridianConfig::development();
    config.node.id = "node-1".to_string();
    config.node.name = "node-1".to_string();
    config.master = master_config();
    config.publish = publish_config(QuorumPolicy::Majority);
    config.recovery = recovery_config();
    config
}

/// Fill a shard with segment files and translog operations.
pub fn seed_shard(store: &InMemoryShardStore, shard: &ShardId, files: usize, operations: usize, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    for i in 0..files {
        let len = rng.gen_range(1..300);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
        store.put_file(shard, format!("_{}.seg", i), data);
    }
    for i in 0..operations {
        store.index_document(shard, format!("doc-{}", i), fields(&[("message", "text")]));
    }
}
