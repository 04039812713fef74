//! Node assembly.
//!
//! A [`ClusterNode`] bundles what one node runs: its cluster state store, the
//! applier receiving publications, its shard store and, on data nodes, a
//! recovery coordinator. A [`LocalCluster`] wires several nodes together in
//! one process over the in-memory transport, with the first node elected
//! master. The binary and the integration tests drive clusters through it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::actions::{
    create_index_task, node_join_task, node_left_task, AllocationService, CreateIndexRequest,
    MasterMappingUpdater, MasterShardStateReporter,
};
use crate::config::MeridianConfig;
use crate::error::{MeridianError, Result};
use crate::master::{MasterService, TaskContext};
use crate::publish::{ClusterStateApplier, InMemoryTransport, Publisher};
use crate::recovery::{
    InMemoryRecoverySource, InMemoryShardStore, RecoveryCoordinator, RecoveryServices,
};
use crate::shutdown::{ServiceSet, ShutdownCoordinator};
use crate::state::{ClusterState, ClusterStateStore, DiscoveryNode, ShardRoutingState};
use crate::types::{Clock, NodeId};

/// One node of a cluster.
pub struct ClusterNode {
    descriptor: DiscoveryNode,
    store: Arc<ClusterStateStore>,
    applier: Arc<ClusterStateApplier>,
    shards: Arc<InMemoryShardStore>,
    recovery: Option<Arc<RecoveryCoordinator>>,
}

impl ClusterNode {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    pub fn descriptor(&self) -> &DiscoveryNode {
        &self.descriptor
    }

    pub fn store(&self) -> &Arc<ClusterStateStore> {
        &self.store
    }

    pub fn applier(&self) -> &Arc<ClusterStateApplier> {
        &self.applier
    }

    pub fn shards(&self) -> &Arc<InMemoryShardStore> {
        &self.shards
    }

    pub fn recovery(&self) -> Option<&Arc<RecoveryCoordinator>> {
        self.recovery.as_ref()
    }

    /// The state last applied on this node.
    pub fn state(&self) -> Arc<ClusterState> {
        self.store.current()
    }
}

/// Several nodes running in one process.
pub struct LocalCluster {
    config: MeridianConfig,
    clock: Arc<dyn Clock>,
    transport: Arc<InMemoryTransport>,
    recovery_source: Arc<InMemoryRecoverySource>,
    master: Arc<MasterService>,
    nodes: BTreeMap<NodeId, ClusterNode>,
    shutdown: ShutdownCoordinator,
    services: ServiceSet,
}

impl LocalCluster {
    /// Bootstrap a cluster around the node described by `config.node` and
    /// elect it master.
    pub fn bootstrap(config: MeridianConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let descriptor = DiscoveryNode {
            id: config.node.id.clone(),
            name: config.node.name.clone(),
            address: config.node.address.clone(),
            roles: config.node.roles.iter().copied().collect(),
        };
        if !descriptor.is_master_eligible() {
            return Err(MeridianError::InvalidConfig {
                field: "node.roles".to_string(),
                reason: "the bootstrap node must be master eligible".to_string(),
            });
        }

        let initial = ClusterState::bootstrap(config.node.cluster_name.clone(), descriptor.clone());
        let store = Arc::new(ClusterStateStore::new(initial));
        let transport = Arc::new(InMemoryTransport::new());
        let recovery_source = Arc::new(InMemoryRecoverySource::new());

        let master = Arc::new(MasterService::new(
            TaskContext::new(descriptor.id.clone(), clock.clone()),
            config.master.clone(),
            config.publish.clone(),
            store.clone(),
            Publisher::new(transport.clone(), config.publish.diffs_enabled),
            Arc::new(AllocationService),
        ));
        master.become_master(1);

        let shutdown = ShutdownCoordinator::new();
        let mut services = ServiceSet::new();
        let master_loop = master.clone();
        let master_shutdown = shutdown.clone();
        services.register(
            "master",
            tokio::spawn(async move { master_loop.run(master_shutdown).await }),
        );

        let mut cluster = Self {
            config,
            clock,
            transport,
            recovery_source,
            master,
            nodes: BTreeMap::new(),
            shutdown,
            services,
        };
        let node = cluster.assemble(descriptor, store);
        info!(
            node = %node.id(),
            cluster = %node.state().cluster_name,
            uuid = %node.state().cluster_uuid,
            "Cluster bootstrapped"
        );
        cluster.nodes.insert(node.id().to_string(), node);
        Ok(cluster)
    }

    fn assemble(&mut self, descriptor: DiscoveryNode, store: Arc<ClusterStateStore>) -> ClusterNode {
        let applier = Arc::new(ClusterStateApplier::new(descriptor.id.clone(), store.clone()));
        self.transport.register(descriptor.id.clone(), applier.clone());

        let shards = Arc::new(InMemoryShardStore::new());
        self.recovery_source.register(descriptor.id.clone(), shards.clone());

        let recovery = descriptor.is_data().then(|| {
            let services = RecoveryServices {
                source: self.recovery_source.clone(),
                target: shards.clone(),
                reporter: Arc::new(MasterShardStateReporter::new(self.master.clone())),
                mapping: Arc::new(MasterMappingUpdater::new(self.master.clone(), store.clone())),
            };
            let coordinator = Arc::new(RecoveryCoordinator::new(
                descriptor.id.clone(),
                self.config.recovery.clone(),
                self.clock.clone(),
                store.clone(),
                services,
            ));
            let running = coordinator.clone();
            let shutdown = self.shutdown.clone();
            self.services.register(
                format!("recovery-{}", descriptor.id),
                tokio::spawn(async move { running.run(shutdown).await }),
            );
            coordinator
        });

        ClusterNode {
            descriptor,
            store,
            applier,
            shards,
            recovery,
        }
    }

    /// Start a node and have it join the cluster.
    pub async fn join(&mut self, descriptor: DiscoveryNode) -> Result<()> {
        if self.nodes.contains_key(&descriptor.id) {
            return Err(MeridianError::Validation(format!("node [{}] already running", descriptor.id)));
        }
        let store = Arc::new(ClusterStateStore::new(ClusterState::empty(
            self.config.node.cluster_name.clone(),
        )));
        let node = self.assemble(descriptor.clone(), store);
        self.nodes.insert(node.id().to_string(), node);

        self.master
            .submit_task("node-join", node_join_task(descriptor))
            .outcome()
            .await
            .into_result()
            .map(|_| ())
    }

    /// Remove a node from the cluster state. The node keeps running but no
    /// longer receives publications.
    pub async fn remove(&self, node_id: &str) -> Result<()> {
        self.transport.disconnect(node_id);
        self.recovery_source.disconnect(node_id);
        self.master
            .submit_task("node-left", node_left_task(node_id))
            .outcome()
            .await
            .into_result()
            .map(|_| ())
    }

    pub async fn create_index(&self, request: CreateIndexRequest) -> Result<Arc<ClusterState>> {
        self.master
            .submit_task("create-index", create_index_task(request))
            .outcome()
            .await
            .into_result()
    }

    pub fn master(&self) -> &Arc<MasterService> {
        &self.master
    }

    pub fn transport(&self) -> &Arc<InMemoryTransport> {
        &self.transport
    }

    pub fn recovery_source(&self) -> &Arc<InMemoryRecoverySource> {
        &self.recovery_source
    }

    pub fn node(&self, id: &str) -> Option<&ClusterNode> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.values()
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    /// The master's committed state.
    pub fn state(&self) -> Arc<ClusterState> {
        self.master.store().current()
    }

    /// Wait until `predicate` holds for the master's committed state.
    pub async fn wait_for<P>(&self, timeout: Duration, predicate: P) -> Result<Arc<ClusterState>>
    where
        P: Fn(&ClusterState) -> bool,
    {
        let mut rx = self.master.store().subscribe();
        let wait = async {
            loop {
                let current = rx.borrow_and_update().clone();
                if predicate(current.as_ref()) {
                    return Ok(current);
                }
                if rx.changed().await.is_err() {
                    return Err(MeridianError::Shutdown);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| MeridianError::Timeout(timeout.as_millis() as u64))?
    }

    /// Wait until every shard copy is started.
    pub async fn wait_for_green(&self, timeout: Duration) -> Result<Arc<ClusterState>> {
        self.wait_for(timeout, |state| {
            state
                .routing_table
                .all_shards()
                .all(|c| c.state == ShardRoutingState::Started)
        })
        .await
    }

    /// Stop every service and wait for them under the shutdown deadline.
    pub async fn shutdown(self) {
        info!(nodes = self.nodes.len(), "Stopping local cluster");
        self.shutdown.shutdown();
        self.services.run(&self.shutdown).await;
    }
}
