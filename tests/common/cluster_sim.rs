// In-memory cluster pieces with failure injection

use async_trait::async_trait;
use meridian::actions::{AllocationService, MappingUpdate, MappingUpdatePerformer};
use meridian::config::{MasterConfig, QuorumPolicy};
use meridian::error::{MeridianError, Result};
use meridian::master::{MasterService, TaskContext};
use meridian::publish::{ClusterStateApplier, InMemoryTransport, Publisher};
use meridian::recovery::{
    FileChunk, InMemoryRecoverySource, InMemoryShardStore, RecoveryCoordinator, RecoveryFilesInfo,
    RecoveryServices, RecoverySessionHandle, RecoverySource, ShardStateReporter, StartRecoveryRequest,
    StoreFileMetadata, TranslogBatch,
};
use meridian::state::{ClusterState, ClusterStateStore, ShardRouting};
use meridian::types::{ManualClock, ShardId};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use super::fixtures::*;

/// Recovery source that can fail or stall on demand.
pub struct FlakySource {
    inner: InMemoryRecoverySource,
    /// `start_recovery` calls that fail with a disconnect before succeeding.
    failing_starts: AtomicU32,
    /// Stall forever on the chunk read after the first one.
    stall_after_first_chunk: AtomicBool,
    pub start_calls: AtomicU32,
    pub chunk_reads: AtomicU32,
    /// Notified when a read stalls.
    pub stalled: Notify,
}

impl FlakySource {
    pub fn new() -> Self {
        Self {
            inner: InMemoryRecoverySource::new(),
            failing_starts: AtomicU32::new(0),
            stall_after_first_chunk: AtomicBool::new(false),
            start_calls: AtomicU32::new(0),
            chunk_reads: AtomicU32::new(0),
            stalled: Notify::new(),
        }
    }

    pub fn register(&self, node_id: &str, store: Arc<InMemoryShardStore>) {
        self.inner.register(node_id, store);
    }

    pub fn disconnect(&self, node_id: &str) {
        self.inner.disconnect(node_id);
    }

    pub fn fail_starts(&self, n: u32) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    pub fn stall_after_first_chunk(&self) {
        self.stall_after_first_chunk.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecoverySource for FlakySource {
    async fn start_recovery(&self, request: &StartRecoveryRequest) -> Result<RecoveryFilesInfo> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_starts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(MeridianError::NodeDisconnected(request.source_node.clone()));
        }
        self.inner.start_recovery(request).await
    }

    async fn read_chunk(
        &self,
        request: &StartRecoveryRequest,
        file: &StoreFileMetadata,
        offset: u64,
        max_len: usize,
    ) -> Result<FileChunk> {
        let reads = self.chunk_reads.fetch_add(1, Ordering::SeqCst);
        if reads >= 1 && self.stall_after_first_chunk.load(Ordering::SeqCst) {
            self.stalled.notify_one();
            futures::future::pending::<()>().await;
        }
        self.inner.read_chunk(request, file, offset, max_len).await
    }

    async fn translog_operations(&self, request: &StartRecoveryRequest) -> Result<TranslogBatch> {
        self.inner.translog_operations(request).await
    }

    async fn finalize(&self, request: &StartRecoveryRequest) -> Result<()> {
        self.inner.finalize(request).await
    }
}

/// Records shard state reports instead of sending them to a master.
#[derive(Default)]
pub struct RecordingReporter {
    pub started: Mutex<Vec<ShardRouting>>,
    pub failed: Mutex<Vec<(ShardRouting, String)>>,
    /// Reports rejected with `PublicationFailed` before one is accepted.
    rejected_reports: AtomicU32,
    pub calls: AtomicU32,
}

impl RecordingReporter {
    pub fn started_count(&self) -> usize {
        self.started.lock().len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.lock().len()
    }

    pub fn reject_reports(&self, n: u32) {
        self.rejected_reports.store(n, Ordering::SeqCst);
    }

    fn accept(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let rejected = self
            .rejected_reports
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(MeridianError::PublicationFailed {
                version: 0,
                required: 2,
                acks: 1,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ShardStateReporter for RecordingReporter {
    async fn shard_started(&self, routing: &ShardRouting, _message: &str) -> Result<()> {
        self.accept()?;
        self.started.lock().push(routing.clone());
        Ok(())
    }

    async fn shard_failed(&self, routing: &ShardRouting, reason: &str) -> Result<()> {
        self.accept()?;
        self.failed.lock().push((routing.clone(), reason.to_string()));
        Ok(())
    }
}

/// Mapping performer whose verification keeps answering `RetryOnPrimary`
/// for a configurable number of calls.
#[derive(Default)]
pub struct ScriptedMapping {
    not_visible_for: AtomicU32,
    pub updates: Mutex<Vec<MappingUpdate>>,
    pub verifications: AtomicU32,
}

impl ScriptedMapping {
    pub fn not_visible_for(calls: u32) -> Self {
        Self {
            not_visible_for: AtomicU32::new(calls),
            ..Self::default()
        }
    }
}

#[async_trait]
impl MappingUpdatePerformer for ScriptedMapping {
    async fn update_mappings(&self, update: &MappingUpdate, _shard: &ShardId) -> Result<()> {
        self.updates.lock().push(update.clone());
        Ok(())
    }

    async fn verify_mappings(&self, _update: &MappingUpdate, shard: &ShardId) -> Result<()> {
        self.verifications.fetch_add(1, Ordering::SeqCst);
        let pending = self
            .not_visible_for
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if pending {
            Err(MeridianError::RetryOnPrimary(format!("mapping for {} not visible yet", shard)))
        } else {
            Ok(())
        }
    }
}

/// Recovery coordinator of node `b` in [`replica_recovery_state`], with its
/// collaborators exposed.
pub struct RecoveryHarness {
    pub state: ClusterState,
    pub store: Arc<ClusterStateStore>,
    pub source_store: Arc<InMemoryShardStore>,
    pub target: Arc<InMemoryShardStore>,
    pub source: Arc<FlakySource>,
    pub reporter: Arc<RecordingReporter>,
    pub mapping: Arc<ScriptedMapping>,
    pub coordinator: Arc<RecoveryCoordinator>,
}

impl RecoveryHarness {
    pub fn new(config: meridian::config::RecoveryConfig) -> Self {
        Self::with_mapping(config, ScriptedMapping::default())
    }

    pub fn with_mapping(config: meridian::config::RecoveryConfig, mapping: ScriptedMapping) -> Self {
        let state = replica_recovery_state();
        let store = Arc::new(ClusterStateStore::new(state.clone()));
        let source_store = Arc::new(InMemoryShardStore::new());
        let target = Arc::new(InMemoryShardStore::new());
        let source = Arc::new(FlakySource::new());
        source.register("a", source_store.clone());
        let reporter = Arc::new(RecordingReporter::default());
        let mapping = Arc::new(mapping);

        let coordinator = Arc::new(RecoveryCoordinator::new(
            "b",
            config,
            Arc::new(ManualClock::new(1_000)),
            store.clone(),
            RecoveryServices {
                source: source.clone(),
                target: target.clone(),
                reporter: reporter.clone(),
                mapping: mapping.clone(),
            },
        ));

        Self {
            state,
            store,
            source_store,
            target,
            source,
            reporter,
            mapping,
            coordinator,
        }
    }

    /// The replica copy initializing on `b`.
    pub fn replica(&self) -> ShardRouting {
        initializing_copy(&self.state, &shard(0), "b")
    }

    /// Recover the replica from `a`.
    pub fn start(&self) -> RecoverySessionHandle {
        let source = self.state.node("a").cloned();
        self.coordinator
            .start_recovery(self.replica(), source)
            .expect("start recovery")
    }
}

/// Nodes of a publication test, each with its own store and applier.
pub struct PublicationCluster {
    pub state: Arc<ClusterState>,
    pub transport: Arc<InMemoryTransport>,
    pub stores: BTreeMap<String, Arc<ClusterStateStore>>,
}

impl PublicationCluster {
    /// `n` nodes named `node-1..=node-n`, all holding the same initial state.
    pub fn new(n: usize) -> Self {
        let ids: Vec<String> = (1..=n).map(|i| format!("node-{}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let state = Arc::new(cluster_state(&refs));
        let transport = Arc::new(InMemoryTransport::new());
        let mut stores = BTreeMap::new();
        for id in &ids {
            let store = Arc::new(ClusterStateStore::new((*state).clone()));
            transport.register(id.clone(), Arc::new(ClusterStateApplier::new(id.clone(), store.clone())));
            stores.insert(id.clone(), store);
        }
        Self {
            state,
            transport,
            stores,
        }
    }

    pub fn publisher(&self) -> Publisher {
        Publisher::new(self.transport.clone(), true)
    }

    pub fn version_on(&self, node: &str) -> u64 {
        self.stores[node].current().version
    }

    /// A master service on `node-1` publishing to every node. Its round loop
    /// is not started; tests drive rounds with `run_round`.
    pub fn master(&self, config: MasterConfig, required_acks: QuorumPolicy) -> Arc<MasterService> {
        let master = Arc::new(MasterService::new(
            TaskContext::new("node-1", Arc::new(ManualClock::new(0))),
            config,
            publish_config(required_acks),
            self.stores["node-1"].clone(),
            self.publisher(),
            Arc::new(AllocationService),
        ));
        master.become_master(1);
        master
    }
}
