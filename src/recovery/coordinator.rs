//! Drives shard recoveries on one node.
//!
//! The coordinator watches the node's applied cluster state. Copies that
//! become INITIALIZING on the local node start a session; sessions whose copy
//! disappears or changes state are cancelled. Sessions run concurrently up to
//! `max_concurrent_recoveries`, their phases strictly in sequence.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use super::session::{RecoveryPhase, RecoverySession};
use super::source::{
    RecoveryResponse, RecoverySource, RecoveryTarget, ShardStateReporter, StartRecoveryRequest,
};
use crate::actions::{MappingUpdate, MappingUpdatePerformer};
use crate::config::RecoveryConfig;
use crate::error::{MeridianError, Result};
use crate::observability;
use crate::resilience::{RetryConfig, RetryExecutor};
use crate::shutdown::ShutdownCoordinator;
use crate::state::{ClusterState, ClusterStateStore, DiscoveryNode, RoutingChanges, ShardRouting};
use crate::types::{Clock, NodeId, ShardId};

type SharedSession = Arc<Mutex<RecoverySession>>;

/// How a recovery session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Done(RecoveryResponse),
    Failed { reason: String },
    Cancelled,
}

impl RecoveryOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryOutcome::Done(_) => "done",
            RecoveryOutcome::Failed { .. } => "failed",
            RecoveryOutcome::Cancelled => "cancelled",
        }
    }
}

/// Handle on a running recovery.
#[derive(Clone)]
pub struct RecoverySessionHandle {
    recovery_id: u64,
    shard_id: ShardId,
    allocation_id: u64,
    session: SharedSession,
    cancel: Arc<watch::Sender<bool>>,
    outcome: watch::Receiver<Option<RecoveryOutcome>>,
}

impl RecoverySessionHandle {
    pub fn recovery_id(&self) -> u64 {
        self.recovery_id
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn allocation_id(&self) -> u64 {
        self.allocation_id
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.session.lock().phase()
    }

    /// Snapshot of the session's trace summary.
    pub fn trace_summary(&self) -> String {
        self.session.lock().trace().as_str().to_string()
    }

    pub fn session(&self) -> RecoverySession {
        self.session.lock().clone()
    }

    /// Request cancellation. Has no effect once the session ended.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the session to end.
    pub async fn wait(&self) -> RecoveryOutcome {
        let mut rx = self.outcome.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(outcome) = current {
                return outcome;
            }
            if rx.changed().await.is_err() {
                let last = rx.borrow().clone();
                return last.unwrap_or(RecoveryOutcome::Failed {
                    reason: "recovery task stopped".to_string(),
                });
            }
        }
    }
}

/// The seams a recovery talks through.
#[derive(Clone)]
pub struct RecoveryServices {
    pub source: Arc<dyn RecoverySource>,
    pub target: Arc<dyn RecoveryTarget>,
    pub reporter: Arc<dyn ShardStateReporter>,
    pub mapping: Arc<dyn MappingUpdatePerformer>,
}

/// Starts, tracks and cancels the recoveries of one node.
pub struct RecoveryCoordinator {
    local_node: NodeId,
    config: RecoveryConfig,
    clock: Arc<dyn Clock>,
    store: Arc<ClusterStateStore>,
    services: RecoveryServices,
    permits: Arc<Semaphore>,
    sessions: Mutex<HashMap<(ShardId, u64), RecoverySessionHandle>>,
    next_recovery_id: AtomicU64,
}

impl RecoveryCoordinator {
    pub fn new(
        local_node: impl Into<NodeId>,
        config: RecoveryConfig,
        clock: Arc<dyn Clock>,
        store: Arc<ClusterStateStore>,
        services: RecoveryServices,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_recoveries.max(1)));
        Self {
            local_node: local_node.into(),
            config,
            clock,
            store,
            services,
            permits,
            sessions: Mutex::new(HashMap::new()),
            next_recovery_id: AtomicU64::new(1),
        }
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    /// Handles of the sessions still running.
    pub fn sessions(&self) -> Vec<RecoverySessionHandle> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn session(&self, shard: &ShardId, allocation_id: u64) -> Option<RecoverySessionHandle> {
        self.sessions.lock().get(&(shard.clone(), allocation_id)).cloned()
    }

    /// Open a recovery for an INITIALIZING copy assigned to this node.
    ///
    /// `source` is the node to copy from; `None` recovers a primary from an
    /// empty store. Starting a copy that is already recovering returns the
    /// running session.
    pub fn start_recovery(
        self: &Arc<Self>,
        routing: ShardRouting,
        source: Option<DiscoveryNode>,
    ) -> Result<RecoverySessionHandle> {
        let allocation_id = routing
            .allocation_id
            .ok_or_else(|| MeridianError::InvalidState(format!("{} has no allocation id", routing.shard_id)))?;
        if routing.node_id.as_deref() != Some(self.local_node.as_str()) {
            return Err(MeridianError::InvalidState(format!(
                "{} is not assigned to {}",
                routing.shard_id, self.local_node
            )));
        }

        let key = (routing.shard_id.clone(), allocation_id);
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(&key) {
            return Ok(existing.clone());
        }

        let recovery_id = self.next_recovery_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Mutex::new(RecoverySession::new(
            recovery_id,
            routing.shard_id.clone(),
            allocation_id,
            source.as_ref().map(|n| n.id.clone()),
            self.local_node.clone(),
            self.clock.now_millis(),
        )));
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let handle = RecoverySessionHandle {
            recovery_id,
            shard_id: routing.shard_id.clone(),
            allocation_id,
            session: session.clone(),
            cancel: Arc::new(cancel_tx),
            outcome: outcome_rx,
        };
        sessions.insert(key, handle.clone());
        observability::update_active_recoveries(sessions.len());
        drop(sessions);

        info!(
            shard = %routing.shard_id,
            allocation_id,
            recovery_id,
            source = source.as_ref().map(|n| n.id.as_str()).unwrap_or("<empty store>"),
            "Starting shard recovery"
        );

        let this = self.clone();
        tokio::spawn(async move {
            this.run_session(routing, source, session, cancel_rx, outcome_tx)
                .await;
        });
        Ok(handle)
    }

    /// React to a newly applied cluster state.
    pub fn apply_cluster_state(self: &Arc<Self>, previous: &ClusterState, current: &ClusterState) {
        let stale: Vec<RecoverySessionHandle> = self
            .sessions
            .lock()
            .values()
            .filter(|h| !current.has_initializing_copy(&self.local_node, &h.shard_id, h.allocation_id))
            .cloned()
            .collect();
        for handle in stale {
            info!(
                shard = %handle.shard_id,
                allocation_id = handle.allocation_id,
                version = current.version,
                "Shard copy reassigned, cancelling recovery"
            );
            handle.cancel();
        }

        let changes = RoutingChanges::between(previous, current);
        for routing in changes.initializing_on(&self.local_node) {
            let started = recovery_source(current, routing)
                .and_then(|source| self.start_recovery(routing.clone(), source));
            if let Err(e) = started {
                warn!(shard = %routing.shard_id, error = %e, "Cannot start recovery");
            }
        }
    }

    /// Follow the local cluster state until shutdown, then cancel whatever is
    /// still running.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownCoordinator) {
        let mut rx = self.store.subscribe();
        let cluster_name = rx.borrow().cluster_name.clone();
        let mut previous = Arc::new(ClusterState::empty(cluster_name));
        info!(node = %self.local_node, "Recovery coordinator started");

        loop {
            let current = rx.borrow_and_update().clone();
            self.apply_cluster_state(&previous, &current);
            previous = current;

            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown.wait_for_shutdown() => break,
            }
        }

        for handle in self.sessions() {
            handle.cancel();
        }
        info!(node = %self.local_node, "Recovery coordinator stopped");
    }

    async fn run_session(
        self: Arc<Self>,
        routing: ShardRouting,
        source: Option<DiscoveryNode>,
        session: SharedSession,
        mut cancel_rx: watch::Receiver<bool>,
        outcome_tx: watch::Sender<Option<RecoveryOutcome>>,
    ) {
        let shard = routing.shard_id.clone();
        let recovery_id = session.lock().recovery_id;
        let started = Instant::now();

        let cancelled = async move {
            loop {
                if *cancel_rx.borrow_and_update() {
                    return;
                }
                if cancel_rx.changed().await.is_err() {
                    futures::future::pending::<()>().await;
                }
            }
        };

        let result = tokio::select! {
            result = self.recover(&routing, source.as_ref(), &session, started) => result,
            _ = cancelled => Err(MeridianError::RecoveryCancelled(shard.to_string())),
        };

        let outcome = match result {
            Ok(response) => {
                info!(
                    shard = %shard,
                    took_ms = response.took_millis,
                    "{} recovery completed in {}ms",
                    shard,
                    response.took_millis
                );
                if let Some(trace) = &response.trace_summary {
                    debug!(shard = %shard, trace = %trace, "Recovery trace");
                }
                let reporter = &self.services.reporter;
                if let Err(e) = self
                    .report(&shard, "shard-started", || reporter.shard_started(&routing, "after recovery"))
                    .await
                {
                    warn!(shard = %shard, error = %e, "Failed to report started shard");
                }
                RecoveryOutcome::Done(response)
            }
            Err(MeridianError::RecoveryCancelled(_)) => {
                {
                    let mut session = session.lock();
                    if session.fail("cancelled") {
                        session.append_trace("recovery cancelled");
                    }
                }
                self.release(&shard, recovery_id).await;
                info!(shard = %shard, "Recovery cancelled");
                RecoveryOutcome::Cancelled
            }
            Err(e) => {
                let reason = e.to_string();
                session.lock().fail(reason.clone());
                self.release(&shard, recovery_id).await;
                warn!(shard = %shard, error = %e, "Recovery failed");
                let reporter = &self.services.reporter;
                if let Err(report) = self
                    .report(&shard, "shard-failed", || reporter.shard_failed(&routing, &reason))
                    .await
                {
                    warn!(shard = %shard, error = %report, "Failed to report failed shard");
                }
                RecoveryOutcome::Failed { reason }
            }
        };

        observability::record_recovery(outcome.label(), started.elapsed().as_millis() as u64);
        let key = (shard, session.lock().allocation_id);
        let remaining = {
            let mut sessions = self.sessions.lock();
            sessions.remove(&key);
            sessions.len()
        };
        observability::update_active_recoveries(remaining);
        let _ = outcome_tx.send(Some(outcome));
    }

    /// Deliver a shard state report to the master. Transient failures and a
    /// master change are retried with the recovery backoff.
    async fn report<F, Fut>(&self, shard: &ShardId, kind: &'static str, mut send: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let executor = RetryExecutor::new(RetryConfig::for_recovery(&self.config));
        let timeout = self.config.phase_timeout;
        executor
            .execute_when(
                || {
                    let attempt = send();
                    async move {
                        tokio::time::timeout(timeout, attempt)
                            .await
                            .unwrap_or(Err(MeridianError::Timeout(timeout.as_millis() as u64)))
                    }
                },
                |e| e.is_retryable() || e.is_not_master(),
                |attempt, error| {
                    debug!(shard = %shard, report = kind, attempt, error = %error, "Shard state report failed");
                },
            )
            .await
    }

    async fn release(&self, shard: &ShardId, recovery_id: u64) {
        if let Err(e) = self.services.target.clean_files(shard, recovery_id).await {
            warn!(shard = %shard, error = %e, "Failed to release partial files");
        }
    }

    async fn recover(
        &self,
        routing: &ShardRouting,
        source: Option<&DiscoveryNode>,
        session: &SharedSession,
        started: Instant,
    ) -> Result<RecoveryResponse> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| MeridianError::Shutdown)?;
        let shard = &routing.shard_id;
        let mut response = RecoveryResponse {
            start_time_millis: session.lock().start_time_millis,
            ..Default::default()
        };

        session.lock().transition(RecoveryPhase::FileCopy)?;
        match source {
            None => {
                self.run_phase(session, RecoveryPhase::FileCopy, || self.services.target.create_empty(shard))
                    .await?;
                let mut session = session.lock();
                session.append_trace("recovered from empty store");
                session.on_files_received(0, 0)?;
                session.on_translog_ops_received(0)?;
            }
            Some(node) => {
                let request = {
                    let session = session.lock();
                    StartRecoveryRequest {
                        recovery_id: session.recovery_id,
                        shard_id: shard.clone(),
                        source_node: node.id.clone(),
                        target_node: self.local_node.clone(),
                        allocation_id: session.allocation_id,
                        primary: routing.primary,
                    }
                };

                let (names, bytes) = self
                    .run_phase(session, RecoveryPhase::FileCopy, || self.copy_files(&request))
                    .await?;
                {
                    let mut session = session.lock();
                    session.append_trace(format!("phase1: copied {} files, {} bytes from {}", names.len(), bytes, node.id));
                    session.on_files_received(names.len(), bytes)?;
                }
                response.phase1_file_names = names;
                response.phase1_total_bytes = bytes;

                let operations = self
                    .run_phase(session, RecoveryPhase::TranslogReplay, || {
                        self.replay_translog(&request, session)
                    })
                    .await?;
                {
                    let mut session = session.lock();
                    session.append_trace(format!("phase2: replayed {} operations", operations));
                    session.on_translog_ops_received(operations)?;
                }
                response.phase2_operations = operations;

                self.run_phase(session, RecoveryPhase::Finalize, || self.services.source.finalize(&request))
                    .await?;
            }
        }

        self.run_phase(session, RecoveryPhase::Finalize, || self.services.target.finalize(shard))
            .await?;

        let mut session = session.lock();
        session.transition(RecoveryPhase::Done)?;
        response.took_millis = started.elapsed().as_millis() as u64;
        if !session.trace().is_empty() {
            response.trace_summary = Some(session.trace().as_str().to_string());
        }
        Ok(response)
    }

    /// Run one phase step with a timeout per attempt, retrying transient
    /// failures and tracing every failed attempt.
    async fn run_phase<T, F, Fut>(&self, session: &SharedSession, phase: RecoveryPhase, mut step: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let executor = RetryExecutor::new(RetryConfig::for_recovery(&self.config));
        let max_attempts = executor.config().max_attempts;
        let timeout = self.config.phase_timeout;

        executor
            .execute_observed(
                || {
                    let attempt = step();
                    async move {
                        match tokio::time::timeout(timeout, attempt).await {
                            Ok(result) => result,
                            Err(_) => Err(MeridianError::Timeout(timeout.as_millis() as u64)),
                        }
                    }
                },
                |attempt, error| {
                    let mut session = session.lock();
                    session.append_trace(format!(
                        "{} attempt {}/{} failed: {}",
                        phase, attempt, max_attempts, error
                    ));
                    debug!(
                        shard = %session.shard_id,
                        phase = %phase,
                        attempt,
                        error = %error,
                        "Recovery phase attempt failed"
                    );
                    observability::record_recovery_retry(phase.as_str());
                },
            )
            .await
    }

    /// Copy every file of the source in chunks. Returns the file names and
    /// the number of bytes copied.
    async fn copy_files(&self, request: &StartRecoveryRequest) -> Result<(Vec<String>, u64)> {
        let info = self.services.source.start_recovery(request).await?;
        let target = &self.services.target;
        let chunk_size = self.config.chunk_size.max(1);

        for file in &info.files {
            let mut offset = 0u64;
            loop {
                let chunk = self
                    .services
                    .source
                    .read_chunk(request, file, offset, chunk_size)
                    .await?;
                offset += chunk.data.len() as u64;
                target.write_chunk(&request.shard_id, &chunk).await?;
                if chunk.last_chunk {
                    break;
                }
                if chunk.data.is_empty() {
                    return Err(MeridianError::RecoveryFailed {
                        shard: request.shard_id.to_string(),
                        reason: format!("source returned an empty chunk for {} at {}", file.name, offset),
                    });
                }
            }
            target.finish_file(&request.shard_id, request.recovery_id, file).await?;
        }

        let total = info.total_bytes();
        Ok((info.files.into_iter().map(|f| f.name).collect(), total))
    }

    /// Fetch and apply the source's translog, making sure the master knows
    /// about every field the operations use first.
    async fn replay_translog(&self, request: &StartRecoveryRequest, session: &SharedSession) -> Result<usize> {
        let batch = self.services.source.translog_operations(request).await?;

        let mut fields = BTreeMap::new();
        for op in &batch.operations {
            for (name, kind) in &op.fields {
                fields.entry(name.clone()).or_insert_with(|| kind.clone());
            }
        }
        if let Some(update) = self.mapping_update(&request.shard_id, &fields)? {
            self.ensure_mapping(&update, &request.shard_id, session).await?;
        }

        self.services
            .target
            .apply_operations(&request.shard_id, &batch.operations)
            .await?;
        Ok(batch.operations.len())
    }

    fn mapping_update(&self, shard: &ShardId, fields: &BTreeMap<String, String>) -> Result<Option<MappingUpdate>> {
        if fields.is_empty() {
            return Ok(None);
        }
        let state = self.store.current();
        let meta = state
            .index(&shard.index)
            .ok_or_else(|| MeridianError::IndexNotFound(shard.index.clone()))?;
        let missing = meta.mapping.missing_fields(fields);
        if missing.is_empty() {
            return Ok(None);
        }
        Ok(Some(MappingUpdate {
            index: shard.index.clone(),
            fields: missing,
        }))
    }

    /// Apply and verify a mapping update, retrying while the master reports
    /// it is not visible yet.
    async fn ensure_mapping(&self, update: &MappingUpdate, shard: &ShardId, session: &SharedSession) -> Result<()> {
        let attempts = self.config.mapping_retries.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            let result = match self.services.mapping.update_mappings(update, shard).await {
                Ok(()) => self.services.mapping.verify_mappings(update, shard).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    session
                        .lock()
                        .append_trace(format!("mapping update with {} fields acknowledged", update.fields.len()));
                    return Ok(());
                }
                Err(e @ MeridianError::RetryOnPrimary(_)) => {
                    session
                        .lock()
                        .append_trace(format!("mapping update attempt {}/{}: {}", attempt, attempts, e));
                    debug!(shard = %shard, attempt, error = %e, "Mapping not visible yet");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_backoff).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| MeridianError::Internal("mapping retries exhausted".to_string())))
    }
}

/// Where a copy initializing in `state` recovers from.
///
/// A relocation target copies from the relocating node, a replica from the
/// active primary. Only the primary of a shard that never started has no
/// source: it starts from an empty store.
pub fn recovery_source(state: &ClusterState, routing: &ShardRouting) -> Result<Option<DiscoveryNode>> {
    let source_id = if routing.is_relocation_target() {
        routing.relocating_node_id.clone()
    } else if routing.recovers_from_empty_store() {
        None
    } else if routing.primary {
        return Err(MeridianError::RecoveryFailed {
            shard: routing.shard_id.to_string(),
            reason: "primary has no copy to recover from".to_string(),
        });
    } else {
        let primary = state
            .routing_table
            .primary(&routing.shard_id)
            .filter(|p| p.active())
            .ok_or_else(|| MeridianError::InvalidState(format!("{} has no active primary", routing.shard_id)))?;
        primary.node_id.clone()
    };

    match source_id {
        None => Ok(None),
        Some(id) => state
            .node(&id)
            .cloned()
            .map(Some)
            .ok_or(MeridianError::NodeNotFound(id)),
    }
}
