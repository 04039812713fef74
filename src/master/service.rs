//! The master service: pull, execute, commit, publish, notify.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::executor::ClusterStateTaskExecutor;
use super::listener::ListenerDispatch;
use super::queue::TaskQueue;
use super::task::{Task, TaskContext, TaskHandle, TaskListener, TaskOutcome};
use crate::config::{MasterConfig, PublicationFailurePolicy, PublishConfig};
use crate::error::{MeridianError, Result};
use crate::observability;
use crate::publish::{Committed, Publisher};
use crate::resilience::{RetryConfig, RetryExecutor};
use crate::shutdown::ShutdownCoordinator;
use crate::state::{ClusterState, ClusterStateStore, RoutingChanges};
use crate::types::{NodeId, Priority};

/// Phase of the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundPhase {
    Idle,
    Draining,
    Executing,
    Committing,
    Publishing,
    NotMaster,
}

/// Whether this node currently acts as master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mastership {
    Master { term: u64 },
    NotMaster { known_master: Option<NodeId> },
}

impl Mastership {
    pub fn is_master(&self) -> bool {
        matches!(self, Mastership::Master { .. })
    }
}

/// Summary of one processed batch.
#[derive(Debug, Clone)]
pub struct RoundReport {
    pub topic: String,
    pub tasks: usize,
    pub failed: usize,
    /// Committed version, if the batch changed the state.
    pub committed_version: Option<u64>,
    pub published: bool,
}

/// Batches submitted tasks and drives them through execution, commit and
/// publication. One round runs at a time; submissions queue behind it.
pub struct MasterService {
    local_node: NodeId,
    config: MasterConfig,
    publish_config: PublishConfig,
    store: Arc<ClusterStateStore>,
    publisher: Publisher,
    executor: ClusterStateTaskExecutor,
    dispatch: ListenerDispatch,
    queue: Mutex<TaskQueue>,
    notify: Notify,
    mastership: RwLock<Mastership>,
    phase: RwLock<RoundPhase>,
    round_lock: tokio::sync::Mutex<()>,
}

impl MasterService {
    pub fn new(
        ctx: TaskContext,
        config: MasterConfig,
        publish_config: PublishConfig,
        store: Arc<ClusterStateStore>,
        publisher: Publisher,
        reroute: Arc<dyn super::task::StateTransform>,
    ) -> Self {
        Self {
            local_node: ctx.local_node.clone(),
            config,
            publish_config,
            store,
            publisher,
            executor: ClusterStateTaskExecutor::new(ctx, reroute),
            dispatch: ListenerDispatch,
            queue: Mutex::new(TaskQueue::new()),
            notify: Notify::new(),
            mastership: RwLock::new(Mastership::NotMaster { known_master: None }),
            phase: RwLock::new(RoundPhase::NotMaster),
            round_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn local_node(&self) -> &str {
        &self.local_node
    }

    pub fn store(&self) -> &Arc<ClusterStateStore> {
        &self.store
    }

    pub fn publisher(&self) -> &Publisher {
        &self.publisher
    }

    pub fn mastership(&self) -> Mastership {
        self.mastership.read().clone()
    }

    pub fn is_master(&self) -> bool {
        self.mastership.read().is_master()
    }

    pub fn phase(&self) -> RoundPhase {
        *self.phase.read()
    }

    pub fn pending_tasks(&self) -> usize {
        self.queue.lock().len()
    }

    /// Start acting as master for `term`.
    pub fn become_master(&self, term: u64) {
        *self.mastership.write() = Mastership::Master { term };
        *self.phase.write() = RoundPhase::Idle;
        info!(node = %self.local_node, term, "Elected as master");
        self.notify.notify_one();
    }

    /// Stop acting as master. Every pending task is rejected.
    pub fn step_down(&self, known_master: Option<NodeId>) {
        {
            let mut mastership = self.mastership.write();
            if mastership.is_master() {
                warn!(node = %self.local_node, known_master = ?known_master, "Stepping down as master");
            }
            *mastership = Mastership::NotMaster { known_master };
        }
        *self.phase.write() = RoundPhase::NotMaster;

        let pending = self.queue.lock().drain_all();
        self.dispatch.notify_all(pending.into_iter().map(|q| {
            let outcome = TaskOutcome::NoLongerMaster {
                source: q.task.source.clone(),
            };
            (q.listener, outcome)
        }));
    }

    /// Submit a task built from a transform closure.
    pub fn submit<F>(&self, topic: &str, source: &str, priority: Priority, transform: F) -> TaskHandle
    where
        F: Fn(&ClusterState, &TaskContext) -> Result<ClusterState> + Send + Sync + 'static,
    {
        self.submit_task(topic, Task::new(source, priority, transform))
    }

    /// Submit a task and get a handle to its outcome.
    pub fn submit_task(&self, topic: &str, task: Task) -> TaskHandle {
        let (listener, handle) = TaskListener::channel();
        self.submit_with_listener(topic, task, listener);
        handle
    }

    /// Submit a task with an explicit listener.
    ///
    /// On a node that is not master the listener is notified with
    /// `NoLongerMaster` before this returns.
    pub fn submit_with_listener(&self, topic: &str, task: Task, listener: TaskListener) {
        observability::record_task_submitted(&task.priority.to_string());

        {
            // Mastership is checked under the queue lock so that a concurrent
            // step-down either sees this task in its drain or this check fails.
            let mut queue = self.queue.lock();
            if self.is_master() {
                debug!(topic, source = %task.source, priority = %task.priority, "Task queued");
                queue.push(topic, task, listener);
                drop(queue);
                self.notify.notify_one();
                return;
            }
        }

        self.dispatch.notify(
            listener,
            TaskOutcome::NoLongerMaster {
                source: task.source,
            },
        );
    }

    /// Run rounds until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: ShutdownCoordinator) {
        info!(node = %self.local_node, "Master service started");
        loop {
            while self.run_round().await.is_some() {}

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.wait_for_shutdown() => break,
            }
        }

        let pending = self.queue.lock().drain_all();
        self.dispatch.notify_all(pending.into_iter().map(|q| {
            let outcome = TaskOutcome::Failed {
                source: q.task.source.clone(),
                error: MeridianError::Shutdown,
            };
            (q.listener, outcome)
        }));
        info!(node = %self.local_node, "Master service stopped");
    }

    /// Process one batch, if there is one.
    pub async fn run_round(&self) -> Option<RoundReport> {
        let _round = self.round_lock.lock().await;

        if !self.is_master() {
            return None;
        }

        self.set_phase(RoundPhase::Draining);
        let batch = match self.queue.lock().next_batch(self.config.max_batch_size) {
            Some(batch) => batch,
            None => {
                self.set_phase(RoundPhase::Idle);
                return None;
            }
        };
        let topic = batch.topic.clone();
        let (tasks, listeners) = batch.split();

        self.set_phase(RoundPhase::Executing);
        let base = self.store.current();
        let started = Instant::now();
        let result = self.executor.execute_batch(&base, &tasks);
        observability::record_batch(
            tasks.len(),
            started.elapsed().as_secs_f64() * 1000.0,
            result.changed,
        );
        debug!(
            topic = %topic,
            tasks = tasks.len(),
            succeeded = result.successes(),
            changed = result.changed,
            "Batch executed"
        );

        let mut report = RoundReport {
            topic,
            tasks: tasks.len(),
            failed: tasks.len() - result.successes(),
            committed_version: None,
            published: false,
        };

        if !result.changed {
            self.notify_batch(listeners, result.results, &base, &base);
            self.set_phase(RoundPhase::Idle);
            return Some(report);
        }

        self.set_phase(RoundPhase::Committing);
        let new_state = match self.store.commit(result.state) {
            Ok(state) => state,
            Err(e) => {
                error!(error = %e, "Commit lost to a newer cluster state");
                let known_master = self.store.current().master_node.clone();
                self.dispatch.notify_all(listeners.into_iter().map(|(source, listener)| {
                    (listener, TaskOutcome::NoLongerMaster { source })
                }));
                self.step_down(known_master);
                return Some(report);
            }
        };
        report.committed_version = Some(new_state.version);
        self.log_routing_changes(&base, &new_state);

        self.set_phase(RoundPhase::Publishing);
        match self.publish_with_policy(&new_state, &base).await {
            Ok(_) => {
                report.published = true;
                self.notify_batch(listeners, result.results, &base, &new_state);
                self.set_phase(RoundPhase::Idle);
            }
            Err(e) => {
                self.dispatch.notify_all(
                    listeners
                        .into_iter()
                        .zip(result.results)
                        .map(|((source, listener), r)| {
                            let error = match r {
                                Ok(()) => e.clone(),
                                Err(task_error) => task_error,
                            };
                            (listener, TaskOutcome::Failed { source, error })
                        }),
                );
                self.step_down(None);
            }
        }

        Some(report)
    }

    async fn publish_with_policy(
        &self,
        state: &Arc<ClusterState>,
        previous: &ClusterState,
    ) -> Result<Committed> {
        let required = self.publish_config.required_acks.required(state.nodes.len());
        let timeout = self.publish_config.timeout;

        let attempts = match self.config.publication_failure {
            PublicationFailurePolicy::StepDown => 1,
            PublicationFailurePolicy::Retry { max_attempts } => max_attempts,
        };
        let retry = RetryExecutor::new(RetryConfig::fixed(attempts, self.config.republish_backoff));
        retry
            .execute_observed(
                || self.publisher.publish(state.clone(), previous, required, timeout),
                |attempt, e| {
                    if attempt < attempts {
                        warn!(version = state.version, attempt, error = %e, "Republishing cluster state");
                    }
                },
            )
            .await
    }

    fn notify_batch(
        &self,
        listeners: Vec<(String, TaskListener)>,
        results: Vec<Result<()>>,
        old_state: &Arc<ClusterState>,
        new_state: &Arc<ClusterState>,
    ) {
        self.dispatch.notify_all(listeners.into_iter().zip(results).map(
            |((source, listener), result)| {
                let outcome = match result {
                    Ok(()) => TaskOutcome::Processed {
                        source,
                        old_state: old_state.clone(),
                        new_state: new_state.clone(),
                    },
                    Err(error) => TaskOutcome::Failed { source, error },
                };
                (listener, outcome)
            },
        ));
    }

    fn log_routing_changes(&self, old: &ClusterState, new: &ClusterState) {
        observability::update_cluster_metrics(
            new.nodes.len(),
            new.metadata.indices.len(),
            new.routing_table.all_shards().count(),
        );
        let changes = RoutingChanges::between(old, new);
        if !changes.is_empty() {
            info!(
                version = new.version,
                initializing = changes.initializing.len(),
                started = changes.started.len(),
                removed = changes.removed.len(),
                "Routing table changed"
            );
        }
    }

    fn set_phase(&self, phase: RoundPhase) {
        *self.phase.write() = phase;
    }
}
