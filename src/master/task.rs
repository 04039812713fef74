//! Cluster-state tasks and their outcomes.

use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;

use crate::error::{MeridianError, Result};
use crate::state::ClusterState;
use crate::types::{Clock, NodeId, Priority};

/// Capabilities handed to a transform.
///
/// Time is only available through the clock so that re-executing a batch
/// against the same base state is deterministic.
#[derive(Clone)]
pub struct TaskContext {
    pub clock: Arc<dyn Clock>,
    pub local_node: NodeId,
}

impl TaskContext {
    pub fn new(local_node: impl Into<NodeId>, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            local_node: local_node.into(),
        }
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

/// A pure function from one cluster state to the next.
///
/// Implementations clone the input, modify the copy and return it; the
/// version field is managed by the executor.
pub trait StateTransform: Send + Sync {
    fn apply(&self, state: &ClusterState, ctx: &TaskContext) -> Result<ClusterState>;
}

impl<F> StateTransform for F
where
    F: Fn(&ClusterState, &TaskContext) -> Result<ClusterState> + Send + Sync,
{
    fn apply(&self, state: &ClusterState, ctx: &TaskContext) -> Result<ClusterState> {
        self(state, ctx)
    }
}

/// A named unit of work against the cluster state.
#[derive(Clone)]
pub struct Task {
    pub source: String,
    pub priority: Priority,
    pub transform: Arc<dyn StateTransform>,
    /// Run shard allocation once the batch is applied.
    pub requires_reroute: bool,
}

impl Task {
    pub fn new<F>(source: impl Into<String>, priority: Priority, transform: F) -> Self
    where
        F: Fn(&ClusterState, &TaskContext) -> Result<ClusterState> + Send + Sync + 'static,
    {
        Self::with_transform(source, priority, Arc::new(transform))
    }

    pub fn with_transform(
        source: impl Into<String>,
        priority: Priority,
        transform: Arc<dyn StateTransform>,
    ) -> Self {
        Self {
            source: source.into(),
            priority,
            transform,
            requires_reroute: false,
        }
    }

    pub fn with_reroute(mut self) -> Self {
        self.requires_reroute = true;
        self
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("source", &self.source)
            .field("priority", &self.priority)
            .field("requires_reroute", &self.requires_reroute)
            .finish()
    }
}

/// Terminal outcome of a task. Each task gets exactly one.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// The task was applied and the resulting state reached its quorum.
    Processed {
        source: String,
        old_state: Arc<ClusterState>,
        new_state: Arc<ClusterState>,
    },
    /// The task's transform failed, or the publication of its batch failed.
    Failed { source: String, error: MeridianError },
    /// The node stopped being master before the task completed.
    NoLongerMaster { source: String },
}

impl TaskOutcome {
    pub fn source(&self) -> &str {
        match self {
            TaskOutcome::Processed { source, .. }
            | TaskOutcome::Failed { source, .. }
            | TaskOutcome::NoLongerMaster { source } => source,
        }
    }

    pub fn is_processed(&self) -> bool {
        matches!(self, TaskOutcome::Processed { .. })
    }

    /// Label used in metrics.
    pub fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Processed { .. } => "processed",
            TaskOutcome::Failed { .. } => "failed",
            TaskOutcome::NoLongerMaster { .. } => "no_longer_master",
        }
    }

    /// The resulting state, or the error that prevented it.
    pub fn into_result(self) -> Result<Arc<ClusterState>> {
        match self {
            TaskOutcome::Processed { new_state, .. } => Ok(new_state),
            TaskOutcome::Failed { error, .. } => Err(error),
            TaskOutcome::NoLongerMaster { .. } => Err(MeridianError::NotMaster { master: None }),
        }
    }
}

/// Receiver of a task's terminal outcome.
pub enum TaskListener {
    /// Backs a [`TaskHandle`].
    Channel(oneshot::Sender<TaskOutcome>),
    /// Invoked on the master service's loop; panics are caught.
    Callback(Box<dyn FnOnce(TaskOutcome) + Send>),
}

impl TaskListener {
    /// A listener paired with the handle that observes it.
    pub fn channel() -> (Self, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        (TaskListener::Channel(tx), TaskHandle { rx })
    }

    pub fn callback(f: impl FnOnce(TaskOutcome) + Send + 'static) -> Self {
        TaskListener::Callback(Box::new(f))
    }
}

impl fmt::Debug for TaskListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskListener::Channel(_) => write!(f, "TaskListener::Channel"),
            TaskListener::Callback(_) => write!(f, "TaskListener::Callback"),
        }
    }
}

/// Future side of a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    rx: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    /// Wait for the terminal outcome.
    pub async fn outcome(self) -> TaskOutcome {
        self.rx.await.unwrap_or_else(|_| TaskOutcome::Failed {
            source: "unknown".to_string(),
            error: MeridianError::Shutdown,
        })
    }

    /// Wait for the outcome and turn it into the resulting state.
    pub async fn result(self) -> Result<Arc<ClusterState>> {
        self.outcome().await.into_result()
    }
}
