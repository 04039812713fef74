//! Sequential batch application with per-task isolation.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, warn};

use super::listener::panic_message;
use super::task::{StateTransform, Task, TaskContext};
use crate::error::{MeridianError, Result};
use crate::state::ClusterState;

/// Result of applying a batch to a base state.
#[derive(Debug)]
pub struct BatchResult {
    /// The resulting state. Equal to the base when nothing changed.
    pub state: ClusterState,
    /// One entry per task, in batch order.
    pub results: Vec<Result<()>>,
    pub changed: bool,
    pub rerouted: bool,
}

impl BatchResult {
    pub fn successes(&self) -> usize {
        self.results.iter().filter(|r| r.is_ok()).count()
    }
}

/// Applies task transforms one after another against an accumulating state.
pub struct ClusterStateTaskExecutor {
    ctx: TaskContext,
    reroute: Arc<dyn StateTransform>,
}

impl ClusterStateTaskExecutor {
    pub fn new(ctx: TaskContext, reroute: Arc<dyn StateTransform>) -> Self {
        Self { ctx, reroute }
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    /// Apply `tasks` to `base`.
    ///
    /// A failing or panicking transform records its error and leaves the
    /// accumulated state as it was before that task. If any successful task
    /// asked for it, shard allocation runs once at the end; `rerouted` is set
    /// only when that run succeeded. A changed result carries version
    /// `base.version + 1`.
    pub fn execute_batch(&self, base: &ClusterState, tasks: &[Task]) -> BatchResult {
        let mut state = base.clone();
        let mut results = Vec::with_capacity(tasks.len());
        let mut reroute = false;

        for task in tasks {
            match self.apply_isolated(task.transform.as_ref(), &state) {
                Ok(next) => {
                    state = next;
                    reroute |= task.requires_reroute;
                    results.push(Ok(()));
                }
                Err(e) => {
                    debug!(source = %task.source, error = %e, "Task failed");
                    results.push(Err(e));
                }
            }
        }

        let mut rerouted = false;
        if reroute {
            match self.apply_isolated(self.reroute.as_ref(), &state) {
                Ok(next) => {
                    state = next;
                    rerouted = true;
                }
                Err(e) => warn!(error = %e, "Reroute failed, keeping batch result without allocation"),
            }
        }

        let changed = !state.same_content(base);
        if changed {
            state.version = base.version + 1;
        } else {
            state = base.clone();
        }

        BatchResult {
            state,
            results,
            changed,
            rerouted,
        }
    }

    fn apply_isolated(&self, transform: &dyn StateTransform, state: &ClusterState) -> Result<ClusterState> {
        catch_unwind(AssertUnwindSafe(|| transform.apply(state, &self.ctx)))
            .unwrap_or_else(|panic| Err(MeridianError::TaskPanicked(panic_message(panic.as_ref()))))
    }
}
