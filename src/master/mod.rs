//! Master-side task processing.
//!
//! # Round lifecycle
//!
//! ```text
//! IDLE ──► DRAINING ──► EXECUTING ──► COMMITTING ──► PUBLISHING ──► IDLE
//!                                          │              │
//!                                          ▼              ▼
//!                                     NOT_MASTER ◄── (step down)
//! ```
//!
//! Callers submit [`Task`]s by topic. The [`MasterService`] takes the next
//! [`TaskBatch`] from the [`TaskQueue`], applies it through the
//! [`ClusterStateTaskExecutor`], commits the result to the local store,
//! publishes it and finally resolves one [`TaskOutcome`] per task.

pub mod executor;
pub mod listener;
pub mod queue;
pub mod service;
pub mod task;

pub use executor::{BatchResult, ClusterStateTaskExecutor};
pub use listener::ListenerDispatch;
pub use queue::{QueuedTask, TaskBatch, TaskQueue};
pub use service::{MasterService, Mastership, RoundPhase, RoundReport};
pub use task::{StateTransform, Task, TaskContext, TaskHandle, TaskListener, TaskOutcome};
