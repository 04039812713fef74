//! Holder of the latest committed cluster state.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::cluster_state::ClusterState;
use crate::error::{MeridianError, Result};
use crate::observability;

/// Current cluster state of one node plus compare-and-swap commit.
///
/// Readers get an `Arc` snapshot and never block writers. Every successful
/// commit or install is broadcast to subscribers.
pub struct ClusterStateStore {
    tx: watch::Sender<Arc<ClusterState>>,
}

impl ClusterStateStore {
    pub fn new(initial: ClusterState) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    /// Latest committed state.
    pub fn current(&self) -> Arc<ClusterState> {
        self.tx.borrow().clone()
    }

    /// Commit `candidate` if it is the direct successor of the current state.
    ///
    /// On failure the store is left untouched.
    pub fn commit(&self, candidate: ClusterState) -> Result<Arc<ClusterState>> {
        self.swap(Arc::new(candidate), |current, candidate| candidate == current + 1)
    }

    /// Install a state received from the master. Any strictly newer version
    /// is accepted.
    pub fn install(&self, state: Arc<ClusterState>) -> Result<Arc<ClusterState>> {
        self.swap(state, |current, candidate| candidate > current)
    }

    /// Receiver notified on every commit or install.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.tx.subscribe()
    }

    fn swap(
        &self,
        candidate: Arc<ClusterState>,
        accept: impl FnOnce(u64, u64) -> bool,
    ) -> Result<Arc<ClusterState>> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|current| {
            if !accept(current.version, candidate.version) {
                outcome = Err(MeridianError::StaleVersion {
                    current: current.version,
                    candidate: candidate.version,
                });
                return false;
            }
            *current = candidate.clone();
            true
        });
        outcome?;

        debug!(version = candidate.version, "Cluster state applied to store");
        observability::record_state_version(candidate.version);
        Ok(candidate)
    }
}
