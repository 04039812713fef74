//! Graceful shutdown of node services.
//!
//! A [`ShutdownCoordinator`] is cloned into every background loop (master
//! service, recovery coordinator, cluster state observers). Loops select on
//! [`ShutdownCoordinator::wait_for_shutdown`]; the owner then joins them
//! through [`ServiceSet`] under a deadline.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{MeridianError, Result};

const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Shutdown flag shared by all services of a node.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    flag: Arc<watch::Sender<bool>>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_SHUTDOWN_TIMEOUT)
    }

    /// `timeout` bounds how long [`ServiceSet::run`] waits for loops to stop.
    pub fn with_timeout(timeout: Duration) -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
            timeout,
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.flag.borrow()
    }

    /// Initiate shutdown. Only the first call has an effect.
    pub fn shutdown(&self) {
        let initiated = self.flag.send_if_modified(|down| !std::mem::replace(down, true));
        if initiated {
            info!("Initiating graceful shutdown");
        }
    }

    /// Resolves once shutdown has been initiated, including before the call.
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.flag.subscribe();
        // Cannot fail: `self` holds the sender.
        let _ = rx.wait_for(|down| *down).await;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Turns OS signals into a shutdown.
pub struct SignalHandler {
    coordinator: ShutdownCoordinator,
}

impl SignalHandler {
    pub fn new(coordinator: ShutdownCoordinator) -> Self {
        Self { coordinator }
    }

    /// Wait for SIGTERM, SIGINT or SIGQUIT, then initiate shutdown.
    #[cfg(unix)]
    pub async fn run(self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let install = |kind: SignalKind, name: &str| {
            signal(kind).map_err(|e| {
                MeridianError::Internal(format!("Failed to install {} handler: {}", name, e))
            })
        };
        let mut sigterm = install(SignalKind::terminate(), "SIGTERM")?;
        let mut sigint = install(SignalKind::interrupt(), "SIGINT")?;
        let mut sigquit = install(SignalKind::quit(), "SIGQUIT")?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
            _ = sigquit.recv() => info!("Received SIGQUIT"),
            _ = self.coordinator.wait_for_shutdown() => return Ok(()),
        }

        self.coordinator.shutdown();
        Ok(())
    }

    #[cfg(windows)]
    pub async fn run(self) -> Result<()> {
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.map_err(|e| MeridianError::Internal(format!("Failed to install Ctrl+C handler: {}", e)))?;
                info!("Received Ctrl+C");
            }
            _ = self.coordinator.wait_for_shutdown() => return Ok(()),
        }
        self.coordinator.shutdown();
        Ok(())
    }
}

/// Background loops of a node, joined on shutdown in reverse start order.
#[derive(Default)]
pub struct ServiceSet {
    services: Vec<(String, JoinHandle<()>)>,
}

impl ServiceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a spawned service loop.
    pub fn register(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        let name = name.into();
        info!(service = %name, "Service started");
        self.services.push((name, handle));
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Wait for shutdown, then join every service within the coordinator's
    /// timeout. Services still running at the deadline are aborted.
    pub async fn run(mut self, coordinator: &ShutdownCoordinator) {
        coordinator.wait_for_shutdown().await;
        info!(services = self.services.len(), "Stopping services");

        let deadline = tokio::time::Instant::now() + coordinator.timeout();
        while let Some((name, mut handle)) = self.services.pop() {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => info!(service = %name, "Service stopped"),
                Ok(Err(e)) => warn!(service = %name, error = %e, "Service ended abnormally"),
                Err(_) => {
                    error!(service = %name, "Service did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
    }
}
