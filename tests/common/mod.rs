//! Common test utilities for integration tests.

pub mod cluster_sim;
pub mod fixtures;

use std::future::Future;
use std::time::{Duration, Instant};

pub use cluster_sim::*;
pub use fixtures::*;

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Await `future`, failing the test if it takes longer than `timeout`.
pub async fn within<T>(timeout: Duration, future: impl Future<Output = T>) -> T {
    tokio::time::timeout(timeout, future)
        .await
        .expect("operation timed out")
}
