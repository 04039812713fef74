//! Core type definitions for Meridian.
//!
//! # Key Types
//!
//! - [`NodeId`]: identifier of a cluster node
//! - [`ShardId`]: an `(index, shard number)` pair, displayed as `[index][shard]`
//! - [`Priority`]: scheduling priority of cluster-state tasks
//! - [`Clock`]: the only time source available to task transforms
//! - [`WireMessage`]: bincode encoding shared by every message crossing nodes
//!
//! # Examples
//!
//! ```rust
//! use meridian::types::{ShardId, Priority};
//!
//! let shard = ShardId::new("logs", 2);
//! assert_eq!(shard.to_string(), "[logs][2]");
//! assert!(Priority::Urgent > Priority::Normal);
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;

/// Unique identifier for a node in the cluster.
pub type NodeId = String;

/// Cluster state version number.
pub type Version = u64;

/// Identifier of a single shard of an index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    /// Index name.
    pub index: String,
    /// Shard number within the index.
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl std::fmt::Display for ShardId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Priority of a cluster-state task. Higher priorities are drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Languid,
    Low,
    Normal,
    High,
    Urgent,
    Immediate,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Languid => write!(f, "languid"),
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
            Priority::Urgent => write!(f, "urgent"),
            Priority::Immediate => write!(f, "immediate"),
        }
    }
}

/// Time source injected into task transforms and recovery sessions.
///
/// Transforms must not read the wall clock directly; re-executing a batch
/// against the same base state with the same clock reading is deterministic.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Wall clock backed by `chrono`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        chrono::Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Manually driven clock for tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: AtomicU64::new(start_millis),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

/// Encoding used for every message that crosses a node boundary.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Encode to bytes.
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from bytes.
    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
