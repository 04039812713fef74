//! Error types for Meridian.
//!
//! This module provides a unified error type [`MeridianError`] for all cluster
//! coordination operations, along with a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Versioning**: a commit lost the race against a newer state
//! - **Mastership**: the local node stopped being the elected master mid-round
//! - **Publication**: a committed state could not reach its acknowledgement quorum
//! - **Recovery**: shard recovery sessions failed or were cancelled
//! - **Validation**: a task's transform rejected the requested change
//! - **Transport**: connection failures and timeouts
//!
//! # Example
//!
//! ```rust
//! use meridian::error::{MeridianError, Result};
//!
//! fn check_alias(name: &str) -> Result<()> {
//!     if name.is_empty() {
//!         return Err(MeridianError::InvalidAliasName {
//!             name: name.to_string(),
//!             reason: "must not be empty".into(),
//!         });
//!     }
//!     Ok(())
//! }
//!
//! let err = check_alias("").unwrap_err();
//! assert!(!err.is_retryable());
//! ```

use thiserror::Error;

/// Main error type for Meridian operations.
///
/// Errors are cloneable so that one failure can be reported to several task
/// listeners of the same batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeridianError {
    // Versioning and mastership
    #[error("Stale cluster state version: current is {current}, candidate is {candidate}")]
    StaleVersion { current: u64, candidate: u64 },

    #[error("No longer master. Known master: {master:?}")]
    NotMaster { master: Option<String> },

    #[error("Publication of version {version} failed: {acks} of {required} required acks")]
    PublicationFailed {
        version: u64,
        acks: usize,
        required: usize,
    },

    #[error("Incompatible cluster state diff: local version {local}, diff base {base}")]
    IncompatibleClusterStateVersion { local: u64, base: u64 },

    // Mapping and recovery
    #[error("Retry on primary: {0}")]
    RetryOnPrimary(String),

    #[error("Recovery of {shard} failed: {reason}")]
    RecoveryFailed { shard: String, reason: String },

    #[error("Recovery of {0} was cancelled")]
    RecoveryCancelled(String),

    // Validation errors raised inside task transforms
    #[error("Invalid alias name [{name}]: {reason}")]
    InvalidAliasName { name: String, reason: String },

    #[error("Invalid index name [{name}]: {reason}")]
    InvalidIndexName { name: String, reason: String },

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("Index already exists: {0}")]
    IndexAlreadyExists(String),

    #[error("Mapping conflict on field [{field}]: mapped as {existing}, requested {requested}")]
    MappingConflict {
        field: String,
        existing: String,
        requested: String,
    },

    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Validation error: {0}")]
    Validation(String),

    // Transport errors
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Node disconnected: {0}")]
    NodeDisconnected(String),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Task panicked: {0}")]
    TaskPanicked(String),

    #[error("Service is shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl MeridianError {
    /// Check if error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeridianError::StaleVersion { .. }
                | MeridianError::RetryOnPrimary(_)
                | MeridianError::PublicationFailed { .. }
                | MeridianError::IncompatibleClusterStateVersion { .. }
                | MeridianError::ConnectionFailed(_)
                | MeridianError::NodeDisconnected(_)
                | MeridianError::Timeout(_)
        )
    }

    /// Whether the error means the local node lost mastership.
    pub fn is_not_master(&self) -> bool {
        matches!(self, MeridianError::NotMaster { .. })
    }
}

impl From<std::io::Error> for MeridianError {
    fn from(e: std::io::Error) -> Self {
        MeridianError::Io(e.to_string())
    }
}

impl From<bincode::Error> for MeridianError {
    fn from(e: bincode::Error) -> Self {
        MeridianError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for MeridianError {
    fn from(e: serde_json::Error) -> Self {
        MeridianError::Serialization(e.to_string())
    }
}

/// Result type alias for Meridian operations.
pub type Result<T> = std::result::Result<T, MeridianError>;
