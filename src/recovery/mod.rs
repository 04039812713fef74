//! Shard recovery.
//!
//! A copy assigned to a node in INITIALIZING state is brought up to date by a
//! [`RecoverySession`]:
//!
//! 1. **File copy**: list the source's store files and copy them in chunks,
//!    verifying checksums.
//! 2. **Translog replay**: apply the operations indexed on the source since,
//!    after any mapping they need is acknowledged by the master.
//! 3. **Finalize**: close the recovery on both ends.
//!
//! The [`RecoveryCoordinator`] starts sessions from routing changes, retries
//! phases, and reports the result back to the master as a `shard-started` or
//! `shard-failed` task.

pub mod coordinator;
pub mod memory;
pub mod session;
pub mod source;

pub use coordinator::{
    recovery_source, RecoveryCoordinator, RecoveryOutcome, RecoveryServices, RecoverySessionHandle,
};
pub use memory::{checksum, InMemoryRecoverySource, InMemoryShardStore};
pub use session::{RecoveryPhase, RecoverySession, TraceSummary};
pub use source::{
    FileChunk, RecoveryFilesInfo, RecoveryResponse, RecoverySource, RecoveryTarget, ShardStateReporter,
    StartRecoveryRequest, StoreFileMetadata, TranslogBatch, TranslogOperation,
};
