//! Recovery wire contract and the seams a recovery talks through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::state::ShardRouting;
use crate::types::{NodeId, ShardId, WireMessage};

/// Sent by the target to the source to open a recovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRecoveryRequest {
    pub recovery_id: u64,
    pub shard_id: ShardId,
    pub source_node: NodeId,
    pub target_node: NodeId,
    pub allocation_id: u64,
    pub primary: bool,
}

impl WireMessage for StartRecoveryRequest {}

/// A file of the source's shard store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFileMetadata {
    pub name: String,
    pub length: u64,
    /// Hex SHA-256 of the file contents.
    pub checksum: String,
}

/// Files the source will send.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryFilesInfo {
    pub files: Vec<StoreFileMetadata>,
}

impl WireMessage for RecoveryFilesInfo {}

impl RecoveryFilesInfo {
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }
}

/// Chunk of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunk {
    pub recovery_id: u64,
    pub file_name: String,
    pub offset: u64,
    pub data: Vec<u8>,
    pub last_chunk: bool,
}

impl WireMessage for FileChunk {}

/// A translog operation replayed on the target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslogOperation {
    pub seq_no: u64,
    pub doc_id: String,
    /// Field name to field type of the indexed document.
    pub fields: BTreeMap<String, String>,
}

/// Batch of translog operations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranslogBatch {
    pub operations: Vec<TranslogOperation>,
}

impl WireMessage for TranslogBatch {}

/// Outcome of a completed recovery, returned to whoever waits on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryResponse {
    pub phase1_file_names: Vec<String>,
    pub phase1_total_bytes: u64,
    pub phase2_operations: usize,
    pub start_time_millis: u64,
    pub took_millis: u64,
    /// One line per notable event, newline separated.
    pub trace_summary: Option<String>,
}

impl WireMessage for RecoveryResponse {}

impl RecoveryResponse {
    /// Append a line to the trace summary.
    pub fn append_trace_summary(&mut self, line: &str) {
        match &mut self.trace_summary {
            Some(summary) => {
                summary.push('\n');
                summary.push_str(line);
            }
            None => self.trace_summary = Some(line.to_string()),
        }
    }
}

/// Client for the node a shard is recovered from.
#[async_trait]
pub trait RecoverySource: Send + Sync {
    /// Open a recovery and list the files to copy.
    async fn start_recovery(&self, request: &StartRecoveryRequest) -> Result<RecoveryFilesInfo>;

    async fn read_chunk(
        &self,
        request: &StartRecoveryRequest,
        file: &StoreFileMetadata,
        offset: u64,
        max_len: usize,
    ) -> Result<FileChunk>;

    /// Operations to replay after the file copy.
    async fn translog_operations(&self, request: &StartRecoveryRequest) -> Result<TranslogBatch>;

    /// Close the recovery on the source.
    async fn finalize(&self, request: &StartRecoveryRequest) -> Result<()>;
}

/// Local shard storage written by a recovery.
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    /// Write a chunk, opening a temporary file handle for the chunk's
    /// recovery on first use.
    async fn write_chunk(&self, shard: &ShardId, chunk: &FileChunk) -> Result<()>;

    /// Close the handle of a fully received file, verifying its checksum.
    async fn finish_file(&self, shard: &ShardId, recovery_id: u64, file: &StoreFileMetadata) -> Result<()>;

    async fn apply_operations(&self, shard: &ShardId, operations: &[TranslogOperation]) -> Result<()>;

    /// Create an empty shard store for a new primary.
    async fn create_empty(&self, shard: &ShardId) -> Result<()>;

    /// Make the recovered shard available.
    async fn finalize(&self, shard: &ShardId) -> Result<()>;

    /// Release the partially written file handles one recovery of `shard`
    /// opened. Handles of other recoveries of the same shard stay open.
    async fn clean_files(&self, shard: &ShardId, recovery_id: u64) -> Result<()>;
}

/// Reports recovery results back to the master.
#[async_trait]
pub trait ShardStateReporter: Send + Sync {
    async fn shard_started(&self, routing: &ShardRouting, message: &str) -> Result<()>;

    async fn shard_failed(&self, routing: &ShardRouting, reason: &str) -> Result<()>;
}
