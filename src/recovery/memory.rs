//! In-process shard storage and recovery source.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use super::source::{
    FileChunk, RecoveryFilesInfo, RecoverySource, RecoveryTarget, StartRecoveryRequest, StoreFileMetadata,
    TranslogBatch, TranslogOperation,
};
use crate::error::{MeridianError, Result};
use crate::types::{NodeId, ShardId, WireMessage};

/// Hex SHA-256 of `data`.
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Default, Clone)]
struct ShardData {
    files: BTreeMap<String, Vec<u8>>,
    operations: Vec<TranslogOperation>,
    active: bool,
}

/// Shard files and translogs of one node, held in memory.
#[derive(Debug, Default)]
pub struct InMemoryShardStore {
    shards: RwLock<HashMap<ShardId, ShardData>>,
    /// Files being received, keyed by shard, recovery id and file name.
    partial: Mutex<HashMap<(ShardId, u64, String), Vec<u8>>>,
}

impl InMemoryShardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a complete file into a shard, creating the shard if needed.
    pub fn put_file(&self, shard: &ShardId, name: impl Into<String>, data: Vec<u8>) {
        self.shards
            .write()
            .entry(shard.clone())
            .or_default()
            .files
            .insert(name.into(), data);
    }

    /// Append a document operation to the shard's translog.
    pub fn index_document(&self, shard: &ShardId, doc_id: impl Into<String>, fields: BTreeMap<String, String>) -> u64 {
        let mut shards = self.shards.write();
        let data = shards.entry(shard.clone()).or_default();
        let seq_no = data.operations.last().map(|op| op.seq_no + 1).unwrap_or(0);
        data.operations.push(TranslogOperation {
            seq_no,
            doc_id: doc_id.into(),
            fields,
        });
        seq_no
    }

    pub fn has_shard(&self, shard: &ShardId) -> bool {
        self.shards.read().contains_key(shard)
    }

    /// Whether the shard finished recovering on this node.
    pub fn is_active(&self, shard: &ShardId) -> bool {
        self.shards.read().get(shard).map(|d| d.active).unwrap_or(false)
    }

    pub fn files(&self, shard: &ShardId) -> Option<Vec<StoreFileMetadata>> {
        self.shards.read().get(shard).map(|data| {
            data.files
                .iter()
                .map(|(name, bytes)| StoreFileMetadata {
                    name: name.clone(),
                    length: bytes.len() as u64,
                    checksum: checksum(bytes),
                })
                .collect()
        })
    }

    pub fn file(&self, shard: &ShardId, name: &str) -> Option<Vec<u8>> {
        self.shards.read().get(shard).and_then(|d| d.files.get(name).cloned())
    }

    pub fn operations(&self, shard: &ShardId) -> Vec<TranslogOperation> {
        self.shards
            .read()
            .get(shard)
            .map(|d| d.operations.clone())
            .unwrap_or_default()
    }

    /// Number of partially received files.
    pub fn open_handles(&self) -> usize {
        self.partial.lock().len()
    }

    pub fn open_handles_for(&self, shard: &ShardId) -> usize {
        self.partial.lock().keys().filter(|(s, _, _)| s == shard).count()
    }

    fn read_range(&self, shard: &ShardId, name: &str, offset: u64, max_len: usize) -> Result<(Vec<u8>, bool)> {
        let shards = self.shards.read();
        let bytes = shards
            .get(shard)
            .ok_or_else(|| MeridianError::ShardNotFound(shard.to_string()))?
            .files
            .get(name)
            .ok_or_else(|| MeridianError::RecoveryFailed {
                shard: shard.to_string(),
                reason: format!("file {} missing on source", name),
            })?;
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(max_len).min(bytes.len());
        Ok((bytes[start..end].to_vec(), end == bytes.len()))
    }
}

#[async_trait]
impl RecoveryTarget for InMemoryShardStore {
    async fn write_chunk(&self, shard: &ShardId, chunk: &FileChunk) -> Result<()> {
        let mut partial = self.partial.lock();
        let buffer = partial
            .entry((shard.clone(), chunk.recovery_id, chunk.file_name.clone()))
            .or_default();
        if buffer.len() as u64 != chunk.offset {
            // A retried phase restarts the file from the beginning.
            if chunk.offset != 0 {
                return Err(MeridianError::InvalidState(format!(
                    "chunk of {} at offset {} but {} bytes received",
                    chunk.file_name,
                    chunk.offset,
                    buffer.len()
                )));
            }
            buffer.clear();
        }
        buffer.extend_from_slice(&chunk.data);
        Ok(())
    }

    async fn finish_file(&self, shard: &ShardId, recovery_id: u64, file: &StoreFileMetadata) -> Result<()> {
        let data = self
            .partial
            .lock()
            .remove(&(shard.clone(), recovery_id, file.name.clone()))
            .unwrap_or_default();
        if data.len() as u64 != file.length || checksum(&data) != file.checksum {
            return Err(MeridianError::RecoveryFailed {
                shard: shard.to_string(),
                reason: format!("checksum mismatch on {}", file.name),
            });
        }
        self.put_file(shard, file.name.clone(), data);
        Ok(())
    }

    async fn apply_operations(&self, shard: &ShardId, operations: &[TranslogOperation]) -> Result<()> {
        let mut shards = self.shards.write();
        let data = shards.entry(shard.clone()).or_default();
        let seen: HashSet<u64> = data.operations.iter().map(|op| op.seq_no).collect();
        data.operations
            .extend(operations.iter().filter(|op| !seen.contains(&op.seq_no)).cloned());
        data.operations.sort_by_key(|op| op.seq_no);
        Ok(())
    }

    async fn create_empty(&self, shard: &ShardId) -> Result<()> {
        self.shards.write().entry(shard.clone()).or_default();
        Ok(())
    }

    async fn finalize(&self, shard: &ShardId) -> Result<()> {
        let mut shards = self.shards.write();
        let data = shards
            .get_mut(shard)
            .ok_or_else(|| MeridianError::ShardNotFound(shard.to_string()))?;
        data.active = true;
        Ok(())
    }

    async fn clean_files(&self, shard: &ShardId, recovery_id: u64) -> Result<()> {
        self.partial
            .lock()
            .retain(|(s, id, _), _| !(s == shard && *id == recovery_id));
        Ok(())
    }
}

/// Serves recoveries from the shard stores of in-process nodes.
///
/// Requests and responses go through their wire encoding. Nodes can be
/// disconnected to simulate an unreachable source.
#[derive(Default)]
pub struct InMemoryRecoverySource {
    nodes: RwLock<HashMap<NodeId, Arc<InMemoryShardStore>>>,
    disconnected: RwLock<HashSet<NodeId>>,
}

impl InMemoryRecoverySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node_id: impl Into<NodeId>, store: Arc<InMemoryShardStore>) {
        self.nodes.write().insert(node_id.into(), store);
    }

    pub fn disconnect(&self, node_id: &str) {
        self.disconnected.write().insert(node_id.to_string());
    }

    pub fn reconnect(&self, node_id: &str) {
        self.disconnected.write().remove(node_id);
    }

    fn store(&self, request: &StartRecoveryRequest) -> Result<Arc<InMemoryShardStore>> {
        let request = StartRecoveryRequest::decode(&request.encode()?)?;
        if self.disconnected.read().contains(&request.source_node) {
            return Err(MeridianError::NodeDisconnected(request.source_node));
        }
        self.nodes
            .read()
            .get(&request.source_node)
            .cloned()
            .ok_or_else(|| MeridianError::ConnectionFailed(format!("unknown node {}", request.source_node)))
    }
}

#[async_trait]
impl RecoverySource for InMemoryRecoverySource {
    async fn start_recovery(&self, request: &StartRecoveryRequest) -> Result<RecoveryFilesInfo> {
        let store = self.store(request)?;
        let files = store
            .files(&request.shard_id)
            .ok_or_else(|| MeridianError::ShardNotFound(request.shard_id.to_string()))?;
        RecoveryFilesInfo::decode(&RecoveryFilesInfo { files }.encode()?)
    }

    async fn read_chunk(
        &self,
        request: &StartRecoveryRequest,
        file: &StoreFileMetadata,
        offset: u64,
        max_len: usize,
    ) -> Result<FileChunk> {
        let store = self.store(request)?;
        let (data, last_chunk) = store.read_range(&request.shard_id, &file.name, offset, max_len)?;
        let chunk = FileChunk {
            recovery_id: request.recovery_id,
            file_name: file.name.clone(),
            offset,
            data,
            last_chunk,
        };
        FileChunk::decode(&chunk.encode()?)
    }

    async fn translog_operations(&self, request: &StartRecoveryRequest) -> Result<TranslogBatch> {
        let store = self.store(request)?;
        let batch = TranslogBatch {
            operations: store.operations(&request.shard_id),
        };
        TranslogBatch::decode(&batch.encode()?)
    }

    async fn finalize(&self, request: &StartRecoveryRequest) -> Result<()> {
        self.store(request).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shard() -> ShardId {
        ShardId::new("logs", 0)
    }

    fn request() -> StartRecoveryRequest {
        StartRecoveryRequest {
            recovery_id: 1,
            shard_id: shard(),
            source_node: "node-1".into(),
            target_node: "node-2".into(),
            allocation_id: 2,
            primary: false,
        }
    }

    #[tokio::test]
    async fn test_chunked_copy_verifies_checksum() {
        let source_store = Arc::new(InMemoryShardStore::new());
        source_store.put_file(&shard(), "_0.cfs", vec![7u8; 10]);
        let source = InMemoryRecoverySource::new();
        source.register("node-1", source_store);

        let target = InMemoryShardStore::new();
        let info = source.start_recovery(&request()).await.unwrap();
        let file = &info.files[0];
        let mut offset = 0;
        loop {
            let chunk = source.read_chunk(&request(), file, offset, 4).await.unwrap();
            offset += chunk.data.len() as u64;
            target.write_chunk(&shard(), &chunk).await.unwrap();
            if chunk.last_chunk {
                break;
            }
        }
        assert_eq!(target.open_handles(), 1);
        target.finish_file(&shard(), 1, file).await.unwrap();
        assert_eq!(target.open_handles(), 0);
        assert_eq!(target.file(&shard(), "_0.cfs"), Some(vec![7u8; 10]));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_rejected() {
        let target = InMemoryShardStore::new();
        let chunk = FileChunk {
            recovery_id: 1,
            file_name: "_0.cfs".into(),
            offset: 0,
            data: vec![1, 2, 3],
            last_chunk: true,
        };
        target.write_chunk(&shard(), &chunk).await.unwrap();
        let meta = StoreFileMetadata {
            name: "_0.cfs".into(),
            length: 3,
            checksum: checksum(&[1, 2, 4]),
        };
        let err = target.finish_file(&shard(), 1, &meta).await.unwrap_err();
        assert!(matches!(err, MeridianError::RecoveryFailed { .. }));
    }

    #[tokio::test]
    async fn test_clean_files_releases_handles() {
        let target = InMemoryShardStore::new();
        let chunk = FileChunk {
            recovery_id: 1,
            file_name: "_0.cfs".into(),
            offset: 0,
            data: vec![1],
            last_chunk: false,
        };
        target.write_chunk(&shard(), &chunk).await.unwrap();
        target.write_chunk(&ShardId::new("other", 0), &chunk).await.unwrap();
        target.clean_files(&shard(), 1).await.unwrap();
        assert_eq!(target.open_handles_for(&shard()), 0);
        assert_eq!(target.open_handles(), 1);
    }

    #[tokio::test]
    async fn test_clean_files_keeps_newer_recovery_of_shard() {
        let target = InMemoryShardStore::new();
        let data = vec![5u8; 6];
        let chunk = |recovery_id| FileChunk {
            recovery_id,
            file_name: "_0.cfs".into(),
            offset: 0,
            data: data.clone(),
            last_chunk: true,
        };
        target.write_chunk(&shard(), &chunk(1)).await.unwrap();
        target.write_chunk(&shard(), &chunk(2)).await.unwrap();

        target.clean_files(&shard(), 1).await.unwrap();
        assert_eq!(target.open_handles_for(&shard()), 1);

        let meta = StoreFileMetadata {
            name: "_0.cfs".into(),
            length: 6,
            checksum: checksum(&data),
        };
        target.finish_file(&shard(), 2, &meta).await.unwrap();
        assert_eq!(target.file(&shard(), "_0.cfs"), Some(data));
        assert_eq!(target.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_replay_skips_seen_operations() {
        let store = InMemoryShardStore::new();
        store.index_document(&shard(), "doc-1", BTreeMap::new());
        let ops = store.operations(&shard());
        store.apply_operations(&shard(), &ops).await.unwrap();
        assert_eq!(store.operations(&shard()).len(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_source() {
        let source = InMemoryRecoverySource::new();
        source.register("node-1", Arc::new(InMemoryShardStore::new()));
        source.disconnect("node-1");
        let err = source.start_recovery(&request()).await.unwrap_err();
        assert!(matches!(err, MeridianError::NodeDisconnected(_)));
        assert!(err.is_retryable());
    }
}
