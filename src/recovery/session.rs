//! Recovery session state machine.

use std::fmt;

use crate::error::{MeridianError, Result};
use crate::types::{NodeId, ShardId};

/// Phase of a recovery session.
///
/// ```text
/// INIT ──► FILE_COPY ──► TRANSLOG_REPLAY ──► FINALIZE ──► DONE
///   │          │               │                │
///   └──────────┴───────────────┴────────────────┴──► FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryPhase {
    Init,
    FileCopy,
    TranslogReplay,
    Finalize,
    Done,
    Failed,
}

impl RecoveryPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RecoveryPhase::Done | RecoveryPhase::Failed)
    }

    pub fn can_transition_to(&self, next: RecoveryPhase) -> bool {
        use RecoveryPhase::*;
        match (self, next) {
            (Init, FileCopy) | (FileCopy, TranslogReplay) | (TranslogReplay, Finalize) | (Finalize, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryPhase::Init => "init",
            RecoveryPhase::FileCopy => "file_copy",
            RecoveryPhase::TranslogReplay => "translog_replay",
            RecoveryPhase::Finalize => "finalize",
            RecoveryPhase::Done => "done",
            RecoveryPhase::Failed => "failed",
        }
    }
}

impl fmt::Display for RecoveryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only, newline separated log of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceSummary {
    text: String,
    lines: usize,
}

impl TraceSummary {
    pub fn append(&mut self, line: impl AsRef<str>) {
        if self.lines > 0 {
            self.text.push('\n');
        }
        self.text.push_str(line.as_ref());
        self.lines += 1;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn line_count(&self) -> usize {
        self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines == 0
    }
}

/// Progress of one shard copy being recovered.
#[derive(Debug, Clone)]
pub struct RecoverySession {
    pub recovery_id: u64,
    pub shard_id: ShardId,
    pub allocation_id: u64,
    /// `None` when the shard recovers from an empty store.
    pub source_node: Option<NodeId>,
    pub target_node: NodeId,
    pub start_time_millis: u64,
    pub files_received: usize,
    pub bytes_received: u64,
    pub operations_replayed: usize,
    phase: RecoveryPhase,
    failure: Option<String>,
    trace: TraceSummary,
}

impl RecoverySession {
    pub fn new(
        recovery_id: u64,
        shard_id: ShardId,
        allocation_id: u64,
        source_node: Option<NodeId>,
        target_node: NodeId,
        start_time_millis: u64,
    ) -> Self {
        Self {
            recovery_id,
            shard_id,
            allocation_id,
            source_node,
            target_node,
            start_time_millis,
            files_received: 0,
            bytes_received: 0,
            operations_replayed: 0,
            phase: RecoveryPhase::Init,
            failure: None,
            trace: TraceSummary::default(),
        }
    }

    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    pub fn trace(&self) -> &TraceSummary {
        &self.trace
    }

    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn append_trace(&mut self, line: impl AsRef<str>) {
        self.trace.append(line);
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: RecoveryPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(MeridianError::InvalidState(format!(
                "recovery of {} cannot move from {} to {}",
                self.shard_id, self.phase, next
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// Record the copied files and move on to translog replay.
    pub fn on_files_received(&mut self, files: usize, bytes: u64) -> Result<()> {
        if self.phase != RecoveryPhase::FileCopy {
            return Err(MeridianError::InvalidState(format!(
                "recovery of {} received files in phase {}",
                self.shard_id, self.phase
            )));
        }
        self.files_received = files;
        self.bytes_received = bytes;
        self.transition(RecoveryPhase::TranslogReplay)
    }

    /// Record the replayed operations and move on to finalize.
    pub fn on_translog_ops_received(&mut self, operations: usize) -> Result<()> {
        if self.phase != RecoveryPhase::TranslogReplay {
            return Err(MeridianError::InvalidState(format!(
                "recovery of {} received translog operations in phase {}",
                self.shard_id, self.phase
            )));
        }
        self.operations_replayed = operations;
        self.transition(RecoveryPhase::Finalize)
    }

    /// Fail the session. Returns `false` if it had already ended.
    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        if self.phase.is_terminal() {
            return false;
        }
        self.phase = RecoveryPhase::Failed;
        self.failure = Some(reason.into());
        true
    }
}
