//! Write-ahead log
//!
//! The WAL is the only durable source of workflow state. Every lifecycle
//! change is appended here first; the in-memory [`WorkflowStateRecord`] is
//! always a fold of the committed entries.
//!
//! - [`entry`]: the nine entry shapes and the checksum codec
//! - [`store`]: where lines live ([`MemoryWalStore`], [`FileWalStore`])
//! - [`log`]: sequencing, per-workflow locking and verified replay
//! - [`fold`]: the pure reducer from entries to a state record

pub mod entry;
pub mod fold;
pub mod log;
pub mod store;

pub use entry::{
    ApprovalReceivedData, ApprovalRequestedData, ArtifactCreatedData, FailureKind,
    StepCompletedData, StepStartedData, StepType, WalEntry, WalEntryData, WalEntryType,
    WorkflowCompletedData, WorkflowFailedData, WorkflowStartedData,
};
pub use fold::{fold_state, FoldError, WorkflowStateRecord};
pub use log::WriteAheadLog;
pub use store::{FileWalStore, MemoryWalStore, WalStore};

/// WAL errors
#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("corrupted WAL entry {sequence} for workflow {workflow_id}: {reason}")]
    CorruptedLogEntry {
        workflow_id: String,
        sequence: u64,
        reason: String,
    },

    #[error("WAL I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("empty WAL batch")]
    EmptyBatch,
}

impl WalError {
    /// Is this a checksum or continuity failure rather than an I/O problem?
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptedLogEntry { .. })
    }
}
