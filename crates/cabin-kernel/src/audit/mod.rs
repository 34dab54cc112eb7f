//! Tamper-evident audit ledger
//!
//! Independent of the WAL: the WAL decides state, the audit chain records
//! what happened in a form an outside reviewer can verify.

mod chain;
mod event;
mod signing;
mod store;

pub use chain::{verify_chain, AuditChain, ChainVerification};
pub use event::{
    AuditApproval, AuditArtifact, AuditEngine, AuditEvent, AuditGateway, AuditIntegrity,
    AuditPolicy, AuditSeverity, AuditWorkflow,
};
pub use signing::{verify_signature, AuditSigner};
pub use store::{AuditStore, FileAuditStore, MemoryAuditStore};

use cabin_artifact::HashError;

/// Audit ledger errors
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("audit chain broken at event {index}")]
    BrokenChain { index: usize },

    #[error("malformed audit event at line {index}: {reason}")]
    MalformedEvent { index: usize, reason: String },

    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    #[error("audit hash error: {0}")]
    Hash(#[from] HashError),

    #[error("audit I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
