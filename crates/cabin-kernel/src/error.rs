//! Kernel error type
//!
//! Every failure the orchestrator can return, with a classification that
//! tells callers whether the workflow is still usable:
//!
//! - **Validation**: bad input, rejected before anything was written
//! - **Integrity**: hash, token or log mismatch; the workflow is failed
//! - **PolicyOrApproval**: a gate said no; state is unchanged
//! - **Persistence**: storage failed; nothing was committed
//! - **Lifecycle**: wrong state or unknown workflow; state is unchanged
//! - **Configuration**: the orchestrator itself is misconfigured

use crate::approval::ApprovalError;
use crate::audit::AuditError;
use crate::config::ConfigError;
use crate::plan_token::PlanTokenError;
use crate::state_machine::StateMachineError;
use crate::wal::{FoldError, WalError};
use cabin_artifact::{ArtifactError, ContentHash, HashError, LabelError, WorkflowId};
use cabin_policy::PolicyError;
use cabin_protocol::{State, ValidationError};

/// Coarse error category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Validation,
    Integrity,
    PolicyOrApproval,
    Persistence,
    Lifecycle,
    Configuration,
}

/// Main kernel error type
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// Malformed engine or preflight message
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("invalid label: {0}")]
    Label(#[from] LabelError),

    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    /// Take-off presented a plan token other than the one recorded
    #[error("plan token mismatch for workflow {workflow_id}: recorded {expected}, presented {actual}")]
    PlanTokenMismatch {
        workflow_id: WorkflowId,
        expected: ContentHash,
        actual: ContentHash,
    },

    #[error("plan token error: {0}")]
    PlanToken(#[from] PlanTokenError),

    #[error("policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("approval rejected: {0}")]
    Approval(#[from] ApprovalError),

    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("WAL fold error: {0}")]
    Fold(#[from] FoldError),

    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("hash error: {0}")]
    Hash(#[from] HashError),

    #[error("workflow {0} already exists")]
    DuplicateWorkflow(WorkflowId),

    #[error("unknown workflow {0}")]
    UnknownWorkflow(WorkflowId),

    /// Operation not allowed in the workflow's current state
    #[error("cannot {operation} workflow {workflow_id} in state {state}")]
    InvalidState {
        workflow_id: WorkflowId,
        operation: &'static str,
        state: State,
    },
}

impl KernelError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) | Self::Label(_) | Self::PlanToken(_) | Self::Hash(_) => {
                ErrorClass::Validation
            }
            Self::Artifact(ArtifactError::HashMismatch { .. }) => ErrorClass::Integrity,
            Self::Artifact(ArtifactError::Io(_)) => ErrorClass::Persistence,
            Self::Artifact(_) => ErrorClass::Validation,
            Self::PlanTokenMismatch { .. } | Self::Fold(_) => ErrorClass::Integrity,
            Self::Wal(e) if e.is_corruption() => ErrorClass::Integrity,
            Self::Wal(_) => ErrorClass::Persistence,
            Self::Audit(AuditError::BrokenChain { .. }) => ErrorClass::Integrity,
            Self::Audit(AuditError::InvalidKey(_)) => ErrorClass::Configuration,
            Self::Audit(_) => ErrorClass::Persistence,
            Self::Policy(PolicyError::MissingCustomRule(_)) => ErrorClass::Configuration,
            Self::Policy(_) | Self::Approval(_) => ErrorClass::PolicyOrApproval,
            Self::StateMachine(_)
            | Self::DuplicateWorkflow(_)
            | Self::UnknownWorkflow(_)
            | Self::InvalidState { .. } => ErrorClass::Lifecycle,
            Self::Config(_) => ErrorClass::Configuration,
        }
    }

    /// Was the error rejected with the workflow left as it was?
    #[inline]
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Validation | ErrorClass::PolicyOrApproval | ErrorClass::Lifecycle
        )
    }

    /// Integrity failures end the workflow
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Integrity
    }

    /// Storage or configuration problem rather than a problem with the
    /// request
    #[inline]
    #[must_use]
    pub fn is_system_error(&self) -> bool {
        matches!(
            self.class(),
            ErrorClass::Persistence | ErrorClass::Configuration
        )
    }
}

/// Kernel result alias
pub type KernelResult<T> = Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn wf() -> WorkflowId {
        "wf1".parse().unwrap()
    }

    #[test]
    fn token_mismatch_is_fatal() {
        let err = KernelError::PlanTokenMismatch {
            workflow_id: wf(),
            expected: ContentHash::compute(b"a"),
            actual: ContentHash::compute(b"b"),
        };
        assert_eq!(err.class(), ErrorClass::Integrity);
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn gate_rejections_are_recoverable() {
        let err = KernelError::from(PolicyError::NoPoliciesEvaluated);
        assert!(err.is_recoverable());
        let err = KernelError::from(ApprovalError::UnknownApproval("apr-1".parse().unwrap()));
        assert_eq!(err.class(), ErrorClass::PolicyOrApproval);
    }

    #[test]
    fn wal_errors_split_by_cause() {
        let corrupt = KernelError::from(WalError::CorruptedLogEntry {
            workflow_id: "wf1".into(),
            sequence: 2,
            reason: "checksum".into(),
        });
        assert!(corrupt.is_fatal());

        let io = KernelError::from(WalError::Io(std::io::Error::other("disk full")));
        assert!(io.is_system_error());
        assert!(!io.is_recoverable());
    }

    #[test]
    fn lifecycle_errors() {
        let err = KernelError::InvalidState {
            workflow_id: wf(),
            operation: "record take-off for",
            state: State::AwaitingApproval,
        };
        assert_eq!(err.class(), ErrorClass::Lifecycle);
        assert_eq!(
            err.to_string(),
            "cannot record take-off for workflow wf1 in state AWAITING_APPROVAL"
        );
    }
}
