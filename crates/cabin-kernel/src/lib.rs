//! CabinCrew kernel (cabin-kernel)
//!
//! Gated two-phase workflow orchestration:
//! 1. **Flight-plan**: an engine proposes changes; their artifacts are
//!    re-hashed and bound into a plan token
//! 2. **Preflight**: policy backends evaluate the plan; their verdicts are
//!    aggregated into one decision, optionally requiring human approval
//! 3. **Take-off**: the engine executes, but only against the exact plan
//!    token that was evaluated
//!
//! Every transition is written to a per-workflow write-ahead log before it
//! takes effect, and described in a hash-chained audit ledger afterwards.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cabin_kernel::prelude::*;
//!
//! let orchestrator = WorkflowOrchestrator::builder(OrchestratorConfig::new())
//!     .artifact_store(store)
//!     .backend(opa)
//!     .build()?;
//!
//! orchestrator.start_workflow(&wf, MetaMap::new())?;
//! let token = orchestrator.record_plan_generated(&wf, submission)?;
//! let preflight = orchestrator.run_preflight(&wf, request).await?;
//! if let Some(approval) = preflight.approval {
//!     orchestrator.submit_approval(&wf, ApprovalResponse::approve(approval.approval_id, "alice"))?;
//! }
//! orchestrator.record_takeoff(&wf, &step, &token.token, None)?;
//! ```

pub mod approval;
pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod plan_token;
pub mod state_machine;
pub mod telemetry;
pub mod wal;

pub use error::{ErrorClass, KernelError, KernelResult};
pub use orchestrator::{
    OrchestratorBuilder, PlanSubmission, PreflightResult, RecoveryReport, WorkflowOrchestrator,
};

/// Common types for driving a workflow
pub mod prelude {
    pub use crate::approval::{ApprovalError, ApprovalManager};
    pub use crate::audit::{
        verify_chain, AuditChain, AuditEvent, AuditSeverity, AuditSigner, ChainVerification,
    };
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::OrchestratorConfig;
    pub use crate::error::{ErrorClass, KernelError, KernelResult};
    pub use crate::orchestrator::{
        OrchestratorBuilder, PlanSubmission, PreflightResult, RecoveryReport,
        WorkflowOrchestrator,
    };
    pub use crate::plan_token::{PlanProvenance, PlanTokenBinder};
    pub use crate::wal::{fold_state, WorkflowStateRecord, WriteAheadLog};
    pub use cabin_artifact::{ContentHash, MetaMap, StepId, WorkflowId};
    pub use cabin_protocol::{
        ApprovalResponse, Decision, EngineOutput, PlanToken, PreflightInput, State, WorkflowState,
    };
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Check if running with strict debugging enabled
#[must_use]
pub const fn strict_debug() -> bool {
    cfg!(feature = "strict-debug")
}
