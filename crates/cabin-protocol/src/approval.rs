//! Human approval messages

use crate::engine::EngineOutput;
use crate::preflight::PreflightEvidence;
use cabin_artifact::{ApprovalId, ContentHash, StepId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Request for a human decision before take-off
///
/// `plan_token_hash` pins the exact plan being approved. An approval can
/// never be applied to a different plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: ApprovalId,
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub reason: String,
    pub required_role: String,
    pub plan_token_hash: ContentHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_output: Option<EngineOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Vec<PreflightEvidence>>,
}

/// Approver's answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approval_id: ApprovalId,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    /// The plan the approver believes they are approving
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token_hash: Option<ContentHash>,
}

impl ApprovalResponse {
    /// Grant `approval_id`
    #[must_use]
    pub fn approve(approval_id: ApprovalId, approver: impl Into<String>) -> Self {
        Self {
            approval_id,
            approved: true,
            approver: Some(approver.into()),
            reason: None,
            timestamp: None,
            plan_token_hash: None,
        }
    }

    /// Deny `approval_id`
    #[must_use]
    pub fn reject(approval_id: ApprovalId, approver: impl Into<String>) -> Self {
        Self {
            approved: false,
            ..Self::approve(approval_id, approver)
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn bound_to(mut self, plan_token_hash: ContentHash) -> Self {
        self.plan_token_hash = Some(plan_token_hash);
        self
    }
}

/// Durable, immutable record of a resolved approval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub approval_id: ApprovalId,
    pub step_id: StepId,
    pub plan_token_hash: ContentHash,
    pub approved: bool,
    pub approver: String,
    pub approved_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_hashes: Vec<ContentHash>,
}
