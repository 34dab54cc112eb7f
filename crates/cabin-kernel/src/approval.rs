//! Human approval gate
//!
//! An approval is requested once and resolved once. Responses are checked
//! against the workflow's folded record, so a decision made for one plan
//! can never unlock a different one.

use crate::wal::WorkflowStateRecord;
use cabin_artifact::{ApprovalId, ContentHash, StepId, WorkflowId};
use cabin_protocol::{ApprovalRecord, ApprovalRequest, ApprovalResponse};
use chrono::{DateTime, Utc};

/// Approver recorded when a response names nobody
pub const UNSPECIFIED_APPROVER: &str = "unspecified";

/// Approval rejections
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApprovalError {
    #[error("unknown approval {0}")]
    UnknownApproval(ApprovalId),

    #[error("approval {0} already resolved")]
    AlreadyResolved(ApprovalId),

    #[error("approval {approval_id} is bound to plan {bound}, current plan is {current}")]
    PlanTokenReplayRejected {
        approval_id: ApprovalId,
        bound: ContentHash,
        current: String,
    },

    #[error("approval {0} does not name an approver")]
    MissingApprover(ApprovalId),
}

/// Issues approval requests and validates responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalManager {
    default_role: String,
    require_named_approver: bool,
}

impl Default for ApprovalManager {
    fn default() -> Self {
        Self::new("operator", false)
    }
}

impl ApprovalManager {
    #[must_use]
    pub fn new(default_role: impl Into<String>, require_named_approver: bool) -> Self {
        Self {
            default_role: default_role.into(),
            require_named_approver,
        }
    }

    #[must_use]
    pub fn default_role(&self) -> &str {
        &self.default_role
    }

    /// Build a request with a fresh approval id
    ///
    /// `required_role` falls back to the configured default.
    #[must_use]
    pub fn request(
        &self,
        workflow_id: WorkflowId,
        step_id: StepId,
        required_role: Option<String>,
        plan_token_hash: ContentHash,
        reason: impl Into<String>,
    ) -> ApprovalRequest {
        ApprovalRequest {
            approval_id: ApprovalId::generate(),
            workflow_id,
            step_id,
            reason: reason.into(),
            required_role: required_role.unwrap_or_else(|| self.default_role.clone()),
            plan_token_hash,
            engine_output: None,
            evidence: None,
        }
    }

    /// Validate `response` against `record` and produce the resolved record
    ///
    /// Checks, in order: the id is not already resolved, the id is pending,
    /// the pending approval and any plan the response claims both match the
    /// workflow's current plan token, and an approver is named if required.
    ///
    /// # Errors
    /// Returns the first [`ApprovalError`] found
    pub fn respond(
        &self,
        record: &WorkflowStateRecord,
        response: &ApprovalResponse,
        now: DateTime<Utc>,
    ) -> Result<ApprovalRecord, ApprovalError> {
        let id = &response.approval_id;
        if record.approval(id).is_some() {
            return Err(ApprovalError::AlreadyResolved(id.clone()));
        }
        let pending = record
            .pending_approval(id)
            .ok_or_else(|| ApprovalError::UnknownApproval(id.clone()))?;

        let replay = |bound: ContentHash| ApprovalError::PlanTokenReplayRejected {
            approval_id: id.clone(),
            bound,
            current: record
                .plan_token_hash
                .map_or_else(|| "none".to_string(), |h| h.to_string()),
        };
        let current = record
            .plan_token_hash
            .ok_or_else(|| replay(pending.plan_token_hash))?;
        if !pending.plan_token_hash.ct_eq(&current) {
            return Err(replay(pending.plan_token_hash));
        }
        if let Some(claimed) = response.plan_token_hash {
            if !claimed.ct_eq(&current) {
                return Err(replay(claimed));
            }
        }

        let approver = match response.approver.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ if self.require_named_approver => {
                return Err(ApprovalError::MissingApprover(id.clone()));
            }
            _ => UNSPECIFIED_APPROVER.to_string(),
        };

        Ok(ApprovalRecord {
            approval_id: id.clone(),
            step_id: pending.step_id.clone(),
            plan_token_hash: current,
            approved: response.approved,
            approver,
            approved_at: now,
            reason: response.reason.clone(),
            evidence_hashes: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::ApprovalRequestedData;
    use cabin_protocol::State;

    fn record(current: ContentHash, pending: ContentHash) -> WorkflowStateRecord {
        let now = Utc::now();
        WorkflowStateRecord {
            workflow_id: "wf1".parse().unwrap(),
            current_state: State::AwaitingApproval,
            plan_token_hash: Some(current),
            plan_token: None,
            last_decision: None,
            current_step: None,
            steps_completed: Vec::new(),
            steps_pending: Vec::new(),
            approvals: Vec::new(),
            pending_approvals: vec![ApprovalRequestedData {
                approval_id: id(),
                step_id: "approval-1".parse().unwrap(),
                required_role: "operator".into(),
                plan_token_hash: pending,
                reason: "review".into(),
            }],
            artifacts: Vec::new(),
            policy_evaluations: Vec::new(),
            failure: None,
            metadata: Default::default(),
            created_at: now,
            updated_at: now,
            last_sequence: 8,
        }
    }

    fn id() -> ApprovalId {
        "apr-1".parse().unwrap()
    }

    fn h(s: &str) -> ContentHash {
        ContentHash::compute(s.as_bytes())
    }

    #[test]
    fn request_uses_default_role() {
        let manager = ApprovalManager::new("release-manager", false);
        let request = manager.request(
            "wf1".parse().unwrap(),
            "approval-1".parse().unwrap(),
            None,
            h("plan"),
            "review",
        );
        assert_eq!(request.required_role, "release-manager");
        assert!(request.approval_id.as_str().starts_with("apr-"));
    }

    #[test]
    fn accepts_matching_response() {
        let manager = ApprovalManager::default();
        let now = Utc::now();
        let resolved = manager
            .respond(
                &record(h("plan"), h("plan")),
                &ApprovalResponse::approve(id(), "alice").bound_to(h("plan")),
                now,
            )
            .unwrap();
        assert!(resolved.approved);
        assert_eq!(resolved.approver, "alice");
        assert_eq!(resolved.approved_at, now);
        assert_eq!(resolved.plan_token_hash, h("plan"));
    }

    #[test]
    fn stale_plan_is_a_replay() {
        let manager = ApprovalManager::default();
        let err = manager
            .respond(
                &record(h("plan-2"), h("plan-1")),
                &ApprovalResponse::approve(id(), "alice"),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, ApprovalError::PlanTokenReplayRejected { .. }));
    }

    #[test]
    fn claimed_plan_must_match() {
        let manager = ApprovalManager::default();
        let err = manager
            .respond(
                &record(h("plan"), h("plan")),
                &ApprovalResponse::approve(id(), "alice").bound_to(h("other")),
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ApprovalError::PlanTokenReplayRejected { bound, .. } if bound == h("other")
        ));
    }

    #[test]
    fn unknown_and_resolved_ids() {
        let manager = ApprovalManager::default();
        let mut rec = record(h("plan"), h("plan"));
        let other: ApprovalId = "apr-2".parse().unwrap();
        assert_eq!(
            manager.respond(&rec, &ApprovalResponse::approve(other.clone(), "a"), Utc::now()),
            Err(ApprovalError::UnknownApproval(other))
        );

        let resolved = manager
            .respond(&rec, &ApprovalResponse::approve(id(), "a"), Utc::now())
            .unwrap();
        rec.pending_approvals.clear();
        rec.approvals.push(resolved);
        assert_eq!(
            manager.respond(&rec, &ApprovalResponse::approve(id(), "a"), Utc::now()),
            Err(ApprovalError::AlreadyResolved(id()))
        );
    }

    #[test]
    fn approver_policy() {
        let rec = record(h("plan"), h("plan"));
        let mut anonymous = ApprovalResponse::approve(id(), "");
        anonymous.approver = None;

        let lenient = ApprovalManager::default()
            .respond(&rec, &anonymous, Utc::now())
            .unwrap();
        assert_eq!(lenient.approver, UNSPECIFIED_APPROVER);

        assert_eq!(
            ApprovalManager::new("operator", true).respond(&rec, &anonymous, Utc::now()),
            Err(ApprovalError::MissingApprover(id()))
        );
    }
}
