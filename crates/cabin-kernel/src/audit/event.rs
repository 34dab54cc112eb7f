//! Audit event schema

use cabin_artifact::{ApprovalId, ContentHash, HashError, PlanArtifactHash, StepId, WorkflowId};
use cabin_policy::{AggregateDecision, AggregationMethod, PolicyEvaluation};
use cabin_protocol::{
    Decision, EngineArtifact, EngineOutput, EngineStatus, GatewayKind, GatewayResponse, Mode,
    PlanToken, State,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event severity, least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditWorkflow {
    pub workflow_id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
}

impl AuditWorkflow {
    #[must_use]
    pub fn new(workflow_id: WorkflowId, step_id: Option<StepId>) -> Self {
        Self {
            workflow_id,
            step_id,
            mode: None,
        }
    }

    #[must_use]
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEngine {
    pub engine_id: String,
    pub receipt_id: String,
    pub status: EngineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&EngineOutput> for AuditEngine {
    fn from(output: &EngineOutput) -> Self {
        Self {
            engine_id: output.engine_id.clone(),
            receipt_id: output.receipt_id.clone(),
            status: output.status,
            error: output.error.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditArtifact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub hash: ContentHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl From<&EngineArtifact> for AuditArtifact {
    fn from(artifact: &EngineArtifact) -> Self {
        Self {
            name: artifact.name.clone(),
            role: Some(artifact.role.clone()),
            path: Some(artifact.path.clone()),
            hash: artifact.hash,
            size: artifact.size,
        }
    }
}

impl From<&PlanArtifactHash> for AuditArtifact {
    fn from(artifact: &PlanArtifactHash) -> Self {
        Self {
            name: artifact.name.clone(),
            role: None,
            path: None,
            hash: artifact.hash,
            size: artifact.size,
        }
    }
}

/// Aggregate policy outcome at the time it was decided
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditPolicy {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation_method: Option<AggregationMethod>,
    pub policy_evaluations: Vec<PolicyEvaluation>,
    #[serde(default)]
    pub violations: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub workflow_state: State,
}

impl AuditPolicy {
    #[must_use]
    pub fn from_aggregate(aggregate: &AggregateDecision, workflow_state: State) -> Self {
        Self {
            decision: aggregate.decision,
            aggregation_method: Some(aggregate.method),
            policy_evaluations: aggregate.evaluations.clone(),
            violations: aggregate.violations.clone(),
            warnings: aggregate.warnings.clone(),
            workflow_state,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditApproval {
    pub approval_id: ApprovalId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Result of an integrity comparison
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditIntegrity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_plan_token: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_plan_token: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token_match: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_match: Option<bool>,
    #[serde(default)]
    pub differences: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditGateway {
    pub gateway_type: GatewayKind,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub policy_decision: Decision,
}

impl AuditGateway {
    /// Audit record for a gateway verdict
    ///
    /// The response's subject is the routed model for LLM traffic and the
    /// tool for MCP traffic.
    #[must_use]
    pub fn from_response<R: GatewayResponse + ?Sized>(response: &R) -> Self {
        let subject = response.subject().map(str::to_string);
        let kind = response.kind();
        let (model, tool) = match kind {
            GatewayKind::Llm => (subject, None),
            GatewayKind::Mcp => (None, subject),
        };
        Self {
            gateway_type: kind,
            request_id: response.request_id().to_string(),
            model,
            tool,
            policy_decision: response.verdict().decision,
        }
    }
}

/// One entry of the audit ledger
///
/// `chain_hash`, `signature` and `signature_key_ref` are filled in by
/// [`AuditChain::append`](super::AuditChain::append) and are excluded from
/// [`AuditEvent::content_hash`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub workflow_state: State,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature_key_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<AuditWorkflow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<AuditEngine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token: Option<PlanToken>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<AuditArtifact>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<AuditPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<AuditApproval>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_check: Option<AuditIntegrity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<AuditGateway>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<AuditSeverity>,
}

impl AuditEvent {
    /// New event with a fresh id and nothing attached
    #[must_use]
    pub fn new(
        event_type: impl Into<String>,
        workflow_state: State,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp,
            event_type: event_type.into(),
            workflow_state,
            chain_hash: None,
            signature: None,
            signature_key_ref: None,
            workflow: None,
            engine: None,
            plan_token: None,
            artifacts: None,
            policy: None,
            approval: None,
            integrity_check: None,
            gateway: None,
            message: None,
            severity: None,
        }
    }

    #[must_use]
    pub fn with_workflow(mut self, workflow: AuditWorkflow) -> Self {
        self.workflow = Some(workflow);
        self
    }

    #[must_use]
    pub fn with_engine(mut self, engine: AuditEngine) -> Self {
        self.engine = Some(engine);
        self
    }

    #[must_use]
    pub fn with_plan_token(mut self, token: PlanToken) -> Self {
        self.plan_token = Some(token);
        self
    }

    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<AuditArtifact>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: AuditPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    #[must_use]
    pub fn with_approval(mut self, approval: AuditApproval) -> Self {
        self.approval = Some(approval);
        self
    }

    #[must_use]
    pub fn with_integrity(mut self, integrity: AuditIntegrity) -> Self {
        self.integrity_check = Some(integrity);
        self
    }

    #[must_use]
    pub fn with_gateway(mut self, gateway: AuditGateway) -> Self {
        self.gateway = Some(gateway);
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: AuditSeverity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Hash of the event's content, excluding chain and signature fields
    ///
    /// # Errors
    /// Returns error if the event cannot be serialized
    pub fn content_hash(&self) -> Result<ContentHash, HashError> {
        let mut content = self.clone();
        content.chain_hash = None;
        content.signature = None;
        content.signature_key_ref = None;
        // Through Value so object keys come out sorted
        let value = serde_json::to_value(&content)?;
        ContentHash::compute_serializable(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cabin_protocol::{GatewayVerdict, LlmGatewayResponse};

    #[test]
    fn content_hash_ignores_chain_fields() {
        let event = AuditEvent::new("workflow_started", State::PlanRunning, Utc::now());
        let mut sealed = event.clone();
        sealed.chain_hash = Some(ContentHash::compute(b"chain"));
        sealed.signature = Some("00".into());
        sealed.signature_key_ref = Some("key-1".into());
        assert_eq!(event.content_hash().unwrap(), sealed.content_hash().unwrap());

        let edited = event.clone().with_message("edited");
        assert_ne!(event.content_hash().unwrap(), edited.content_hash().unwrap());
    }

    #[test]
    fn severity_wire_names() {
        assert_eq!(
            serde_json::to_string(&AuditSeverity::Warning).unwrap(),
            "\"warning\""
        );
        assert!(AuditSeverity::Critical > AuditSeverity::Error);
    }

    #[test]
    fn gateway_record_from_llm_response() {
        let response = LlmGatewayResponse {
            request_id: "req-1".into(),
            timestamp: Utc::now(),
            verdict: GatewayVerdict::new(Decision::Warn),
            routed_model: Some("gpt-4o-mini".into()),
            rewritten_input: None,
            gateway_payload: None,
        };
        let record = AuditGateway::from_response(&response);
        assert_eq!(record.gateway_type, GatewayKind::Llm);
        assert_eq!(record.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(record.tool, None);
        assert_eq!(record.policy_decision, Decision::Warn);
    }
}
