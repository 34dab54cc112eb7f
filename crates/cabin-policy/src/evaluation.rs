//! Individual policy evaluations

use crate::error::PolicyError;
use cabin_artifact::{ContentHash, HashError, MetaMap, StepId};
use cabin_protocol::{Decision, GatewayKind, GatewayResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Kind of system that produced an evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicySource {
    Opa,
    Onnx,
    LlmGateway,
    McpGateway,
    Custom,
}

impl PolicySource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Opa => "opa",
            Self::Onnx => "onnx",
            Self::LlmGateway => "llm_gateway",
            Self::McpGateway => "mcp_gateway",
            Self::Custom => "custom",
        }
    }
}

impl Display for PolicySource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<GatewayKind> for PolicySource {
    fn from(kind: GatewayKind) -> Self {
        match kind {
            GatewayKind::Llm => Self::LlmGateway,
            GatewayKind::Mcp => Self::McpGateway,
        }
    }
}

/// One policy's verdict
///
/// `severity` travels on the wire next to `decision`; the pair must agree.
/// Use [`PolicyEvaluation::new`] to get a consistent pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEvaluation {
    pub source: PolicySource,
    pub policy_id: String,
    pub decision: Decision,
    pub severity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<MetaMap>,
    pub evaluated_at: DateTime<Utc>,
}

impl PolicyEvaluation {
    #[must_use]
    pub fn new(
        source: PolicySource,
        policy_id: impl Into<String>,
        decision: Decision,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            source,
            policy_id: policy_id.into(),
            decision,
            severity: decision.severity(),
            reason: None,
            evidence: None,
            evaluated_at,
        }
    }

    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    #[must_use]
    pub fn with_evidence(mut self, evidence: MetaMap) -> Self {
        self.evidence = Some(evidence);
        self
    }

    /// Fail-closed evaluation standing in for a backend that did not answer
    #[must_use]
    pub fn fail_closed(
        source: PolicySource,
        policy_id: impl Into<String>,
        reason: impl Into<String>,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        Self::new(source, policy_id, Decision::Deny, evaluated_at).with_reason(reason)
    }

    /// Evaluation derived from a gateway verdict
    ///
    /// Violations and warnings are folded into `reason`; the request id
    /// and subject land in `evidence`.
    #[must_use]
    pub fn from_gateway<R: GatewayResponse + ?Sized>(
        response: &R,
        policy_id: impl Into<String>,
        evaluated_at: DateTime<Utc>,
    ) -> Self {
        let verdict = response.verdict();
        let mut evidence = MetaMap::new();
        evidence.insert("request_id".into(), response.request_id().into());
        if let Some(subject) = response.subject() {
            evidence.insert("subject".into(), subject.into());
        }
        let notes: Vec<&str> = verdict
            .violations
            .iter()
            .chain(verdict.warnings.iter())
            .map(String::as_str)
            .collect();
        let mut evaluation = Self::new(
            response.kind().into(),
            policy_id,
            verdict.decision,
            evaluated_at,
        )
        .with_evidence(evidence);
        if !notes.is_empty() {
            evaluation.reason = Some(notes.join("; "));
        }
        evaluation
    }

    /// Check that `severity` matches `decision`
    ///
    /// # Errors
    /// Returns [`PolicyError::InconsistentSeverity`]
    pub fn check_consistent(&self) -> Result<(), PolicyError> {
        if self.severity == self.decision.severity() {
            Ok(())
        } else {
            Err(PolicyError::InconsistentSeverity {
                policy_id: self.policy_id.clone(),
                decision: self.decision,
                severity: self.severity,
            })
        }
    }

    /// Hash of the evidence map, if any
    ///
    /// # Errors
    /// Returns error if evidence cannot be serialized
    pub fn evidence_hash(&self) -> Result<Option<ContentHash>, HashError> {
        self.evidence
            .as_ref()
            .map(ContentHash::compute_serializable)
            .transpose()
    }

    /// Durable record of this evaluation for `step_id`
    ///
    /// # Errors
    /// Returns error if evidence cannot be hashed
    pub fn to_record(
        &self,
        evaluation_id: impl Into<String>,
        step_id: StepId,
    ) -> Result<PolicyEvaluationRecord, HashError> {
        Ok(PolicyEvaluationRecord {
            evaluation_id: evaluation_id.into(),
            step_id,
            policy_name: self.policy_id.clone(),
            source: self.source,
            decision: self.decision,
            evaluated_at: self.evaluated_at,
            reason: self.reason.clone(),
            evidence_hashes: self.evidence_hash()?.into_iter().collect(),
        })
    }
}

/// Durable policy evaluation record kept in the workflow state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyEvaluationRecord {
    pub evaluation_id: String,
    pub step_id: StepId,
    pub policy_name: String,
    pub source: PolicySource,
    pub decision: Decision,
    pub evaluated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence_hashes: Vec<ContentHash>,
}
