//! Preflight request and result

use crate::decision::Decision;
use crate::engine::{EngineOutput, Mode};
use crate::plan::PlanToken;
use cabin_artifact::{ContentHash, MetaMap, StepId, WorkflowId};
use serde::{Deserialize, Serialize};

/// Supporting file handed to policy backends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightEvidence {
    pub name: String,
    pub path: String,
    pub hash: ContentHash,
}

/// Everything a policy backend sees for one preflight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreflightInput {
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
    pub mode: Mode,
    pub engine_output: EngineOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Vec<PreflightEvidence>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<MetaMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token: Option<PlanToken>,
}

/// What an approval would need
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightRequires {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Aggregate preflight verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightOutput {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<PreflightRequires>,
}

impl PreflightOutput {
    #[must_use]
    pub fn new(decision: Decision) -> Self {
        Self {
            decision,
            violations: Vec::new(),
            warnings: Vec::new(),
            requires: None,
        }
    }
}
