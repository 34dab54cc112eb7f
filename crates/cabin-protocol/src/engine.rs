//! Engine boundary messages
//!
//! The orchestrator hands an [`EngineInput`] to an engine process and reads
//! back an [`EngineOutput`]. The engine is untrusted: every output passes
//! [`EngineOutput::validate`] before anything is written to the WAL, and the
//! hashes it reports are recomputed from storage by the caller.

use crate::error::ValidationError;
use cabin_artifact::{ContentHash, MetaMap, MetaValue, StepId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{self, Display, Formatter};

/// Execution mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Planning: propose artifacts without side effects
    #[serde(rename = "flight-plan")]
    FlightPlan,
    /// Execution of a previously bound plan
    #[serde(rename = "take-off")]
    TakeOff,
}

impl Mode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FlightPlan => "flight-plan",
            Self::TakeOff => "take-off",
        }
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine-reported run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineStatus {
    Success,
    Failure,
}

/// Workflow coordinates of an engine run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineMeta {
    pub workflow_id: WorkflowId,
    pub step_id: StepId,
}

/// Orchestrator-provided run context
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOrchestrator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_index: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts_salt: Option<String>,
}

/// Input delivered to an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineInput {
    pub protocol_version: String,
    pub mode: Mode,
    pub meta: EngineMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<MetaMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<MetaMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_secrets: Option<Vec<String>>,
    /// Ephemeral workload identity (OIDC, JWT), preferred over static secrets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<MetaMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator: Option<EngineOrchestrator>,
    /// Set in take-off mode: the plan the engine must execute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_plan_token: Option<ContentHash>,
}

impl EngineInput {
    /// Minimal input for a step
    #[must_use]
    pub fn new(protocol_version: impl Into<String>, mode: Mode, meta: EngineMeta) -> Self {
        Self {
            protocol_version: protocol_version.into(),
            mode,
            meta,
            config: None,
            secrets: None,
            allowed_secrets: None,
            identity_token: None,
            context: None,
            orchestrator: None,
            expected_plan_token: None,
        }
    }
}

/// One artifact an engine claims to have produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineArtifact {
    pub name: String,
    pub role: String,
    pub path: String,
    pub hash: ContentHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineMetric {
    pub name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<MetaMap>,
}

/// Output read back from an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineOutput {
    pub protocol_version: String,
    pub engine_id: String,
    pub mode: Mode,
    pub receipt_id: String,
    pub status: EngineStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<MetaValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Vec<EngineArtifact>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Vec<EngineMetric>>,
    /// Plan token the engine believes it produced or executed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token: Option<ContentHash>,
}

impl EngineOutput {
    /// Artifacts as a slice, empty when the engine reported none
    #[must_use]
    pub fn artifacts(&self) -> &[EngineArtifact] {
        self.artifacts.as_deref().unwrap_or_default()
    }

    /// Structural validation for an output expected in `mode`
    ///
    /// Checks identity fields, mode and artifact name uniqueness. Status is
    /// not checked here; see [`EngineOutput::require_success`].
    ///
    /// # Errors
    /// Returns the first [`ValidationError`] found
    pub fn validate(&self, mode: Mode) -> Result<(), ValidationError> {
        if self.protocol_version.trim().is_empty() {
            return Err(ValidationError::MissingField("protocol_version"));
        }
        if self.engine_id.trim().is_empty() {
            return Err(ValidationError::MissingField("engine_id"));
        }
        if self.receipt_id.trim().is_empty() {
            return Err(ValidationError::MissingField("receipt_id"));
        }
        if self.mode != mode {
            return Err(ValidationError::ModeMismatch {
                expected: mode.to_string(),
                actual: self.mode.to_string(),
            });
        }
        let mut seen = HashSet::new();
        for artifact in self.artifacts() {
            if artifact.name.trim().is_empty() {
                return Err(ValidationError::MissingField("artifacts[].name"));
            }
            if artifact.path.trim().is_empty() {
                return Err(ValidationError::MissingField("artifacts[].path"));
            }
            if !seen.insert(artifact.name.as_str()) {
                return Err(ValidationError::DuplicateArtifact(artifact.name.clone()));
            }
        }
        Ok(())
    }

    /// Fail unless the engine reported success
    ///
    /// # Errors
    /// Returns [`ValidationError::EngineFailed`] carrying the engine's error
    pub fn require_success(&self) -> Result<(), ValidationError> {
        match self.status {
            EngineStatus::Success => Ok(()),
            EngineStatus::Failure => Err(ValidationError::EngineFailed(
                self.error
                    .clone()
                    .unwrap_or_else(|| "no error message".to_string()),
            )),
        }
    }

    /// Fail unless the engine speaks `expected`
    ///
    /// # Errors
    /// Returns [`ValidationError::ProtocolVersion`] on mismatch
    pub fn require_protocol(&self, expected: &str) -> Result<(), ValidationError> {
        if self.protocol_version == expected {
            Ok(())
        } else {
            Err(ValidationError::ProtocolVersion {
                expected: expected.to_string(),
                actual: self.protocol_version.clone(),
            })
        }
    }
}
