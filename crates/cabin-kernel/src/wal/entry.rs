//! WAL entries and their checksum codec
//!
//! On disk an entry is one JSON object:
//! `{sequence, timestamp, workflow_id, entry_type, data, checksum}`.
//! `entry_type` names the payload shape and `data` holds the payload fields.
//! The checksum is SHA-256 over the canonical JSON of every other field
//! (object keys sorted), so any edit to a persisted line is detected.

use super::WalError;
use cabin_artifact::{ApprovalId, ArtifactKind, ContentHash, MetaMap, StepId, WorkflowId};
use cabin_policy::PolicyEvaluationRecord;
use cabin_protocol::{ApprovalRecord, Decision, PlanToken, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};

/// Kind of workflow step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    FlightPlan,
    Preflight,
    Approval,
    TakeOff,
}

/// Why a workflow failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Cancelled,
    PolicyDenied,
    ApprovalDenied,
    Integrity,
    EngineFailure,
}

/// Discriminant of [`WalEntryData`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalEntryType {
    WorkflowStarted,
    StepStarted,
    StepCompleted,
    ApprovalRequested,
    ApprovalReceived,
    ArtifactCreated,
    PolicyEvaluated,
    WorkflowCompleted,
    WorkflowFailed,
}

impl WalEntryType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowStarted => "workflow_started",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::ApprovalRequested => "approval_requested",
            Self::ApprovalReceived => "approval_received",
            Self::ArtifactCreated => "artifact_created",
            Self::PolicyEvaluated => "policy_evaluated",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
        }
    }
}

impl Display for WalEntryType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStartedData {
    pub initial_state: State,
    #[serde(default)]
    pub context: MetaMap,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepStartedData {
    pub step_id: StepId,
    pub step_type: StepType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_plan_token: Option<ContentHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCompletedData {
    pub step_id: StepId,
    pub step_type: StepType,
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Set when a flight-plan step bound its token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token: Option<PlanToken>,
    /// Set when a preflight step reached its aggregate decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
}

/// Pending approval, as recorded when requested
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequestedData {
    pub approval_id: ApprovalId,
    pub step_id: StepId,
    pub required_role: String,
    pub plan_token_hash: ContentHash,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalReceivedData {
    pub approval_id: ApprovalId,
    pub step_id: StepId,
    pub approved: bool,
    pub approver: String,
    pub plan_token_hash: ContentHash,
    pub responded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub evidence_hashes: Vec<ContentHash>,
}

impl From<ApprovalRecord> for ApprovalReceivedData {
    fn from(record: ApprovalRecord) -> Self {
        Self {
            approval_id: record.approval_id,
            step_id: record.step_id,
            approved: record.approved,
            approver: record.approver,
            plan_token_hash: record.plan_token_hash,
            responded_at: record.approved_at,
            reason: record.reason,
            evidence_hashes: record.evidence_hashes,
        }
    }
}

impl From<&ApprovalReceivedData> for ApprovalRecord {
    fn from(data: &ApprovalReceivedData) -> Self {
        Self {
            approval_id: data.approval_id.clone(),
            step_id: data.step_id.clone(),
            plan_token_hash: data.plan_token_hash,
            approved: data.approved,
            approver: data.approver.clone(),
            approved_at: data.responded_at,
            reason: data.reason.clone(),
            evidence_hashes: data.evidence_hashes.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactCreatedData {
    pub artifact_id: String,
    pub step_id: StepId,
    pub artifact_hash: ContentHash,
    pub artifact_type: ArtifactKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MetaMap>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowCompletedData {
    pub final_state: State,
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowFailedData {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<StepId>,
    pub kind: FailureKind,
}

/// Payload of a WAL entry
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WalEntryData {
    WorkflowStarted(WorkflowStartedData),
    StepStarted(StepStartedData),
    StepCompleted(StepCompletedData),
    ApprovalRequested(ApprovalRequestedData),
    ApprovalReceived(ApprovalReceivedData),
    ArtifactCreated(ArtifactCreatedData),
    PolicyEvaluated(PolicyEvaluationRecord),
    WorkflowCompleted(WorkflowCompletedData),
    WorkflowFailed(WorkflowFailedData),
}

impl WalEntryData {
    #[must_use]
    pub fn entry_type(&self) -> WalEntryType {
        match self {
            Self::WorkflowStarted(_) => WalEntryType::WorkflowStarted,
            Self::StepStarted(_) => WalEntryType::StepStarted,
            Self::StepCompleted(_) => WalEntryType::StepCompleted,
            Self::ApprovalRequested(_) => WalEntryType::ApprovalRequested,
            Self::ApprovalReceived(_) => WalEntryType::ApprovalReceived,
            Self::ArtifactCreated(_) => WalEntryType::ArtifactCreated,
            Self::PolicyEvaluated(_) => WalEntryType::PolicyEvaluated,
            Self::WorkflowCompleted(_) => WalEntryType::WorkflowCompleted,
            Self::WorkflowFailed(_) => WalEntryType::WorkflowFailed,
        }
    }

    /// Decode a payload whose shape is named by `entry_type`
    ///
    /// # Errors
    /// Returns error if `data` does not match the shape
    pub fn from_parts(entry_type: WalEntryType, data: Value) -> Result<Self, serde_json::Error> {
        Ok(match entry_type {
            WalEntryType::WorkflowStarted => Self::WorkflowStarted(serde_json::from_value(data)?),
            WalEntryType::StepStarted => Self::StepStarted(serde_json::from_value(data)?),
            WalEntryType::StepCompleted => Self::StepCompleted(serde_json::from_value(data)?),
            WalEntryType::ApprovalRequested => {
                Self::ApprovalRequested(serde_json::from_value(data)?)
            }
            WalEntryType::ApprovalReceived => Self::ApprovalReceived(serde_json::from_value(data)?),
            WalEntryType::ArtifactCreated => Self::ArtifactCreated(serde_json::from_value(data)?),
            WalEntryType::PolicyEvaluated => Self::PolicyEvaluated(serde_json::from_value(data)?),
            WalEntryType::WorkflowCompleted => {
                Self::WorkflowCompleted(serde_json::from_value(data)?)
            }
            WalEntryType::WorkflowFailed => Self::WorkflowFailed(serde_json::from_value(data)?),
        })
    }
}

/// One committed WAL record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WalEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub workflow_id: WorkflowId,
    pub entry_type: WalEntryType,
    pub data: WalEntryData,
    pub checksum: ContentHash,
}

/// Entry fields covered by the checksum
#[derive(Serialize)]
struct Unsealed<'a> {
    sequence: u64,
    timestamp: &'a DateTime<Utc>,
    workflow_id: &'a WorkflowId,
    entry_type: WalEntryType,
    data: &'a WalEntryData,
}

#[derive(Deserialize)]
struct RawWalEntry {
    sequence: u64,
    timestamp: DateTime<Utc>,
    workflow_id: WorkflowId,
    entry_type: WalEntryType,
    data: Value,
}

/// Canonical bytes of a JSON value: compact, object keys sorted
fn canonical_bytes(value: &Value) -> Result<Vec<u8>, serde_json::Error> {
    // serde_json's default map is ordered by key
    serde_json::to_vec(value)
}

impl WalEntry {
    /// Build an entry and compute its checksum
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized
    pub fn seal(
        sequence: u64,
        timestamp: DateTime<Utc>,
        workflow_id: WorkflowId,
        data: WalEntryData,
    ) -> Result<Self, WalError> {
        let entry_type = data.entry_type();
        let unsealed = serde_json::to_value(Unsealed {
            sequence,
            timestamp: &timestamp,
            workflow_id: &workflow_id,
            entry_type,
            data: &data,
        })?;
        let checksum = ContentHash::compute(&canonical_bytes(&unsealed)?);
        Ok(Self {
            sequence,
            timestamp,
            workflow_id,
            entry_type,
            data,
            checksum,
        })
    }

    /// Recompute the checksum from this entry's fields
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized
    pub fn verify(&self) -> Result<bool, WalError> {
        let resealed = Self::seal(
            self.sequence,
            self.timestamp,
            self.workflow_id.clone(),
            self.data.clone(),
        )?;
        Ok(resealed.checksum.ct_eq(&self.checksum))
    }

    /// Serialize to one JSON line (no trailing newline)
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn encode(&self) -> Result<String, WalError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and checksum-verify one persisted line
    ///
    /// `position` is the 1-based line number, used to name the entry when
    /// the line is too damaged to yield its own sequence.
    ///
    /// # Errors
    /// Returns [`WalError::CorruptedLogEntry`] on any parse or checksum
    /// failure
    pub fn decode(workflow_id: &WorkflowId, position: u64, line: &str) -> Result<Self, WalError> {
        let corrupted = |sequence: u64, reason: String| WalError::CorruptedLogEntry {
            workflow_id: workflow_id.to_string(),
            sequence,
            reason,
        };

        let mut value: Value = serde_json::from_str(line)
            .map_err(|e| corrupted(position, format!("unparseable entry: {e}")))?;
        let sequence = value
            .get("sequence")
            .and_then(Value::as_u64)
            .unwrap_or(position);
        let stored = value
            .as_object_mut()
            .and_then(|obj| obj.remove("checksum"))
            .ok_or_else(|| corrupted(sequence, "missing checksum".into()))?;
        let stored: ContentHash = serde_json::from_value(stored)
            .map_err(|e| corrupted(sequence, format!("malformed checksum: {e}")))?;

        let actual = ContentHash::compute(&canonical_bytes(&value)?);
        if !actual.ct_eq(&stored) {
            return Err(corrupted(
                sequence,
                format!("checksum mismatch: stored {}, computed {}", stored.short(), actual.short()),
            ));
        }

        let raw: RawWalEntry = serde_json::from_value(value)
            .map_err(|e| corrupted(sequence, format!("malformed entry: {e}")))?;
        let data = WalEntryData::from_parts(raw.entry_type, raw.data)
            .map_err(|e| corrupted(sequence, format!("malformed {} payload: {e}", raw.entry_type)))?;
        Ok(Self {
            sequence: raw.sequence,
            timestamp: raw.timestamp,
            workflow_id: raw.workflow_id,
            entry_type: raw.entry_type,
            data,
            checksum: stored,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf() -> WorkflowId {
        "wf1".parse().unwrap()
    }

    fn started() -> WalEntryData {
        WalEntryData::WorkflowStarted(WorkflowStartedData {
            initial_state: State::Init,
            context: MetaMap::new(),
        })
    }

    #[test]
    fn wire_shape_has_top_level_entry_type() {
        let entry = WalEntry::seal(1, Utc::now(), wf(), started()).unwrap();
        let json: Value = serde_json::from_str(&entry.encode().unwrap()).unwrap();
        assert_eq!(json["entry_type"], "workflow_started");
        assert_eq!(json["data"]["initial_state"], "INIT");
        assert!(json["data"].get("entry_type").is_none());
    }

    #[test]
    fn decode_accepts_own_encoding() {
        let data = WalEntryData::StepStarted(StepStartedData {
            step_id: "takeoff-1".parse().unwrap(),
            step_type: StepType::TakeOff,
            expected_plan_token: Some(ContentHash::compute(b"plan")),
        });
        let entry = WalEntry::seal(7, Utc::now(), wf(), data).unwrap();
        let decoded = WalEntry::decode(&wf(), 7, &entry.encode().unwrap()).unwrap();
        assert_eq!(decoded, entry);
        assert!(decoded.verify().unwrap());
    }

    #[test]
    fn float_payload_survives_decode() {
        // Shortest-form output that the approximate float parser misreads
        let score = 1.071_566_039_146_582_6e-75;
        let mut context = MetaMap::new();
        context.insert("score".into(), score.into());
        let data = WalEntryData::WorkflowStarted(WorkflowStartedData {
            initial_state: State::Init,
            context,
        });
        let entry = WalEntry::seal(1, Utc::now(), wf(), data).unwrap();
        let decoded = WalEntry::decode(&wf(), 1, &entry.encode().unwrap()).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn edited_field_is_detected() {
        let data = WalEntryData::WorkflowFailed(WorkflowFailedData {
            error: "cancelled by operator".into(),
            failed_step: None,
            kind: FailureKind::Cancelled,
        });
        let line = WalEntry::seal(3, Utc::now(), wf(), data)
            .unwrap()
            .encode()
            .unwrap();
        let tampered = line.replace("cancelled by operator", "all good");
        assert!(matches!(
            WalEntry::decode(&wf(), 3, &tampered),
            Err(WalError::CorruptedLogEntry { sequence: 3, .. })
        ));
    }

    #[test]
    fn added_field_is_detected() {
        let line = WalEntry::seal(1, Utc::now(), wf(), started())
            .unwrap()
            .encode()
            .unwrap();
        let mut value: Value = serde_json::from_str(&line).unwrap();
        value["data"]["injected"] = Value::Bool(true);
        assert!(WalEntry::decode(&wf(), 1, &value.to_string()).is_err());
    }

    #[test]
    fn garbage_line_reports_position() {
        assert!(matches!(
            WalEntry::decode(&wf(), 4, "{not json"),
            Err(WalError::CorruptedLogEntry { sequence: 4, .. })
        ));
    }
}
