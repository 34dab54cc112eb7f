//! Pure reducer from WAL entries to a workflow state record
//!
//! Each entry walks a fixed path of lifecycle states from the current one,
//! and every hop is checked against the transition table. Folding reads no
//! clock and draws no randomness: the same entries always give the same
//! record.

use super::entry::{
    ApprovalRequestedData, StepType, WalEntry, WalEntryData, WalEntryType, WorkflowFailedData,
    WorkflowStartedData,
};
use crate::state_machine::{validate_transition, StateMachineError};
use cabin_artifact::{ApprovalId, ArtifactRecord, ContentHash, MetaMap, StepId, WorkflowId};
use cabin_policy::PolicyEvaluationRecord;
use cabin_protocol::{ApprovalRecord, Decision, PlanToken, State, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a sequence of entries does not describe a valid workflow
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FoldError {
    #[error("no WAL entries")]
    Empty,

    #[error("log must open with workflow_started at sequence 1, found {entry_type} at {sequence}")]
    MissingStart {
        sequence: u64,
        entry_type: WalEntryType,
    },

    #[error("workflow_started must start in INIT, found {0}")]
    BadInitialState(State),

    #[error("entry {sequence} belongs to workflow {found}, expected {expected}")]
    WorkflowMismatch {
        sequence: u64,
        expected: WorkflowId,
        found: WorkflowId,
    },

    #[error("expected sequence {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("entry {sequence} ({entry_type}): {source}")]
    Transition {
        sequence: u64,
        entry_type: WalEntryType,
        #[source]
        source: StateMachineError,
    },

    #[error("entry {sequence} ({entry_type}) not valid in state {state}: {reason}")]
    UnexpectedEntry {
        sequence: u64,
        entry_type: WalEntryType,
        state: State,
        reason: String,
    },
}

/// Materialized state of one workflow, rebuilt from its WAL
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowStateRecord {
    pub workflow_id: WorkflowId,
    pub current_state: State,
    pub plan_token_hash: Option<ContentHash>,
    pub plan_token: Option<PlanToken>,
    pub last_decision: Option<Decision>,
    pub current_step: Option<StepId>,
    pub steps_completed: Vec<StepId>,
    pub steps_pending: Vec<StepId>,
    pub approvals: Vec<ApprovalRecord>,
    pub pending_approvals: Vec<ApprovalRequestedData>,
    pub artifacts: Vec<ArtifactRecord>,
    pub policy_evaluations: Vec<PolicyEvaluationRecord>,
    pub failure: Option<WorkflowFailedData>,
    pub metadata: MetaMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_sequence: u64,
}

impl WorkflowStateRecord {
    /// Record produced by the opening `workflow_started` entry
    ///
    /// # Errors
    /// Returns error unless `sequence` is 1 and the initial state is INIT
    pub fn begin(
        workflow_id: WorkflowId,
        sequence: u64,
        timestamp: DateTime<Utc>,
        data: &WorkflowStartedData,
    ) -> Result<Self, FoldError> {
        if sequence != 1 {
            return Err(FoldError::MissingStart {
                sequence,
                entry_type: WalEntryType::WorkflowStarted,
            });
        }
        if data.initial_state != State::Init {
            return Err(FoldError::BadInitialState(data.initial_state));
        }
        validate_transition(State::Init, State::PlanRunning).map_err(|source| {
            FoldError::Transition {
                sequence,
                entry_type: WalEntryType::WorkflowStarted,
                source,
            }
        })?;
        Ok(Self {
            workflow_id,
            current_state: State::PlanRunning,
            plan_token_hash: None,
            plan_token: None,
            last_decision: None,
            current_step: None,
            steps_completed: Vec::new(),
            steps_pending: Vec::new(),
            approvals: Vec::new(),
            pending_approvals: Vec::new(),
            artifacts: Vec::new(),
            policy_evaluations: Vec::new(),
            failure: None,
            metadata: data.context.clone(),
            created_at: timestamp,
            updated_at: timestamp,
            last_sequence: sequence,
        })
    }

    /// Apply one committed entry
    ///
    /// # Errors
    /// Returns error if the entry belongs elsewhere, breaks the sequence or
    /// implies an illegal transition. On error `self` may be partially
    /// updated and must be discarded.
    pub fn apply(&mut self, entry: &WalEntry) -> Result<(), FoldError> {
        if entry.workflow_id != self.workflow_id {
            return Err(FoldError::WorkflowMismatch {
                sequence: entry.sequence,
                expected: self.workflow_id.clone(),
                found: entry.workflow_id.clone(),
            });
        }
        self.apply_parts(entry.sequence, entry.timestamp, &entry.data)
    }

    /// Apply an entry given as its parts, before it has been sealed
    ///
    /// # Errors
    /// Same as [`WorkflowStateRecord::apply`]
    pub fn apply_parts(
        &mut self,
        sequence: u64,
        timestamp: DateTime<Utc>,
        data: &WalEntryData,
    ) -> Result<(), FoldError> {
        let expected = self.last_sequence + 1;
        if sequence != expected {
            return Err(FoldError::SequenceGap {
                expected,
                found: sequence,
            });
        }
        let mut step = Step {
            record: self,
            sequence,
            entry_type: data.entry_type(),
        };
        step.apply(timestamp, data)?;
        self.updated_at = timestamp;
        self.last_sequence = sequence;
        Ok(())
    }

    /// Externally visible state
    #[must_use]
    pub fn workflow_state(&self) -> WorkflowState {
        WorkflowState {
            state: self.current_state,
            workflow_id: self.workflow_id.clone(),
            step_id: self.current_step.clone(),
            last_decision: self.last_decision,
            plan_token_hash: self.plan_token_hash,
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    #[must_use]
    pub fn pending_approval(&self, approval_id: &ApprovalId) -> Option<&ApprovalRequestedData> {
        self.pending_approvals
            .iter()
            .find(|p| &p.approval_id == approval_id)
    }

    #[must_use]
    pub fn approval(&self, approval_id: &ApprovalId) -> Option<&ApprovalRecord> {
        self.approvals.iter().find(|a| &a.approval_id == approval_id)
    }
}

/// One entry being applied
struct Step<'a> {
    record: &'a mut WorkflowStateRecord,
    sequence: u64,
    entry_type: WalEntryType,
}

impl Step<'_> {
    fn apply(&mut self, timestamp: DateTime<Utc>, data: &WalEntryData) -> Result<(), FoldError> {
        match data {
            WalEntryData::WorkflowStarted(_) => Err(self.unexpected("workflow already started")),

            WalEntryData::StepStarted(started) => {
                match started.step_type {
                    StepType::FlightPlan => self.require(State::PlanRunning)?,
                    StepType::Preflight => self.walk(&[State::PreFlightRunning])?,
                    StepType::Approval => self.require(State::AwaitingApproval)?,
                    StepType::TakeOff => {
                        if let Some(expected) = &started.expected_plan_token {
                            let bound = self
                                .record
                                .plan_token_hash
                                .is_some_and(|h| h.ct_eq(expected));
                            if !bound {
                                return Err(self.unexpected("expected plan token does not match"));
                            }
                        }
                        self.walk(&[State::TakeoffRunning])?;
                    }
                }
                self.record.current_step = Some(started.step_id.clone());
                if !self.record.steps_pending.contains(&started.step_id) {
                    self.record.steps_pending.push(started.step_id.clone());
                }
                Ok(())
            }

            WalEntryData::StepCompleted(completed) => {
                match completed.step_type {
                    StepType::FlightPlan => {
                        let token = completed
                            .plan_token
                            .as_ref()
                            .ok_or_else(|| self.unexpected("flight plan completed without a token"))?;
                        self.walk(&[State::ArtifactsValidated, State::TokenCreated])?;
                        self.record.plan_token_hash = Some(token.token);
                        self.record.plan_token = Some(token.clone());
                    }
                    StepType::Preflight => {
                        let decision = completed
                            .decision
                            .ok_or_else(|| self.unexpected("preflight completed without a decision"))?;
                        if decision.proceeds() {
                            self.walk(&[State::PreflightComplete, State::ReadyForTakeoff])?;
                        } else {
                            self.walk(&[State::PreflightComplete])?;
                        }
                        self.record.last_decision = Some(decision);
                    }
                    StepType::Approval => self.require(State::ReadyForTakeoff)?,
                    StepType::TakeOff => self.walk(&[State::ExecutionComplete])?,
                }
                self.record.steps_pending.retain(|s| s != &completed.step_id);
                self.record.steps_completed.push(completed.step_id.clone());
                Ok(())
            }

            WalEntryData::ApprovalRequested(requested) => {
                if self.record.pending_approval(&requested.approval_id).is_some()
                    || self.record.approval(&requested.approval_id).is_some()
                {
                    return Err(self.unexpected("approval id already used"));
                }
                self.walk(&[State::AwaitingApproval])?;
                self.record.pending_approvals.push(requested.clone());
                Ok(())
            }

            WalEntryData::ApprovalReceived(received) => {
                self.require(State::AwaitingApproval)?;
                let index = self
                    .record
                    .pending_approvals
                    .iter()
                    .position(|p| p.approval_id == received.approval_id)
                    .ok_or_else(|| self.unexpected("no pending approval with that id"))?;
                if received.approved {
                    self.walk(&[State::Approved, State::ReadyForTakeoff])?;
                }
                self.record.pending_approvals.remove(index);
                self.record.approvals.push(received.into());
                Ok(())
            }

            WalEntryData::ArtifactCreated(created) => {
                match self.record.current_state {
                    State::PlanRunning => self.walk(&[State::PlanGenerated])?,
                    State::PlanGenerated | State::TakeoffRunning | State::ExecutionComplete => {}
                    _ => return Err(self.unexpected("artifacts are only recorded by engine steps")),
                }
                self.record.artifacts.push(ArtifactRecord {
                    artifact_id: created.artifact_id.clone(),
                    step_id: created.step_id.clone(),
                    artifact_hash: created.artifact_hash,
                    artifact_type: created.artifact_type.clone(),
                    created_at: timestamp,
                    metadata: created.metadata.clone(),
                });
                Ok(())
            }

            WalEntryData::PolicyEvaluated(evaluation) => {
                self.require(State::PreFlightRunning)?;
                self.record.policy_evaluations.push(evaluation.clone());
                Ok(())
            }

            WalEntryData::WorkflowCompleted(completed) => {
                if completed.final_state != State::Completed {
                    return Err(self.unexpected("final state must be COMPLETED"));
                }
                if self.record.current_state == State::TakeoffRunning {
                    self.walk(&[State::ExecutionComplete, State::Completed])?;
                } else {
                    self.walk(&[State::Completed])?;
                }
                self.record.current_step = None;
                Ok(())
            }

            WalEntryData::WorkflowFailed(failed) => {
                self.walk(&[State::Failed])?;
                self.record.failure = Some(failed.clone());
                Ok(())
            }
        }
    }

    fn walk(&mut self, path: &[State]) -> Result<(), FoldError> {
        let mut current = self.record.current_state;
        for &next in path {
            validate_transition(current, next).map_err(|source| FoldError::Transition {
                sequence: self.sequence,
                entry_type: self.entry_type,
                source,
            })?;
            current = next;
        }
        self.record.current_state = current;
        Ok(())
    }

    fn require(&self, state: State) -> Result<(), FoldError> {
        if self.record.current_state == state {
            Ok(())
        } else {
            Err(self.unexpected(&format!("requires {state}")))
        }
    }

    fn unexpected(&self, reason: &str) -> FoldError {
        FoldError::UnexpectedEntry {
            sequence: self.sequence,
            entry_type: self.entry_type,
            state: self.record.current_state,
            reason: reason.to_string(),
        }
    }
}

/// Fold a complete, ordered log into its state record
///
/// # Errors
/// Returns [`FoldError`] if the log is empty, does not open with
/// `workflow_started` at sequence 1, or walks an illegal transition
pub fn fold_state(entries: &[WalEntry]) -> Result<WorkflowStateRecord, FoldError> {
    let (first, rest) = entries.split_first().ok_or(FoldError::Empty)?;
    let WalEntryData::WorkflowStarted(started) = &first.data else {
        return Err(FoldError::MissingStart {
            sequence: first.sequence,
            entry_type: first.entry_type,
        });
    };
    let mut record =
        WorkflowStateRecord::begin(first.workflow_id.clone(), first.sequence, first.timestamp, started)?;
    for entry in rest {
        record.apply(entry)?;
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::entry::{
        ApprovalReceivedData, ArtifactCreatedData, FailureKind, StepCompletedData,
        StepStartedData, WorkflowCompletedData,
    };
    use cabin_artifact::{ArtifactKind, PlanArtifactHash};
    use chrono::TimeZone;

    fn wf() -> WorkflowId {
        "wf1".parse().unwrap()
    }

    fn step(id: &str) -> StepId {
        id.parse().unwrap()
    }

    fn at(sec: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + sec, 0).unwrap()
    }

    fn token() -> PlanToken {
        let hash = ContentHash::compute(b"hello");
        PlanToken {
            token: ContentHash::compute(b"token"),
            version: "1".into(),
            artifacts: vec![PlanArtifactHash::new("artifact.txt", hash)],
            model: "gpt-4".into(),
            engine_id: "terraform".into(),
            protocol_version: "1".into(),
            workspace_hash: ContentHash::zero(),
            created_at: at(0),
            policy_digest: None,
            governance_hash: None,
        }
    }

    fn seal_all(data: Vec<WalEntryData>) -> Vec<WalEntry> {
        (1u64..)
            .zip(data)
            .map(|(seq, d)| WalEntry::seal(seq, at(seq as i64), wf(), d).unwrap())
            .collect()
    }

    fn plan_entries() -> Vec<WalEntryData> {
        vec![
            WalEntryData::WorkflowStarted(WorkflowStartedData {
                initial_state: State::Init,
                context: MetaMap::new(),
            }),
            WalEntryData::StepStarted(StepStartedData {
                step_id: step("plan-1"),
                step_type: StepType::FlightPlan,
                expected_plan_token: None,
            }),
            WalEntryData::ArtifactCreated(ArtifactCreatedData {
                artifact_id: "artifact.txt".into(),
                step_id: step("plan-1"),
                artifact_hash: ContentHash::compute(b"hello"),
                artifact_type: ArtifactKind::new("file").unwrap(),
                metadata: None,
            }),
            WalEntryData::StepCompleted(StepCompletedData {
                step_id: step("plan-1"),
                step_type: StepType::FlightPlan,
                artifacts: vec!["artifact.txt".into()],
                plan_token: Some(token()),
                decision: None,
            }),
        ]
    }

    fn preflight(decision: Decision) -> Vec<WalEntryData> {
        vec![
            WalEntryData::StepStarted(StepStartedData {
                step_id: step("preflight-1"),
                step_type: StepType::Preflight,
                expected_plan_token: None,
            }),
            WalEntryData::StepCompleted(StepCompletedData {
                step_id: step("preflight-1"),
                step_type: StepType::Preflight,
                artifacts: Vec::new(),
                plan_token: None,
                decision: Some(decision),
            }),
        ]
    }

    fn approval_id() -> ApprovalId {
        "apr-1".parse().unwrap()
    }

    fn requested() -> WalEntryData {
        WalEntryData::ApprovalRequested(ApprovalRequestedData {
            approval_id: approval_id(),
            step_id: step("approval-1"),
            required_role: "operator".into(),
            plan_token_hash: token().token,
            reason: "needs review".into(),
        })
    }

    fn received(approved: bool) -> WalEntryData {
        WalEntryData::ApprovalReceived(ApprovalReceivedData {
            approval_id: approval_id(),
            step_id: step("approval-1"),
            approved,
            approver: "alice".into(),
            plan_token_hash: token().token,
            responded_at: at(100),
            reason: None,
            evidence_hashes: Vec::new(),
        })
    }

    #[test]
    fn plan_reaches_token_created() {
        let record = fold_state(&seal_all(plan_entries())).unwrap();
        assert_eq!(record.current_state, State::TokenCreated);
        assert_eq!(record.plan_token_hash, Some(token().token));
        assert_eq!(record.artifacts.len(), 1);
        assert_eq!(record.steps_completed, vec![step("plan-1")]);
        assert!(record.steps_pending.is_empty());
        assert_eq!(record.last_sequence, 4);
        assert_eq!(record.created_at, at(1));
        assert_eq!(record.updated_at, at(4));
    }

    #[test]
    fn allow_goes_straight_to_ready() {
        let mut data = plan_entries();
        data.extend(preflight(Decision::Warn));
        let record = fold_state(&seal_all(data)).unwrap();
        assert_eq!(record.current_state, State::ReadyForTakeoff);
        assert_eq!(record.last_decision, Some(Decision::Warn));
    }

    #[test]
    fn approval_round_trip() {
        let mut data = plan_entries();
        data.extend(preflight(Decision::RequireApproval));
        data.push(requested());
        let awaiting = fold_state(&seal_all(data.clone())).unwrap();
        assert_eq!(awaiting.current_state, State::AwaitingApproval);
        assert!(awaiting.pending_approval(&approval_id()).is_some());

        data.push(received(true));
        let approved = fold_state(&seal_all(data)).unwrap();
        assert_eq!(approved.current_state, State::ReadyForTakeoff);
        assert!(approved.pending_approvals.is_empty());
        assert_eq!(approved.approvals[0].approver, "alice");
    }

    #[test]
    fn rejection_then_failure() {
        let mut data = plan_entries();
        data.extend(preflight(Decision::RequireApproval));
        data.push(requested());
        data.push(received(false));
        let rejected = fold_state(&seal_all(data.clone())).unwrap();
        assert_eq!(rejected.current_state, State::AwaitingApproval);

        data.push(WalEntryData::WorkflowFailed(WorkflowFailedData {
            error: "approval denied".into(),
            failed_step: Some(step("approval-1")),
            kind: FailureKind::ApprovalDenied,
        }));
        let failed = fold_state(&seal_all(data)).unwrap();
        assert_eq!(failed.current_state, State::Failed);
        assert_eq!(failed.failure.unwrap().kind, FailureKind::ApprovalDenied);
    }

    #[test]
    fn take_off_and_completion() {
        let mut data = plan_entries();
        data.extend(preflight(Decision::Allow));
        data.push(WalEntryData::StepStarted(StepStartedData {
            step_id: step("takeoff-1"),
            step_type: StepType::TakeOff,
            expected_plan_token: Some(token().token),
        }));
        data.push(WalEntryData::WorkflowCompleted(WorkflowCompletedData {
            final_state: State::Completed,
            artifacts: Vec::new(),
        }));
        let record = fold_state(&seal_all(data)).unwrap();
        assert_eq!(record.current_state, State::Completed);
    }

    #[test]
    fn take_off_with_foreign_token_is_rejected() {
        let mut data = plan_entries();
        data.extend(preflight(Decision::Allow));
        data.push(WalEntryData::StepStarted(StepStartedData {
            step_id: step("takeoff-1"),
            step_type: StepType::TakeOff,
            expected_plan_token: Some(ContentHash::compute(b"other")),
        }));
        assert!(matches!(
            fold_state(&seal_all(data)),
            Err(FoldError::UnexpectedEntry { sequence: 7, .. })
        ));
    }

    #[test]
    fn skipping_the_gate_is_illegal() {
        let mut data = plan_entries();
        data.push(WalEntryData::StepStarted(StepStartedData {
            step_id: step("takeoff-1"),
            step_type: StepType::TakeOff,
            expected_plan_token: None,
        }));
        assert!(matches!(
            fold_state(&seal_all(data)),
            Err(FoldError::Transition { sequence: 5, .. })
        ));
    }

    #[test]
    fn log_must_open_with_start() {
        let mut data = plan_entries();
        data.remove(0);
        assert!(matches!(
            fold_state(&seal_all(data)),
            Err(FoldError::MissingStart { sequence: 1, .. })
        ));
        assert_eq!(fold_state(&[]), Err(FoldError::Empty));
    }

    #[test]
    fn fold_is_deterministic() {
        let mut data = plan_entries();
        data.extend(preflight(Decision::RequireApproval));
        data.push(requested());
        let entries = seal_all(data);
        let a = serde_json::to_vec(&fold_state(&entries).unwrap()).unwrap();
        let b = serde_json::to_vec(&fold_state(&entries).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn terminal_state_accepts_nothing() {
        let mut data = plan_entries();
        data.push(WalEntryData::WorkflowFailed(WorkflowFailedData {
            error: "cancelled".into(),
            failed_step: None,
            kind: FailureKind::Cancelled,
        }));
        data.push(WalEntryData::WorkflowFailed(WorkflowFailedData {
            error: "again".into(),
            failed_step: None,
            kind: FailureKind::Cancelled,
        }));
        assert!(fold_state(&seal_all(data)).is_err());
    }
}
