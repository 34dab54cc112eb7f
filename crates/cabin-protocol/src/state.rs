//! Workflow lifecycle states

use crate::decision::Decision;
use crate::error::ValidationError;
use cabin_artifact::{ContentHash, StepId, WorkflowId};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

/// Lifecycle state of a workflow
///
/// Declared in the order a successful run walks through them; `Failed` is
/// reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Init,
    PlanRunning,
    PlanGenerated,
    ArtifactsValidated,
    TokenCreated,
    PreFlightRunning,
    PreflightComplete,
    AwaitingApproval,
    Approved,
    ReadyForTakeoff,
    TakeoffRunning,
    ExecutionComplete,
    Completed,
    Failed,
}

impl State {
    /// Every state, in lifecycle order
    pub const ALL: [State; 14] = [
        State::Init,
        State::PlanRunning,
        State::PlanGenerated,
        State::ArtifactsValidated,
        State::TokenCreated,
        State::PreFlightRunning,
        State::PreflightComplete,
        State::AwaitingApproval,
        State::Approved,
        State::ReadyForTakeoff,
        State::TakeoffRunning,
        State::ExecutionComplete,
        State::Completed,
        State::Failed,
    ];

    /// No transition leaves a terminal state
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Wire name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::PlanRunning => "PLAN_RUNNING",
            Self::PlanGenerated => "PLAN_GENERATED",
            Self::ArtifactsValidated => "ARTIFACTS_VALIDATED",
            Self::TokenCreated => "TOKEN_CREATED",
            Self::PreFlightRunning => "PRE_FLIGHT_RUNNING",
            Self::PreflightComplete => "PREFLIGHT_COMPLETE",
            Self::AwaitingApproval => "AWAITING_APPROVAL",
            Self::Approved => "APPROVED",
            Self::ReadyForTakeoff => "READY_FOR_TAKEOFF",
            Self::TakeoffRunning => "TAKEOFF_RUNNING",
            Self::ExecutionComplete => "EXECUTION_COMPLETE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    /// The collapsed state an older peer would report, if one exists
    ///
    /// Intermediate plan and execution states have no legacy counterpart
    /// and map to `None` rather than to a neighbour.
    #[must_use]
    pub const fn to_legacy(self) -> Option<LegacyState> {
        match self {
            Self::Init => Some(LegacyState::Init),
            Self::PlanRunning => Some(LegacyState::PlanRunning),
            Self::PreFlightRunning => Some(LegacyState::PreFlightRunning),
            Self::PreflightComplete => Some(LegacyState::PreflightComplete),
            Self::AwaitingApproval => Some(LegacyState::AwaitingApproval),
            Self::Approved => Some(LegacyState::Approved),
            Self::ReadyForTakeoff => Some(LegacyState::ReadyForTakeoff),
            Self::TakeoffRunning => Some(LegacyState::TakeoffRunning),
            Self::Completed => Some(LegacyState::Completed),
            Self::Failed => Some(LegacyState::Failed),
            Self::PlanGenerated
            | Self::ArtifactsValidated
            | Self::TokenCreated
            | Self::ExecutionComplete => None,
        }
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for State {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownValue {
                field: "state",
                value: s.to_string(),
            })
    }
}

/// Deprecated ten-state enumeration used by older peers
///
/// Accepted on input for compatibility; every value converts to exactly one
/// [`State`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LegacyState {
    Init,
    PlanRunning,
    PreFlightRunning,
    PreflightComplete,
    AwaitingApproval,
    Approved,
    ReadyForTakeoff,
    TakeoffRunning,
    Completed,
    Failed,
}

impl From<LegacyState> for State {
    fn from(legacy: LegacyState) -> Self {
        match legacy {
            LegacyState::Init => Self::Init,
            LegacyState::PlanRunning => Self::PlanRunning,
            LegacyState::PreFlightRunning => Self::PreFlightRunning,
            LegacyState::PreflightComplete => Self::PreflightComplete,
            LegacyState::AwaitingApproval => Self::AwaitingApproval,
            LegacyState::Approved => Self::Approved,
            LegacyState::ReadyForTakeoff => Self::ReadyForTakeoff,
            LegacyState::TakeoffRunning => Self::TakeoffRunning,
            LegacyState::Completed => Self::Completed,
            LegacyState::Failed => Self::Failed,
        }
    }
}

/// Live, externally visible state of one workflow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub state: State,
    pub workflow_id: WorkflowId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_decision: Option<Decision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_token_hash: Option<ContentHash>,
}

impl WorkflowState {
    #[must_use]
    pub fn new(workflow_id: WorkflowId, state: State) -> Self {
        Self {
            state,
            workflow_id,
            step_id: None,
            last_decision: None,
            plan_token_hash: None,
        }
    }
}
