//! Workflow transition table
//!
//! The only source of truth for which lifecycle hops are legal. The WAL fold
//! checks every hop an entry implies against [`validate_transition`].

use cabin_protocol::State;

/// Illegal lifecycle hop
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateMachineError {
    #[error("illegal transition {from} -> {to}")]
    IllegalTransition { from: State, to: State },
}

/// Validates a state transition.
///
/// Returns an error for an illegal hop. With the `strict-debug` feature an
/// illegal hop panics instead, to surface orchestration bugs early.
///
/// # Errors
/// Returns [`StateMachineError::IllegalTransition`]
pub fn validate_transition(from: State, to: State) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        #[cfg(feature = "strict-debug")]
        panic!("Illegal state transition attempted: {from} -> {to}");

        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one hop
#[must_use]
pub fn allowed_transitions(from: State) -> Vec<State> {
    use State::*;
    match from {
        Init => vec![PlanRunning, Failed],
        PlanRunning => vec![PlanGenerated, Failed],
        PlanGenerated => vec![ArtifactsValidated, Failed],
        ArtifactsValidated => vec![TokenCreated, Failed],
        TokenCreated => vec![PreFlightRunning, Failed],
        PreFlightRunning => vec![PreflightComplete, Failed],
        PreflightComplete => vec![AwaitingApproval, ReadyForTakeoff, Failed],
        AwaitingApproval => vec![Approved, Failed],
        Approved => vec![ReadyForTakeoff, Failed],
        ReadyForTakeoff => vec![TakeoffRunning, Failed],
        TakeoffRunning => vec![ExecutionComplete, Failed],
        ExecutionComplete => vec![Completed, Failed],
        Completed => vec![],
        Failed => vec![],
    }
}

fn allowed(from: State, to: State) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        use State::*;
        let path = [
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
        ];
        for hop in path.windows(2) {
            assert!(validate_transition(hop[0], hop[1]).is_ok(), "{hop:?}");
        }
    }

    #[test]
    fn approval_can_be_skipped() {
        assert!(validate_transition(State::PreflightComplete, State::ReadyForTakeoff).is_ok());
    }

    #[cfg(not(feature = "strict-debug"))]
    #[test]
    fn take_off_cannot_skip_the_gate() {
        assert_eq!(
            validate_transition(State::TokenCreated, State::TakeoffRunning),
            Err(StateMachineError::IllegalTransition {
                from: State::TokenCreated,
                to: State::TakeoffRunning
            })
        );
        assert!(validate_transition(State::AwaitingApproval, State::ReadyForTakeoff).is_err());
    }

    #[test]
    fn failed_reachable_from_every_non_terminal_state() {
        for state in State::ALL {
            let reachable = allowed_transitions(state).contains(&State::Failed);
            assert_eq!(reachable, !state.is_terminal(), "{state}");
        }
    }

    #[test]
    fn terminal_states_have_no_exits() {
        assert!(allowed_transitions(State::Completed).is_empty());
        assert!(allowed_transitions(State::Failed).is_empty());
    }
}
