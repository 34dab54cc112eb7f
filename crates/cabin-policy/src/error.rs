//! Policy errors

use cabin_protocol::Decision;

/// Errors from evaluation checking, aggregation and backends
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    /// Aggregation was asked to decide over nothing
    #[error("no policies evaluated")]
    NoPoliciesEvaluated,

    /// Severity does not match the decision it accompanies
    #[error("policy {policy_id}: severity {severity} inconsistent with decision {decision}")]
    InconsistentSeverity {
        policy_id: String,
        decision: Decision,
        severity: u8,
    },

    /// `custom` aggregation selected without a registered rule
    #[error("custom aggregation rule not registered: {0}")]
    MissingCustomRule(String),

    /// Custom rule returned an index outside the evaluation list
    #[error("custom rule {rule} chose evaluation {index} of {len}")]
    CustomRuleIndex {
        rule: String,
        index: usize,
        len: usize,
    },

    /// A backend failed to produce an evaluation
    #[error("policy backend {policy_id} failed: {message}")]
    Backend { policy_id: String, message: String },
}
