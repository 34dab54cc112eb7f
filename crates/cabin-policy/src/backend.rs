//! Policy backends and concurrent, fail-closed gathering
//!
//! Backends (rule engines, scoring services, gateways) are called
//! concurrently for one preflight. A backend that times out or errors still
//! contributes an evaluation: a `deny`. A silent backend can never let a plan
//! through.

use crate::evaluation::{PolicyEvaluation, PolicySource};
use crate::error::PolicyError;
use async_trait::async_trait;
use cabin_protocol::PreflightInput;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;

/// Reason recorded when a backend misses its deadline
pub const POLICY_TIMEOUT_REASON: &str = "policy_timeout";

/// Prefix of the reason recorded when a backend fails
pub const POLICY_ERROR_PREFIX: &str = "policy_error";

/// External policy decision point
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    /// Policy identifier (OPA package, model name, ...)
    fn policy_id(&self) -> &str;

    /// Kind of backend
    fn source(&self) -> PolicySource;

    /// Evaluate one preflight
    ///
    /// # Errors
    /// Any failure; the caller records it as a deny
    async fn evaluate(&self, input: &PreflightInput) -> Result<PolicyEvaluation, PolicyError>;
}

/// Shared handle to a backend
pub type SharedBackend = Arc<dyn PolicyBackend>;

/// Call every backend concurrently, each bounded by `timeout`
///
/// Results keep the order of `backends`. Timeouts, errors and evaluations
/// with an inconsistent severity all become `deny` evaluations.
pub async fn gather_evaluations(
    backends: &[SharedBackend],
    input: &PreflightInput,
    timeout: Duration,
) -> Vec<PolicyEvaluation> {
    let calls = backends.iter().map(|backend| async move {
        let outcome = tokio::time::timeout(timeout, backend.evaluate(input)).await;
        settle(backend.as_ref(), outcome, timeout)
    });
    join_all(calls).await
}

fn settle(
    backend: &dyn PolicyBackend,
    outcome: Result<Result<PolicyEvaluation, PolicyError>, tokio::time::error::Elapsed>,
    timeout: Duration,
) -> PolicyEvaluation {
    let policy_id = backend.policy_id();
    match outcome {
        Ok(Ok(evaluation)) => match evaluation.check_consistent() {
            Ok(()) => evaluation,
            Err(e) => {
                tracing::warn!(policy_id, error = %e, "policy backend returned malformed evaluation");
                PolicyEvaluation::fail_closed(
                    backend.source(),
                    policy_id,
                    format!("{POLICY_ERROR_PREFIX}: {e}"),
                    Utc::now(),
                )
            }
        },
        Ok(Err(e)) => {
            tracing::warn!(policy_id, error = %e, "policy backend failed");
            PolicyEvaluation::fail_closed(
                backend.source(),
                policy_id,
                format!("{POLICY_ERROR_PREFIX}: {e}"),
                Utc::now(),
            )
        }
        Err(_) => {
            tracing::warn!(
                policy_id,
                timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                "policy backend timed out"
            );
            PolicyEvaluation::fail_closed(
                backend.source(),
                policy_id,
                POLICY_TIMEOUT_REASON,
                Utc::now(),
            )
        }
    }
}
