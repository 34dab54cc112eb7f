//! Testing utilities for the CabinCrew workspace
//!
//! Shared fixtures: engine outputs, a seeded artifact store and policy
//! backends with canned behaviour.

#![allow(missing_docs)]

use async_trait::async_trait;
use cabin_artifact::{ContentHash, MemoryArtifactStore, StepId, WorkflowId};
use cabin_policy::{PolicyBackend, PolicyError, PolicyEvaluation, PolicySource};
use cabin_protocol::{
    Decision, EngineArtifact, EngineOutput, EngineStatus, Mode, PreflightInput, PROTOCOL_VERSION,
};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const PLAN_PATH: &str = "plans/plan.json";
pub const DIFF_PATH: &str = "plans/changes.diff";
pub const RESULT_PATH: &str = "results/apply.log";

pub fn fixed_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

pub fn wf(id: &str) -> WorkflowId {
    id.parse().unwrap()
}

pub fn step(id: &str) -> StepId {
    id.parse().unwrap()
}

pub fn workspace_hash() -> ContentHash {
    ContentHash::compute(b"workspace@main")
}

pub fn artifact(name: &str, role: &str, path: &str, hash: ContentHash) -> EngineArtifact {
    EngineArtifact {
        name: name.to_string(),
        role: role.to_string(),
        path: path.to_string(),
        hash,
        size: None,
    }
}

/// Store holding a plan and a diff, plus the artifacts an honest
/// flight-plan engine would report for them
pub fn seeded_store() -> (Arc<MemoryArtifactStore>, Vec<EngineArtifact>) {
    let store = Arc::new(MemoryArtifactStore::new());
    let plan = store
        .put(PLAN_PATH, br#"{"actions":["create bucket"]}"#.to_vec())
        .unwrap();
    let diff = store
        .put(DIFF_PATH, b"+ bucket \"logs\"\n".to_vec())
        .unwrap();
    let reported = vec![
        artifact("plan", "plan", PLAN_PATH, plan),
        artifact("diff", "diff", DIFF_PATH, diff),
    ];
    (store, reported)
}

/// Add the take-off result file to `store` and return its artifact
pub fn seed_result(store: &MemoryArtifactStore) -> EngineArtifact {
    let hash = store.put(RESULT_PATH, b"applied 1 change\n".to_vec()).unwrap();
    artifact("apply-log", "log", RESULT_PATH, hash)
}

fn output(mode: Mode, artifacts: Vec<EngineArtifact>) -> EngineOutput {
    EngineOutput {
        protocol_version: PROTOCOL_VERSION.to_string(),
        engine_id: "terraform".to_string(),
        mode,
        receipt_id: format!("rcpt-{mode}"),
        status: EngineStatus::Success,
        error: None,
        warnings: None,
        diagnostics: None,
        artifacts: Some(artifacts),
        metrics: None,
        plan_token: None,
    }
}

pub fn flight_plan_output(artifacts: Vec<EngineArtifact>) -> EngineOutput {
    output(Mode::FlightPlan, artifacts)
}

pub fn take_off_output(
    plan_token: Option<ContentHash>,
    artifacts: Vec<EngineArtifact>,
) -> EngineOutput {
    let mut out = output(Mode::TakeOff, artifacts);
    out.plan_token = plan_token;
    out
}

pub fn failed_output(mode: Mode, error: &str) -> EngineOutput {
    let mut out = output(mode, Vec::new());
    out.status = EngineStatus::Failure;
    out.error = Some(error.to_string());
    out
}

pub fn preflight_input(workflow_id: &str, step_id: &str, engine_output: EngineOutput) -> PreflightInput {
    PreflightInput {
        workflow_id: wf(workflow_id),
        step_id: step(step_id),
        mode: engine_output.mode,
        engine_output,
        evidence: None,
        context: None,
        plan_token: None,
    }
}

pub fn evaluation(policy_id: &str, decision: Decision) -> PolicyEvaluation {
    PolicyEvaluation::new(PolicySource::Opa, policy_id, decision, fixed_time())
}

/// Backend that always answers with the same decision
#[derive(Debug)]
pub struct StaticBackend {
    id: String,
    decision: Decision,
    reason: Option<String>,
    calls: AtomicUsize,
}

impl StaticBackend {
    pub fn new(id: &str, decision: Decision) -> Self {
        Self {
            id: id.to_string(),
            decision,
            reason: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PolicyBackend for StaticBackend {
    fn policy_id(&self) -> &str {
        &self.id
    }

    fn source(&self) -> PolicySource {
        PolicySource::Opa
    }

    async fn evaluate(&self, _input: &PreflightInput) -> Result<PolicyEvaluation, PolicyError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut evaluation = PolicyEvaluation::new(PolicySource::Opa, &self.id, self.decision, Utc::now());
        if let Some(reason) = &self.reason {
            evaluation = evaluation.with_reason(reason.clone());
        }
        Ok(evaluation)
    }
}

/// Backend that answers `allow` after a delay
#[derive(Debug)]
pub struct SlowBackend(pub Duration);

#[async_trait]
impl PolicyBackend for SlowBackend {
    fn policy_id(&self) -> &str {
        "slow"
    }

    fn source(&self) -> PolicySource {
        PolicySource::Onnx
    }

    async fn evaluate(&self, _input: &PreflightInput) -> Result<PolicyEvaluation, PolicyError> {
        tokio::time::sleep(self.0).await;
        Ok(PolicyEvaluation::new(PolicySource::Onnx, "slow", Decision::Allow, Utc::now()))
    }
}

/// Backend whose every call fails
#[derive(Debug)]
pub struct FailingBackend;

#[async_trait]
impl PolicyBackend for FailingBackend {
    fn policy_id(&self) -> &str {
        "failing"
    }

    fn source(&self) -> PolicySource {
        PolicySource::Custom
    }

    async fn evaluate(&self, _input: &PreflightInput) -> Result<PolicyEvaluation, PolicyError> {
        Err(PolicyError::Backend {
            policy_id: "failing".into(),
            message: "connection refused".into(),
        })
    }
}
