//! Wire-format tests against documents shaped like real engine traffic

use cabin_artifact::ContentHash;
use cabin_protocol::{
    ApprovalRequest, ApprovalResponse, Decision, EngineInput, EngineMeta, Mode, PlanToken,
    PreflightInput,
};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn hash(s: &str) -> String {
    ContentHash::compute(s.as_bytes()).to_string()
}

#[test]
fn approval_request_round_trips() {
    let json = serde_json::json!({
        "approval_id": "apr-1",
        "workflow_id": "wf1",
        "step_id": "preflight-1",
        "reason": "touches production",
        "required_role": "sre",
        "plan_token_hash": hash("plan"),
    });
    let request: ApprovalRequest = serde_json::from_value(json.clone()).unwrap();
    assert_eq!(request.required_role, "sre");
    assert_eq!(serde_json::to_value(&request).unwrap(), json);
}

#[test]
fn approval_response_without_extension_parses() {
    let response: ApprovalResponse = serde_json::from_value(serde_json::json!({
        "approval_id": "apr-1",
        "approved": true,
        "approver": "alice"
    }))
    .unwrap();
    assert!(response.plan_token_hash.is_none());
    assert!(response.approved);
}

#[test]
fn preflight_input_embeds_plan_token() {
    let token = serde_json::json!({
        "token": hash("t"),
        "version": "1",
        "artifacts": [{"name": "artifact.txt", "hash": hash("a"), "size": 5}],
        "model": "gpt-4",
        "engine_id": "terraform",
        "protocol_version": "1",
        "workspace_hash": hash("ws"),
        "created_at": "2024-05-01T12:00:00Z"
    });
    let input: PreflightInput = serde_json::from_value(serde_json::json!({
        "workflow_id": "wf1",
        "step_id": "preflight-1",
        "mode": "flight-plan",
        "engine_output": {
            "protocol_version": "1",
            "engine_id": "terraform",
            "mode": "flight-plan",
            "receipt_id": "r",
            "status": "success"
        },
        "plan_token": token
    }))
    .unwrap();
    let plan: &PlanToken = input.plan_token.as_ref().unwrap();
    assert_eq!(plan.artifact("artifact.txt").unwrap().size, Some(5));
    assert_eq!(input.mode, Mode::FlightPlan);
}

#[test]
fn take_off_input_carries_expected_token() {
    let meta = EngineMeta {
        workflow_id: "wf1".parse().unwrap(),
        step_id: "takeoff-1".parse().unwrap(),
    };
    let mut input = EngineInput::new("1", Mode::TakeOff, meta);
    input.expected_plan_token = Some(ContentHash::compute(b"plan"));
    let json = serde_json::to_value(&input).unwrap();
    assert_eq!(json["mode"], "take-off");
    assert_eq!(json["expected_plan_token"], hash("plan"));
    assert!(json.get("secrets").is_none());
}

fn decision() -> impl Strategy<Value = Decision> {
    prop_oneof![
        Just(Decision::Allow),
        Just(Decision::Warn),
        Just(Decision::RequireApproval),
        Just(Decision::Deny),
    ]
}

proptest! {
    #[test]
    fn max_by_severity_equals_max_by_ord(decisions in prop::collection::vec(decision(), 1..10)) {
        let by_ord = decisions.iter().max().copied();
        let by_severity = decisions.iter().max_by_key(|d| d.severity()).copied();
        prop_assert_eq!(by_ord, by_severity);
    }
}
