//! Audit ledger behaviour across an orchestrated run

use cabin_artifact::{meta_map, MetaMap};
use cabin_kernel::audit::{
    verify_chain, verify_signature, AuditError, AuditSigner, AuditStore, FileAuditStore,
    MemoryAuditStore,
};
use cabin_kernel::clock::ManualClock;
use cabin_kernel::config::OrchestratorConfig;
use cabin_kernel::{KernelError, PlanSubmission, WorkflowOrchestrator};
use cabin_protocol::{Decision, State};
use cabin_test_utils::{
    evaluation, fixed_time, flight_plan_output, seeded_store, step, wf, workspace_hash,
};
use std::sync::Arc;
use tempfile::TempDir;

fn run(o: &WorkflowOrchestrator, name: &str) {
    let (_, reported) = seeded_store();
    let id = wf(name);
    o.start_workflow(&id, MetaMap::new()).unwrap();
    o.record_plan_generated(
        &id,
        PlanSubmission::new(
            step("flight-plan-1"),
            flight_plan_output(reported),
            "planner",
            workspace_hash(),
        ),
    )
    .unwrap();
    o.record_preflight(
        &id,
        &step("preflight-1"),
        vec![evaluation("baseline", Decision::Allow)],
    )
    .unwrap();
}

fn build(audit: Arc<dyn AuditStore>, signer: Option<AuditSigner>) -> Result<WorkflowOrchestrator, KernelError> {
    let (artifacts, _) = seeded_store();
    let mut builder = WorkflowOrchestrator::builder(OrchestratorConfig::new())
        .audit_store(audit)
        .artifact_store(artifacts)
        .clock(Arc::new(ManualClock::new(fixed_time())));
    if let Some(signer) = signer {
        builder = builder.signer(signer);
    }
    builder.build()
}

#[test]
fn events_chain_from_genesis() {
    let audit = Arc::new(MemoryAuditStore::new());
    let o = build(audit.clone(), None).unwrap();
    run(&o, "wf1");
    run(&o, "wf2");

    let events = audit.load().unwrap();
    assert_eq!(events.len(), 6);
    assert!(events.iter().all(|e| e.chain_hash.is_some()));
    assert!(events.iter().all(|e| e.signature.is_none()));

    let verification = verify_chain(&events);
    assert!(verification.valid);
    assert_eq!(verification.events_checked, 6);
    assert_eq!(verification.first_broken_index, None);

    let preflight = &events[2];
    let policy = preflight.policy.as_ref().unwrap();
    assert_eq!(policy.decision, Decision::Allow);
    assert_eq!(policy.workflow_state, State::ReadyForTakeoff);
}

#[test]
fn edited_event_breaks_chain_and_blocks_startup() {
    let audit = Arc::new(MemoryAuditStore::new());
    {
        let o = build(audit.clone(), None).unwrap();
        run(&o, "wf1");
        run(&o, "wf2");
    }

    let mut events = audit.load().unwrap();
    events[3].message = Some("nothing to see here".into());
    assert!(audit.replace(3, events[3].clone()));

    let verification = verify_chain(&audit.load().unwrap());
    assert!(!verification.valid);
    assert_eq!(verification.first_broken_index, Some(3));

    match build(audit, None) {
        Err(KernelError::Audit(AuditError::BrokenChain { index })) => assert_eq!(index, 3),
        other => panic!("expected broken chain, got {other:?}"),
    }
}

#[test]
fn edited_policy_decision_is_located() {
    let audit = Arc::new(MemoryAuditStore::new());
    let o = build(audit.clone(), None).unwrap();
    run(&o, "wf1");
    run(&o, "wf2");

    let mut events = audit.load().unwrap();
    assert_eq!(events[2].event_type, "preflight_complete");
    let policy = events[2].policy.as_mut().unwrap();
    assert_eq!(policy.decision, Decision::Allow);
    policy.decision = Decision::Deny;
    assert!(audit.replace(2, events[2].clone()));

    let stored = audit.load().unwrap();
    let verification = verify_chain(&stored);
    assert!(!verification.valid);
    assert_eq!(verification.first_broken_index, Some(2));
    assert!(verify_chain(&stored[..2]).valid);
}

#[test]
fn float_evidence_survives_ledger_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("ledger.jsonl");
    let evidence = meta_map([("score", 1.071_566_039_146_582_6e-75)]);
    {
        let store = Arc::new(FileAuditStore::open(&path).unwrap());
        let o = build(store, None).unwrap();
        let (_, reported) = seeded_store();
        let id = wf("wf1");
        o.start_workflow(&id, MetaMap::new()).unwrap();
        o.record_plan_generated(
            &id,
            PlanSubmission::new(
                step("flight-plan-1"),
                flight_plan_output(reported),
                "planner",
                workspace_hash(),
            ),
        )
        .unwrap();
        o.record_preflight(
            &id,
            &step("preflight-1"),
            vec![evaluation("scorer", Decision::Allow).with_evidence(evidence.clone())],
        )
        .unwrap();
    }

    let store = Arc::new(FileAuditStore::open(&path).unwrap());
    let o = build(store.clone(), None).unwrap();
    assert!(o.verify_audit().unwrap().valid);
    let events = store.load().unwrap();
    let policy = events[2].policy.as_ref().unwrap();
    assert_eq!(policy.policy_evaluations[0].evidence, Some(evidence));
}

#[test]
fn signed_events_verify_against_public_key() {
    let signer = AuditSigner::generate("ops-key-1");
    let public = signer.verifying_key();
    let audit = Arc::new(MemoryAuditStore::new());
    let o = build(audit.clone(), Some(signer)).unwrap();
    run(&o, "wf1");

    let events = audit.load().unwrap();
    for event in &events {
        assert_eq!(event.signature_key_ref.as_deref(), Some("ops-key-1"));
        assert!(verify_signature(event, &public).unwrap());
    }

    let stranger = AuditSigner::generate("other").verifying_key();
    assert!(!verify_signature(&events[0], &stranger).unwrap());
}

#[test]
fn file_ledger_survives_restart() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("audit").join("ledger.jsonl");
    {
        let store = Arc::new(FileAuditStore::open(&path).unwrap());
        let o = build(store, None).unwrap();
        run(&o, "wf1");
    }

    let store = Arc::new(FileAuditStore::open(&path).unwrap());
    let o = build(store.clone(), None).unwrap();
    run(&o, "wf2");
    let verification = o.verify_audit().unwrap();
    assert!(verification.valid);
    assert_eq!(verification.events_checked, 6);
    assert_eq!(store.load().unwrap().len(), 6);
}
