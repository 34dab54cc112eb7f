//! Crash recovery and WAL integrity
//!
//! A fresh orchestrator over the same stores must resume exactly where the
//! previous one stopped, and must refuse a log that no longer verifies.

use cabin_artifact::{MetaMap, MetaValue, WorkflowId};
use cabin_kernel::audit::{AuditStore, MemoryAuditStore};
use cabin_kernel::clock::ManualClock;
use cabin_kernel::config::OrchestratorConfig;
use cabin_kernel::wal::{fold_state, FileWalStore, MemoryWalStore, WalStore, WriteAheadLog};
use cabin_kernel::{ErrorClass, KernelError, PlanSubmission, WorkflowOrchestrator};
use cabin_protocol::{ApprovalResponse, Decision, State};
use cabin_test_utils::{
    evaluation, fixed_time, flight_plan_output, seeded_store, step, wf, workspace_hash,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tempfile::TempDir;

fn orchestrator(
    config: OrchestratorConfig,
    wal: Arc<dyn WalStore>,
    audit: Arc<MemoryAuditStore>,
) -> WorkflowOrchestrator {
    let (artifacts, _) = seeded_store();
    WorkflowOrchestrator::builder(config)
        .wal_store(wal)
        .audit_store(audit)
        .artifact_store(artifacts)
        .clock(Arc::new(ManualClock::new(fixed_time())))
        .build()
        .unwrap()
}

/// Drive `id` to AWAITING_APPROVAL and return the approval id
fn to_approval(o: &WorkflowOrchestrator, id: &WorkflowId) -> cabin_artifact::ApprovalId {
    let (_, reported) = seeded_store();
    let mut context = MetaMap::new();
    context.insert("ticket".into(), "CHG-1042".into());
    o.start_workflow(id, context).unwrap();
    o.record_plan_generated(
        id,
        PlanSubmission::new(
            step("flight-plan-1"),
            flight_plan_output(reported),
            "planner",
            workspace_hash(),
        ),
    )
    .unwrap();
    o.record_preflight(
        id,
        &step("preflight-1"),
        vec![
            evaluation("baseline", Decision::Allow),
            evaluation("board", Decision::RequireApproval),
        ],
    )
    .unwrap()
    .approval
    .unwrap()
    .approval_id
}

#[test]
fn restart_resumes_pending_approval() {
    let wal = Arc::new(MemoryWalStore::new());
    let audit = Arc::new(MemoryAuditStore::new());
    let id = wf("wf1");

    let before = {
        let first = orchestrator(OrchestratorConfig::new(), wal.clone(), audit.clone());
        let approval_id = to_approval(&first, &id);
        (first.state_record(&id).unwrap(), approval_id)
    };
    let (record, approval_id) = before;

    let second = orchestrator(OrchestratorConfig::new(), wal.clone(), audit.clone());
    assert_eq!(second.state_record(&id).unwrap(), record);
    assert_eq!(record.current_state, State::AwaitingApproval);
    assert_eq!(record.metadata.get("ticket").and_then(|v| v.as_str()), Some("CHG-1042"));

    second
        .submit_approval(&id, ApprovalResponse::approve(approval_id, "alice"))
        .unwrap();
    assert_eq!(second.workflow_state(&id).unwrap().state, State::ReadyForTakeoff);

    // Sequences continue from the durable head
    let entries = WriteAheadLog::new(wal).replay(&id).unwrap();
    for (expected, entry) in (1u64..).zip(&entries) {
        assert_eq!(entry.sequence, expected);
    }
    assert!(second.verify_audit().unwrap().valid);
}

#[test]
fn replay_is_idempotent() {
    let wal = Arc::new(MemoryWalStore::new());
    let o = orchestrator(OrchestratorConfig::new(), wal.clone(), Arc::new(MemoryAuditStore::new()));
    let id = wf("wf1");
    to_approval(&o, &id);

    let log = WriteAheadLog::new(wal);
    let entries = log.replay(&id).unwrap();
    let once = fold_state(&entries).unwrap();
    let twice = fold_state(&log.replay(&id).unwrap()).unwrap();
    assert_eq!(once, twice);
    assert_eq!(once, o.recover(&id).unwrap());
}

#[test]
fn failed_wal_write_changes_nothing() {
    let wal = Arc::new(MemoryWalStore::new());
    let o = orchestrator(OrchestratorConfig::new(), wal.clone(), Arc::new(MemoryAuditStore::new()));
    let id = wf("wf1");
    let approval_id = to_approval(&o, &id);
    let before = o.state_record(&id).unwrap();

    wal.fail_next_appends(1);
    let err = o
        .submit_approval(&id, ApprovalResponse::approve(approval_id.clone(), "alice"))
        .unwrap_err();
    assert_eq!(err.class(), ErrorClass::Persistence);
    assert_eq!(o.state_record(&id).unwrap(), before);

    // The approval is still pending and can be retried
    o.submit_approval(&id, ApprovalResponse::approve(approval_id, "alice"))
        .unwrap();
    assert_eq!(o.workflow_state(&id).unwrap().state, State::ReadyForTakeoff);
}

#[test]
fn write_kept_despite_error_is_not_overwritten() {
    let wal = Arc::new(MemoryWalStore::new());
    let o = orchestrator(OrchestratorConfig::new(), wal.clone(), Arc::new(MemoryAuditStore::new()));
    let id = wf("wf1");
    to_approval(&o, &id);

    // The store keeps the entry but reports the write as failed
    wal.fail_next_syncs(1);
    let err = o.fail_workflow(&id, "operator abort", None).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Persistence);

    // What the store kept is what the orchestrator reports
    let log = WriteAheadLog::new(wal);
    let durable = fold_state(&log.replay(&id).unwrap()).unwrap();
    assert_eq!(o.state_record(&id).unwrap(), durable);
    assert_eq!(durable.current_state, State::Failed);

    // A retry cannot append a second entry at the same sequence
    assert!(o.fail_workflow(&id, "operator abort", None).is_err());
    let entries = log.replay(&id).unwrap();
    for (expected, entry) in (1u64..).zip(&entries) {
        assert_eq!(entry.sequence, expected);
    }
    assert_eq!(o.recover(&id).unwrap(), durable);
}

#[test]
fn float_context_survives_restart() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn WalStore> = Arc::new(FileWalStore::open(dir.path()).unwrap());
    let audit = Arc::new(MemoryAuditStore::new());
    let id = wf("wf1");
    let mut context = MetaMap::new();
    context.insert("score".into(), 1.071_566_039_146_582_6e-75.into());
    context.insert("ratio".into(), f64::NAN.into());
    {
        let o = orchestrator(OrchestratorConfig::new(), store.clone(), audit.clone());
        o.start_workflow(&id, context.clone()).unwrap();
        assert_eq!(o.state_record(&id).unwrap().metadata, context);
    }

    let o = orchestrator(OrchestratorConfig::new(), store, audit);
    let record = o.state_record(&id).unwrap();
    assert_eq!(record.current_state, State::PlanRunning);
    assert_eq!(record.metadata, context);
    assert_eq!(record.metadata["ratio"], MetaValue::Null);
}

#[test]
fn recover_all_lists_every_workflow() {
    let dir = TempDir::new().unwrap();
    let config = OrchestratorConfig::new().with_wal_dir(dir.path());
    let audit = Arc::new(MemoryAuditStore::new());
    let store: Arc<dyn WalStore> = Arc::new(FileWalStore::open(dir.path()).unwrap());
    {
        let o = orchestrator(config.clone(), store.clone(), audit.clone());
        to_approval(&o, &wf("alpha"));
        o.start_workflow(&wf("beta"), MetaMap::new()).unwrap();
    }

    let o = orchestrator(config, store, audit);
    let report = o.recover_all().unwrap();
    assert!(report.failed.is_empty());
    let states: Vec<(String, State)> = report
        .recovered
        .iter()
        .map(|s| (s.workflow_id.to_string(), s.state))
        .collect();
    assert_eq!(
        states,
        vec![
            ("alpha".to_string(), State::AwaitingApproval),
            ("beta".to_string(), State::PlanRunning),
        ]
    );
}

#[test]
fn tampered_wal_file_is_refused() {
    let dir = TempDir::new().unwrap();
    let audit = Arc::new(MemoryAuditStore::new());
    let store: Arc<dyn WalStore> = Arc::new(FileWalStore::open(dir.path()).unwrap());
    let id = wf("wf1");
    {
        let o = orchestrator(OrchestratorConfig::new(), store.clone(), audit.clone());
        to_approval(&o, &id);
    }

    // Rewrite the flight-plan step id in entry 2, keeping its old checksum
    let path = dir.path().join("wf1.wal.jsonl");
    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let mut entry: serde_json::Value = serde_json::from_str(&lines[1]).unwrap();
    entry["data"]["step_id"] = serde_json::Value::String("flight-plan-9".into());
    lines[1] = serde_json::to_string(&entry).unwrap();
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();

    let o = orchestrator(OrchestratorConfig::new(), store, audit.clone());
    let err = o.workflow_state(&id).unwrap_err();
    match &err {
        KernelError::Wal(e) => assert!(e.is_corruption()),
        other => panic!("expected WAL corruption, got {other:?}"),
    }
    assert!(err.is_fatal());

    // Appends are refused too
    assert!(o.fail_workflow(&id, "cleanup", None).is_err());

    let report = o.recover_all().unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, id);

    let events = audit.load().unwrap();
    let corruption = events
        .iter()
        .find(|e| e.event_type == "wal_corruption")
        .unwrap();
    // Only entry 1 verified, so the last trusted state is PLAN_RUNNING
    assert_eq!(corruption.workflow_state, State::PlanRunning);
    assert!(o.verify_audit().unwrap().valid);
}

#[test]
fn truncated_tail_keeps_earlier_state() {
    let wal = Arc::new(MemoryWalStore::new());
    let audit = Arc::new(MemoryAuditStore::new());
    let id = wf("wf1");
    {
        let o = orchestrator(OrchestratorConfig::new(), wal.clone(), audit.clone());
        o.start_workflow(&id, MetaMap::new()).unwrap();
    }
    // A crash mid-write leaves a partial line behind
    let partial = r#"{"sequence":2,"timestamp":"2025-01-01T00:00:00Z","workflow"#;
    wal.append(&id, &[partial.to_string()]).unwrap();

    let o = orchestrator(OrchestratorConfig::new(), wal, audit);
    let err = o.recover(&id).unwrap_err();
    assert_eq!(err.class(), ErrorClass::Integrity);
}
