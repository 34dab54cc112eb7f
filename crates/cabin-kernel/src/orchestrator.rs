//! Workflow orchestrator
//!
//! Drives one workflow at a time through flight-plan, preflight, approval
//! and take-off. The rules it follows:
//!
//! - Every operation writes all of its WAL entries as one durable batch
//!   before the cached record changes. If the write fails the record is
//!   rebuilt from whatever the store kept, which for the file store is
//!   nothing.
//! - The cached record is always the fold of the WAL. Each entry is folded
//!   against a copy first, so an entry that would walk an illegal
//!   transition is never written.
//! - Operations on one workflow are serialized by its slot lock. The lock
//!   is never held across an `.await`.
//! - Audit events are written after the WAL commit they describe.

use crate::approval::ApprovalManager;
use crate::audit::{
    AuditApproval, AuditArtifact, AuditChain, AuditEngine, AuditEvent, AuditIntegrity,
    AuditPolicy, AuditSeverity, AuditSigner, AuditStore, AuditWorkflow, ChainVerification,
    FileAuditStore, MemoryAuditStore,
};
use crate::clock::{Clock, SystemClock};
use crate::config::OrchestratorConfig;
use crate::error::{KernelError, KernelResult};
use crate::plan_token::{PlanProvenance, PlanTokenBinder};
use crate::wal::{
    fold_state, ApprovalReceivedData, ApprovalRequestedData, ArtifactCreatedData, FailureKind,
    FileWalStore, MemoryWalStore, StepCompletedData, StepStartedData, StepType, WalEntryData,
    WalError, WalStore, WorkflowCompletedData, WorkflowFailedData, WorkflowStartedData,
    WorkflowStateRecord, WriteAheadLog,
};
use cabin_artifact::{
    meta_map, ArtifactError, ArtifactKind, ArtifactStore, ContentHash, FieldHasher,
    MemoryArtifactStore, MetaMap, PlanArtifactHash, StepId, WorkflowId,
};
use cabin_policy::{
    gather_evaluations, AggregateDecision, CustomRule, PolicyAggregator, PolicyError,
    PolicyEvaluation, SharedBackend,
};
use cabin_protocol::{
    ApprovalRecord, ApprovalRequest, ApprovalResponse, Decision, EngineArtifact, EngineInput,
    EngineMeta, EngineOrchestrator, EngineOutput, EngineStatus, Mode, PlanToken, PreflightInput,
    PreflightOutput, PreflightRequires, State, ValidationError, WorkflowState,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

type Slot = Arc<Mutex<Option<WorkflowStateRecord>>>;

/// Engine output of a flight-plan step, with the context its token binds
#[derive(Debug, Clone, PartialEq)]
pub struct PlanSubmission {
    pub step_id: StepId,
    pub output: EngineOutput,
    /// Model that produced the plan
    pub model: String,
    pub workspace_hash: ContentHash,
    pub governance_hash: Option<ContentHash>,
}

impl PlanSubmission {
    #[must_use]
    pub fn new(
        step_id: StepId,
        output: EngineOutput,
        model: impl Into<String>,
        workspace_hash: ContentHash,
    ) -> Self {
        Self {
            step_id,
            output,
            model: model.into(),
            workspace_hash,
            governance_hash: None,
        }
    }

    #[must_use]
    pub fn with_governance_hash(mut self, hash: ContentHash) -> Self {
        self.governance_hash = Some(hash);
        self
    }
}

/// Outcome of a preflight
#[derive(Debug, Clone, PartialEq)]
pub struct PreflightResult {
    pub output: PreflightOutput,
    pub aggregate: AggregateDecision,
    /// Present when the decision was `require_approval`
    pub approval: Option<ApprovalRequest>,
    pub state: WorkflowState,
}

/// Outcome of [`WorkflowOrchestrator::recover_all`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub recovered: Vec<WorkflowState>,
    /// Workflows whose log could not be replayed, with the reason
    pub failed: Vec<(WorkflowId, String)>,
}

/// Builder for [`WorkflowOrchestrator`]
///
/// Stores not set explicitly come from the config (`wal.dir`,
/// `audit.ledger_path`) or fall back to memory.
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    wal_store: Option<Arc<dyn WalStore>>,
    audit_store: Option<Arc<dyn AuditStore>>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    backends: Vec<SharedBackend>,
    rules: Vec<Arc<dyn CustomRule>>,
    signer: Option<AuditSigner>,
    clock: Option<Arc<dyn Clock>>,
}

impl OrchestratorBuilder {
    #[must_use]
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn wal_store(mut self, store: Arc<dyn WalStore>) -> Self {
        self.wal_store = Some(store);
        self
    }

    #[must_use]
    pub fn audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = Some(store);
        self
    }

    #[must_use]
    pub fn artifact_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(store);
        self
    }

    /// Add a policy backend; preflight calls backends in the order added
    #[must_use]
    pub fn backend(mut self, backend: SharedBackend) -> Self {
        self.backends.push(backend);
        self
    }

    #[must_use]
    pub fn custom_rule(mut self, rule: Arc<dyn CustomRule>) -> Self {
        self.rules.push(rule);
        self
    }

    #[must_use]
    pub fn signer(mut self, signer: AuditSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the config, open stores and verify the audit ledger
    ///
    /// # Errors
    /// Returns error if the config is invalid, a configured custom rule is
    /// not registered, a store cannot be opened or the ledger is broken
    pub fn build(self) -> KernelResult<WorkflowOrchestrator> {
        let config = self.config;
        config.validate()?;

        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let wal_store: Arc<dyn WalStore> = match (self.wal_store, &config.wal.dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FileWalStore::open(dir)?),
            (None, None) => Arc::new(MemoryWalStore::new()),
        };
        let audit_store: Arc<dyn AuditStore> = match (self.audit_store, &config.audit.ledger_path)
        {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FileAuditStore::open(path)?),
            (None, None) => Arc::new(MemoryAuditStore::new()),
        };
        let artifacts = self
            .artifacts
            .unwrap_or_else(|| Arc::new(MemoryArtifactStore::new()));

        let mut aggregator = PolicyAggregator::new(config.policy.aggregation);
        for rule in self.rules {
            aggregator.register_rule(rule);
        }
        if let Some(name) = &config.policy.custom_rule {
            if !aggregator.rule_names().contains(&name.as_str()) {
                return Err(PolicyError::MissingCustomRule(name.clone()).into());
            }
            aggregator = aggregator.using_rule(name.clone());
        }
        let policy_digest = policy_digest(
            &self.backends,
            &aggregator,
            config.policy.custom_rule.as_deref(),
        );

        let audit = AuditChain::open(audit_store, self.signer)?;
        info!(
            backends = self.backends.len(),
            aggregation = %aggregator.method(),
            signed = audit.signer().is_some(),
            "orchestrator ready"
        );

        Ok(WorkflowOrchestrator {
            binder: PlanTokenBinder::new(
                config.plan_token.version.clone(),
                config.plan_token.salt.clone(),
            ),
            approvals: ApprovalManager::new(
                config.approval.default_role.clone(),
                config.approval.require_named_approver,
            ),
            wal: WriteAheadLog::with_clock(wal_store, clock.clone()),
            audit,
            artifacts,
            backends: self.backends,
            aggregator,
            policy_digest,
            clock,
            slots: DashMap::new(),
            config,
        })
    }
}

/// Digest of the policy setup a plan was bound under
fn policy_digest(
    backends: &[SharedBackend],
    aggregator: &PolicyAggregator,
    custom_rule: Option<&str>,
) -> ContentHash {
    let mut ids: Vec<&str> = backends.iter().map(|b| b.policy_id()).collect();
    ids.sort_unstable();
    let mut hasher = FieldHasher::new();
    hasher.str_field(aggregator.method().as_str());
    hasher.str_field(custom_rule.unwrap_or_default());
    for id in ids {
        hasher.str_field(id);
    }
    hasher.finish()
}

/// Gated flight-plan / take-off orchestrator
pub struct WorkflowOrchestrator {
    config: OrchestratorConfig,
    wal: WriteAheadLog,
    audit: AuditChain,
    artifacts: Arc<dyn ArtifactStore>,
    backends: Vec<SharedBackend>,
    aggregator: PolicyAggregator,
    binder: PlanTokenBinder,
    approvals: ApprovalManager,
    policy_digest: ContentHash,
    clock: Arc<dyn Clock>,
    slots: DashMap<WorkflowId, Slot>,
}

impl std::fmt::Debug for WorkflowOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowOrchestrator")
            .field("workflows", &self.slots.len())
            .field("backends", &self.backends.len())
            .field("aggregator", &self.aggregator)
            .finish_non_exhaustive()
    }
}

impl WorkflowOrchestrator {
    #[must_use]
    pub fn builder(config: OrchestratorConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Digest recorded as `policy_digest` on every plan token
    #[must_use]
    pub fn policy_digest(&self) -> ContentHash {
        self.policy_digest
    }

    // ---- lifecycle ----

    /// Open a new workflow
    ///
    /// # Errors
    /// [`KernelError::DuplicateWorkflow`] if the id already has a log
    #[instrument(skip_all, fields(workflow_id = %workflow_id))]
    pub fn start_workflow(
        &self,
        workflow_id: &WorkflowId,
        context: MetaMap,
    ) -> KernelResult<WorkflowState> {
        let slot = self.slot(workflow_id);
        let mut guard = slot.lock();
        self.load(workflow_id, &mut guard)?;
        if guard.is_some() {
            return Err(KernelError::DuplicateWorkflow(workflow_id.clone()));
        }

        let now = self.clock.now();
        let started = WorkflowStartedData {
            initial_state: State::Init,
            context,
        };
        let record = WorkflowStateRecord::begin(workflow_id.clone(), 1, now, &started)?;
        let entries =
            self.wal
                .append_batch_at(workflow_id, vec![WalEntryData::WorkflowStarted(started)], now)?;
        if entries.first().map(|e| e.sequence) != Some(1) {
            return Err(KernelError::DuplicateWorkflow(workflow_id.clone()));
        }
        let state = record.workflow_state();
        info!(state = %record.current_state, "workflow started");
        let event = self.event("workflow_started", &record, None);
        *guard = Some(record);
        drop(guard);

        self.audit(event.with_severity(AuditSeverity::Info))?;
        Ok(state)
    }

    /// Verify a flight-plan's artifacts and bind its plan token
    ///
    /// Every artifact hash the engine reported is recomputed from storage.
    /// A mismatch fails the workflow.
    ///
    /// # Errors
    /// - validation errors for malformed output or missing artifacts
    /// - [`ArtifactError::HashMismatch`] (fatal) when stored content differs
    /// - [`KernelError::InvalidState`] unless the workflow is planning
    #[instrument(skip_all, fields(workflow_id = %workflow_id, step_id = %submission.step_id))]
    pub fn record_plan_generated(
        &self,
        workflow_id: &WorkflowId,
        submission: PlanSubmission,
    ) -> KernelResult<PlanToken> {
        let slot = self.slot(workflow_id);
        let mut guard = slot.lock();
        let record = self.loaded(workflow_id, &mut guard)?;
        require_state(record, &[State::PlanRunning], "record a plan for")?;

        let PlanSubmission {
            step_id,
            output,
            model,
            workspace_hash,
            governance_hash,
        } = submission;
        output.validate(Mode::FlightPlan)?;
        output.require_protocol(&self.config.protocol_version)?;
        output.require_success()?;
        if output.artifacts().is_empty() {
            return Err(ValidationError::MissingField("artifacts").into());
        }

        let verified = match self.verify_artifacts(output.artifacts())? {
            Ok(verified) => verified,
            Err(mismatch) => {
                let err = mismatch.error();
                self.fail_integrity(record, &step_id, err.to_string(), mismatch.integrity())?;
                return Err(err.into());
            }
        };

        let now = self.clock.now();
        let mut provenance =
            PlanProvenance::new(model, output.engine_id.clone(), output.protocol_version.clone())
                .with_policy_digest(self.policy_digest);
        if let Some(hash) = governance_hash {
            provenance = provenance.with_governance_hash(hash);
        }
        let token = self.binder.bind(
            verified.iter().map(|v| v.plan_entry()).collect(),
            &provenance,
            workspace_hash,
            now,
        )?;

        let mut batch = vec![WalEntryData::StepStarted(StepStartedData {
            step_id: step_id.clone(),
            step_type: StepType::FlightPlan,
            expected_plan_token: None,
        })];
        for artifact in &verified {
            batch.push(WalEntryData::ArtifactCreated(artifact.created(&step_id)?));
        }
        batch.push(WalEntryData::StepCompleted(StepCompletedData {
            step_id: step_id.clone(),
            step_type: StepType::FlightPlan,
            artifacts: verified.iter().map(|v| v.artifact.name.clone()).collect(),
            plan_token: Some(token.clone()),
            decision: None,
        }));
        self.commit(record, batch)?;
        info!(
            state = %record.current_state,
            plan_token = %token.token.short(),
            artifacts = verified.len(),
            "plan token created"
        );

        let event = self
            .event("plan_token_created", record, Some(&step_id))
            .with_engine(AuditEngine::from(&output))
            .with_plan_token(token.clone())
            .with_artifacts(output.artifacts().iter().map(AuditArtifact::from).collect())
            .with_severity(AuditSeverity::Info);
        drop(guard);
        self.audit(event)?;
        Ok(token)
    }

    /// Gather policy evaluations for the current plan and record the result
    ///
    /// The plan token recorded at plan time is handed to backends; a request
    /// carrying a different token fails the workflow.
    ///
    /// # Errors
    /// Same as [`WorkflowOrchestrator::record_preflight`], plus validation
    /// of the request
    #[instrument(skip_all, fields(workflow_id = %workflow_id, step_id = %request.step_id))]
    pub async fn run_preflight(
        &self,
        workflow_id: &WorkflowId,
        mut request: PreflightInput,
    ) -> KernelResult<PreflightResult> {
        {
            let slot = self.slot(workflow_id);
            let mut guard = slot.lock();
            let record = self.loaded(workflow_id, &mut guard)?;
            require_state(record, &[State::TokenCreated], "run preflight for")?;
            if &request.workflow_id != workflow_id {
                return Err(ValidationError::UnknownValue {
                    field: "workflow_id",
                    value: request.workflow_id.to_string(),
                }
                .into());
            }
            request.engine_output.validate(request.mode)?;

            let token = record
                .plan_token
                .clone()
                .ok_or(ValidationError::MissingField("plan_token"))?;
            match &request.plan_token {
                Some(presented) if !self.binder.verify(&presented.token, &token) => {
                    let actual = presented.token;
                    return Err(self.token_mismatch(record, &request.step_id, token.token, actual));
                }
                Some(_) => {}
                None => request.plan_token = Some(token),
            }
        }

        let evaluations =
            gather_evaluations(&self.backends, &request, self.config.policy_timeout()).await;
        debug!(evaluations = evaluations.len(), "policy evaluations gathered");
        self.record_preflight(workflow_id, &request.step_id, evaluations)
    }

    /// Aggregate pre-gathered evaluations and record the preflight
    ///
    /// `require_approval` opens an approval request; `deny` fails the
    /// workflow; `allow` and `warn` make it ready for take-off.
    ///
    /// # Errors
    /// - [`PolicyError::NoPoliciesEvaluated`] and other aggregation errors;
    ///   the workflow is unchanged
    /// - [`KernelError::InvalidState`] unless a plan token was just created
    #[instrument(skip_all, fields(workflow_id = %workflow_id, step_id = %step_id))]
    pub fn record_preflight(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        evaluations: Vec<PolicyEvaluation>,
    ) -> KernelResult<PreflightResult> {
        let slot = self.slot(workflow_id);
        let mut guard = slot.lock();
        let record = self.loaded(workflow_id, &mut guard)?;
        require_state(record, &[State::TokenCreated], "record preflight for")?;

        let aggregate = match self.aggregator.aggregate(evaluations) {
            Ok(aggregate) => aggregate,
            Err(e) => {
                warn!(error = %e, "preflight rejected");
                let event = self
                    .event("preflight_rejected", record, Some(step_id))
                    .with_message(e.to_string())
                    .with_severity(AuditSeverity::Warning);
                drop(guard);
                self.audit_quietly(event);
                return Err(e.into());
            }
        };
        let plan_token_hash = record
            .plan_token_hash
            .ok_or(ValidationError::MissingField("plan_token_hash"))?;

        let mut batch = vec![WalEntryData::StepStarted(StepStartedData {
            step_id: step_id.clone(),
            step_type: StepType::Preflight,
            expected_plan_token: None,
        })];
        for evaluation in &aggregate.evaluations {
            let evaluation_id = uuid::Uuid::new_v4().to_string();
            batch.push(WalEntryData::PolicyEvaluated(
                evaluation.to_record(evaluation_id, step_id.clone())?,
            ));
        }
        batch.push(WalEntryData::StepCompleted(StepCompletedData {
            step_id: step_id.clone(),
            step_type: StepType::Preflight,
            artifacts: Vec::new(),
            plan_token: None,
            decision: Some(aggregate.decision),
        }));

        let mut output = PreflightOutput::new(aggregate.decision);
        output.violations = aggregate.violations.clone();
        output.warnings = aggregate.warnings.clone();

        let mut approval = None;
        match aggregate.decision {
            Decision::RequireApproval => {
                let n = u64::try_from(record.approvals.len() + record.pending_approvals.len())
                    .map_or(u64::MAX, |n| n + 1);
                let approval_step = StepId::numbered("approval", n)
                    .ok_or(ValidationError::MissingField("step_id"))?;
                let reason = aggregate
                    .deciding()
                    .and_then(|e| e.reason.clone())
                    .unwrap_or_else(|| "policy requires approval".to_string());
                let request = self.approvals.request(
                    workflow_id.clone(),
                    approval_step.clone(),
                    None,
                    plan_token_hash,
                    reason.clone(),
                );
                batch.push(WalEntryData::ApprovalRequested(ApprovalRequestedData {
                    approval_id: request.approval_id.clone(),
                    step_id: approval_step.clone(),
                    required_role: request.required_role.clone(),
                    plan_token_hash,
                    reason: reason.clone(),
                }));
                batch.push(WalEntryData::StepStarted(StepStartedData {
                    step_id: approval_step,
                    step_type: StepType::Approval,
                    expected_plan_token: Some(plan_token_hash),
                }));
                output.requires = Some(PreflightRequires {
                    role: Some(request.required_role.clone()),
                    reason: Some(reason),
                });
                approval = Some(request);
            }
            Decision::Deny => {
                let error = if aggregate.violations.is_empty() {
                    "preflight denied".to_string()
                } else {
                    aggregate.violations.join("; ")
                };
                batch.push(WalEntryData::WorkflowFailed(WorkflowFailedData {
                    error,
                    failed_step: Some(step_id.clone()),
                    kind: FailureKind::PolicyDenied,
                }));
            }
            Decision::Allow | Decision::Warn => {}
        }

        self.commit(record, batch)?;
        info!(
            decision = %aggregate.decision,
            method = %aggregate.method,
            state = %record.current_state,
            "preflight complete"
        );

        let severity = match aggregate.decision {
            Decision::Deny => AuditSeverity::Warning,
            _ => AuditSeverity::Info,
        };
        let mut event = self
            .event("preflight_complete", record, Some(step_id))
            .with_policy(AuditPolicy::from_aggregate(&aggregate, record.current_state))
            .with_severity(severity);
        if let Some(request) = &approval {
            event = event.with_approval(AuditApproval {
                approval_id: request.approval_id.clone(),
                required_role: Some(request.required_role.clone()),
                approved: None,
                approver: None,
                reason: Some(request.reason.clone()),
            });
        }
        let state = record.workflow_state();
        drop(guard);
        self.audit(event)?;

        Ok(PreflightResult {
            output,
            aggregate,
            approval,
            state,
        })
    }

    /// Resolve a pending approval
    ///
    /// A grant makes the workflow ready for take-off; a denial fails it.
    ///
    /// # Errors
    /// [`ApprovalError`] variants for unknown, resolved or replayed
    /// approvals; the workflow is unchanged and the rejection is audited
    #[instrument(skip_all, fields(workflow_id = %workflow_id, approval_id = %response.approval_id))]
    pub fn submit_approval(
        &self,
        workflow_id: &WorkflowId,
        response: ApprovalResponse,
    ) -> KernelResult<ApprovalRecord> {
        let slot = self.slot(workflow_id);
        let mut guard = slot.lock();
        let record = self.loaded(workflow_id, &mut guard)?;

        let resolved = match self.approvals.respond(record, &response, self.clock.now()) {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(error = %e, "approval rejected");
                let event = self
                    .event("approval_rejected", record, None)
                    .with_approval(AuditApproval {
                        approval_id: response.approval_id.clone(),
                        required_role: None,
                        approved: Some(response.approved),
                        approver: response.approver.clone(),
                        reason: Some(e.to_string()),
                    })
                    .with_severity(AuditSeverity::Warning);
                drop(guard);
                self.audit_quietly(event);
                return Err(e.into());
            }
        };
        let required_role = record
            .pending_approval(&resolved.approval_id)
            .map(|p| p.required_role.clone());

        let mut batch = vec![WalEntryData::ApprovalReceived(ApprovalReceivedData::from(
            resolved.clone(),
        ))];
        if resolved.approved {
            batch.push(WalEntryData::StepCompleted(StepCompletedData {
                step_id: resolved.step_id.clone(),
                step_type: StepType::Approval,
                artifacts: Vec::new(),
                plan_token: None,
                decision: None,
            }));
        } else {
            batch.push(WalEntryData::WorkflowFailed(WorkflowFailedData {
                error: format!("approval denied by {}", resolved.approver),
                failed_step: Some(resolved.step_id.clone()),
                kind: FailureKind::ApprovalDenied,
            }));
        }
        self.commit(record, batch)?;
        info!(
            approved = resolved.approved,
            approver = %resolved.approver,
            state = %record.current_state,
            "approval resolved"
        );

        let event_type = if resolved.approved {
            "approval_granted"
        } else {
            "approval_denied"
        };
        let event = self
            .event(event_type, record, Some(&resolved.step_id))
            .with_approval(AuditApproval {
                approval_id: resolved.approval_id.clone(),
                required_role,
                approved: Some(resolved.approved),
                approver: Some(resolved.approver.clone()),
                reason: resolved.reason.clone(),
            })
            .with_severity(AuditSeverity::Info);
        drop(guard);
        self.audit(event)?;
        Ok(resolved)
    }

    /// Engine input for the take-off step, pinned to the recorded plan
    ///
    /// # Errors
    /// [`KernelError::InvalidState`] unless the workflow is ready for
    /// take-off
    pub fn prepare_takeoff_input(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
    ) -> KernelResult<EngineInput> {
        let slot = self.slot(workflow_id);
        let mut guard = slot.lock();
        let record = self.loaded(workflow_id, &mut guard)?;
        require_state(record, &[State::ReadyForTakeoff], "prepare take-off for")?;
        let token = record
            .plan_token
            .as_ref()
            .ok_or(ValidationError::MissingField("plan_token"))?;

        let mut input = EngineInput::new(
            self.config.protocol_version.clone(),
            Mode::TakeOff,
            EngineMeta {
                workflow_id: workflow_id.clone(),
                step_id: step_id.clone(),
            },
        );
        if !record.metadata.is_empty() {
            input.context = Some(record.metadata.clone());
        }
        input.orchestrator = Some(EngineOrchestrator {
            run_index: Some(record.last_sequence),
            workspace_hash: Some(token.workspace_hash),
            artifacts_salt: None,
        });
        input.expected_plan_token = Some(token.token);
        Ok(input)
    }

    /// Start take-off, after checking the presented plan token
    ///
    /// `expected_plan_token` must equal the token recorded at plan time. If
    /// `engine_output` names a plan token it must match too.
    ///
    /// # Errors
    /// [`KernelError::PlanTokenMismatch`] (fatal; the workflow is failed and
    /// an integrity event is audited)
    #[instrument(skip_all, fields(workflow_id = %workflow_id, step_id = %step_id))]
    pub fn record_takeoff(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        expected_plan_token: &ContentHash,
        engine_output: Option<&EngineOutput>,
    ) -> KernelResult<WorkflowState> {
        let slot = self.slot(workflow_id);
        let mut guard = slot.lock();
        let record = self.loaded(workflow_id, &mut guard)?;
        require_state(record, &[State::ReadyForTakeoff], "take off")?;
        if let Some(output) = engine_output {
            output.validate(Mode::TakeOff)?;
        }
        let token = record
            .plan_token
            .clone()
            .ok_or(ValidationError::MissingField("plan_token"))?;

        let presented = if self.binder.verify(expected_plan_token, &token) {
            engine_output
                .and_then(|o| o.plan_token)
                .filter(|claimed| !self.binder.verify(claimed, &token))
        } else {
            Some(*expected_plan_token)
        };
        if let Some(actual) = presented {
            return Err(self.token_mismatch(record, step_id, token.token, actual));
        }

        self.commit(
            record,
            vec![WalEntryData::StepStarted(StepStartedData {
                step_id: step_id.clone(),
                step_type: StepType::TakeOff,
                expected_plan_token: Some(*expected_plan_token),
            })],
        )?;
        info!(state = %record.current_state, "take-off started");

        let mut event = self
            .event("takeoff_started", record, Some(step_id))
            .with_integrity(AuditIntegrity {
                expected_plan_token: Some(token.token),
                actual_plan_token: Some(*expected_plan_token),
                plan_token_match: Some(true),
                ..AuditIntegrity::default()
            })
            .with_severity(AuditSeverity::Info);
        if let Some(output) = engine_output {
            event = event.with_engine(AuditEngine::from(output));
        }
        let state = record.workflow_state();
        drop(guard);
        self.audit(event)?;
        Ok(state)
    }

    /// Record the take-off engine's result
    ///
    /// A failed engine run fails the workflow with `engine_failure` and is
    /// returned as the new state, not as an error.
    ///
    /// # Errors
    /// Validation errors for malformed output; integrity errors (fatal) if
    /// produced artifacts or the reported plan token do not check out
    #[instrument(skip_all, fields(workflow_id = %workflow_id, step_id = %step_id))]
    pub fn record_execution_complete(
        &self,
        workflow_id: &WorkflowId,
        step_id: &StepId,
        output: &EngineOutput,
    ) -> KernelResult<WorkflowState> {
        let slot = self.slot(workflow_id);
        let mut guard = slot.lock();
        let record = self.loaded(workflow_id, &mut guard)?;
        require_state(record, &[State::TakeoffRunning], "complete execution for")?;
        output.validate(Mode::TakeOff)?;
        output.require_protocol(&self.config.protocol_version)?;
        let token_hash = record
            .plan_token_hash
            .ok_or(ValidationError::MissingField("plan_token_hash"))?;

        if output.status == EngineStatus::Failure {
            let error = output
                .error
                .clone()
                .unwrap_or_else(|| "take-off engine failed".to_string());
            self.commit(
                record,
                vec![WalEntryData::WorkflowFailed(WorkflowFailedData {
                    error: error.clone(),
                    failed_step: Some(step_id.clone()),
                    kind: FailureKind::EngineFailure,
                })],
            )?;
            error!(%error, "take-off engine failed");
            let event = self
                .event("workflow_failed", record, Some(step_id))
                .with_engine(AuditEngine::from(output))
                .with_message(error)
                .with_severity(AuditSeverity::Error);
            let state = record.workflow_state();
            drop(guard);
            self.audit(event)?;
            return Ok(state);
        }

        if let Some(claimed) = output.plan_token {
            if !claimed.ct_eq(&token_hash) {
                return Err(self.token_mismatch(record, step_id, token_hash, claimed));
            }
        }
        let verified = match self.verify_artifacts(output.artifacts())? {
            Ok(verified) => verified,
            Err(mismatch) => {
                let err = mismatch.error();
                self.fail_integrity(record, step_id, err.to_string(), mismatch.integrity())?;
                return Err(err.into());
            }
        };

        let mut batch = Vec::with_capacity(verified.len() + 1);
        for artifact in &verified {
            batch.push(WalEntryData::ArtifactCreated(artifact.created(step_id)?));
        }
        batch.push(WalEntryData::StepCompleted(StepCompletedData {
            step_id: step_id.clone(),
            step_type: StepType::TakeOff,
            artifacts: verified.iter().map(|v| v.artifact.name.clone()).collect(),
            plan_token: None,
            decision: None,
        }));
        self.commit(record, batch)?;
        info!(state = %record.current_state, artifacts = verified.len(), "execution complete");

        let event = self
            .event("execution_complete", record, Some(step_id))
            .with_engine(AuditEngine::from(output))
            .with_artifacts(output.artifacts().iter().map(AuditArtifact::from).collect())
            .with_severity(AuditSeverity::Info);
        let state = record.workflow_state();
        drop(guard);
        self.audit(event)?;
        Ok(state)
    }

    /// Close a workflow whose take-off has run
    ///
    /// # Errors
    /// [`KernelError::InvalidState`] unless take-off is running or complete
    #[instrument(skip_all, fields(workflow_id = %workflow_id))]
    pub fn complete_workflow(
        &self,
        workflow_id: &WorkflowId,
        final_artifacts: Vec<String>,
    ) -> KernelResult<WorkflowState> {
        let slot = self.slot(workflow_id);
        let mut guard = slot.lock();
        let record = self.loaded(workflow_id, &mut guard)?;
        require_state(
            record,
            &[State::TakeoffRunning, State::ExecutionComplete],
            "complete",
        )?;
        self.commit(
            record,
            vec![WalEntryData::WorkflowCompleted(WorkflowCompletedData {
                final_state: State::Completed,
                artifacts: final_artifacts,
            })],
        )?;
        info!(state = %record.current_state, "workflow completed");

        let event = self
            .event("workflow_completed", record, None)
            .with_severity(AuditSeverity::Info);
        let state = record.workflow_state();
        drop(guard);
        self.audit(event)?;
        Ok(state)
    }

    /// Cancel a workflow
    ///
    /// # Errors
    /// [`KernelError::InvalidState`] if the workflow already ended
    pub fn fail_workflow(
        &self,
        workflow_id: &WorkflowId,
        error: impl Into<String>,
        failed_step: Option<StepId>,
    ) -> KernelResult<WorkflowState> {
        self.fail_workflow_with_kind(workflow_id, error, failed_step, FailureKind::Cancelled)
    }

    /// Fail a workflow with an explicit failure kind
    ///
    /// # Errors
    /// [`KernelError::InvalidState`] if the workflow already ended
    #[instrument(skip_all, fields(workflow_id = %workflow_id, kind = ?kind))]
    pub fn fail_workflow_with_kind(
        &self,
        workflow_id: &WorkflowId,
        error: impl Into<String>,
        failed_step: Option<StepId>,
        kind: FailureKind,
    ) -> KernelResult<WorkflowState> {
        let slot = self.slot(workflow_id);
        let mut guard = slot.lock();
        let record = self.loaded(workflow_id, &mut guard)?;
        if record.is_terminal() {
            return Err(KernelError::InvalidState {
                workflow_id: workflow_id.clone(),
                operation: "fail",
                state: record.current_state,
            });
        }
        let error = error.into();
        self.commit(
            record,
            vec![WalEntryData::WorkflowFailed(WorkflowFailedData {
                error: error.clone(),
                failed_step: failed_step.clone(),
                kind,
            })],
        )?;
        warn!(%error, "workflow failed");

        let event = self
            .event("workflow_failed", record, failed_step.as_ref())
            .with_message(error)
            .with_severity(AuditSeverity::Error);
        let state = record.workflow_state();
        drop(guard);
        self.audit(event)?;
        Ok(state)
    }

    // ---- queries ----

    /// Current state of a workflow
    ///
    /// # Errors
    /// [`KernelError::UnknownWorkflow`], or a WAL error if the log cannot
    /// be replayed
    pub fn workflow_state(&self, workflow_id: &WorkflowId) -> KernelResult<WorkflowState> {
        let slot = self.slot(workflow_id);
        let mut guard = slot.lock();
        Ok(self.loaded(workflow_id, &mut guard)?.workflow_state())
    }

    /// Full materialized record of a workflow
    ///
    /// # Errors
    /// Same as [`WorkflowOrchestrator::workflow_state`]
    pub fn state_record(&self, workflow_id: &WorkflowId) -> KernelResult<WorkflowStateRecord> {
        let slot = self.slot(workflow_id);
        let mut guard = slot.lock();
        Ok(self.loaded(workflow_id, &mut guard)?.clone())
    }

    /// Rebuild a workflow's record from its WAL, replacing the cache
    ///
    /// # Errors
    /// [`KernelError::UnknownWorkflow`] for an empty log; WAL or fold errors
    /// for a log that does not verify
    #[instrument(skip_all, fields(workflow_id = %workflow_id))]
    pub fn recover(&self, workflow_id: &WorkflowId) -> KernelResult<WorkflowStateRecord> {
        let slot = self.slot(workflow_id);
        let mut guard = slot.lock();
        *guard = None;
        let record = self.loaded(workflow_id, &mut guard)?.clone();
        info!(
            state = %record.current_state,
            sequence = record.last_sequence,
            "workflow recovered"
        );
        Ok(record)
    }

    /// Recover every workflow in the WAL store
    ///
    /// One unreadable log does not stop the others; it is listed in
    /// [`RecoveryReport::failed`].
    ///
    /// # Errors
    /// Returns error only if the store cannot be listed
    pub fn recover_all(&self) -> KernelResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for workflow_id in self.wal.workflows()? {
            match self.recover(&workflow_id) {
                Ok(record) => report.recovered.push(record.workflow_state()),
                Err(e) => {
                    error!(workflow_id = %workflow_id, error = %e, "workflow recovery failed");
                    report.failed.push((workflow_id, e.to_string()));
                }
            }
        }
        Ok(report)
    }

    /// Every audit event, in ledger order
    ///
    /// # Errors
    /// Returns error if the ledger cannot be read
    pub fn audit_events(&self) -> KernelResult<Vec<AuditEvent>> {
        Ok(self.audit.events()?)
    }

    /// Recompute the audit chain
    ///
    /// # Errors
    /// Returns error if the ledger cannot be read
    pub fn verify_audit(&self) -> KernelResult<ChainVerification> {
        Ok(self.audit.verify()?)
    }

    // ---- internals ----

    fn slot(&self, workflow_id: &WorkflowId) -> Slot {
        self.slots
            .entry(workflow_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Fill an empty slot from the WAL. Leaves it empty for an empty log.
    fn load(
        &self,
        workflow_id: &WorkflowId,
        slot: &mut Option<WorkflowStateRecord>,
    ) -> KernelResult<()> {
        if slot.is_some() {
            return Ok(());
        }
        let entries = match self.wal.replay(workflow_id) {
            Ok(entries) => entries,
            Err(e) if e.is_corruption() => {
                self.audit_corruption(workflow_id, &e);
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };
        if !entries.is_empty() {
            let record = fold_state(&entries)?;
            debug!(
                workflow_id = %workflow_id,
                state = %record.current_state,
                sequence = record.last_sequence,
                "workflow loaded from WAL"
            );
            *slot = Some(record);
        }
        Ok(())
    }

    fn loaded<'a>(
        &self,
        workflow_id: &WorkflowId,
        slot: &'a mut Option<WorkflowStateRecord>,
    ) -> KernelResult<&'a mut WorkflowStateRecord> {
        self.load(workflow_id, slot)?;
        slot.as_mut()
            .ok_or_else(|| KernelError::UnknownWorkflow(workflow_id.clone()))
    }

    /// Fold `batch` against a copy, append it, then swap the copy in
    fn commit(
        &self,
        record: &mut WorkflowStateRecord,
        batch: Vec<WalEntryData>,
    ) -> KernelResult<()> {
        let now = self.clock.now();
        let first = record.last_sequence + 1;
        let mut next = record.clone();
        for (sequence, data) in (first..).zip(&batch) {
            next.apply_parts(sequence, now, data)?;
        }

        let entries = match self.wal.append_batch_at(&record.workflow_id, batch, now) {
            Ok(entries) => entries,
            Err(err) => {
                self.resync(record);
                return Err(err.into());
            }
        };
        let committed = entries.first().map_or(0, |e| e.sequence);
        if committed != first {
            // The log moved underneath the cache; rebuild from what is durable
            let replayed = self.wal.replay(&record.workflow_id)?;
            *record = fold_state(&replayed)?;
            return Err(WalError::CorruptedLogEntry {
                workflow_id: record.workflow_id.to_string(),
                sequence: committed,
                reason: format!("expected to commit at sequence {first}"),
            }
            .into());
        }
        debug!(
            workflow_id = %record.workflow_id,
            first,
            last = next.last_sequence,
            state = %next.current_state,
            "entries committed"
        );
        *record = next;
        Ok(())
    }

    /// Rebuild `record` from the WAL after a failed write
    ///
    /// A store can fail after part of a batch reached it. Whatever is
    /// durable now is the truth; if the log cannot be read the record is
    /// left alone and the next append fails on the same replay.
    fn resync(&self, record: &mut WorkflowStateRecord) {
        let rebuilt = self
            .wal
            .replay(&record.workflow_id)
            .map_err(KernelError::from)
            .and_then(|entries| fold_state(&entries).map_err(KernelError::from));
        match rebuilt {
            Ok(durable) => {
                if durable.last_sequence != record.last_sequence {
                    warn!(
                        workflow_id = %record.workflow_id,
                        cached = record.last_sequence,
                        durable = durable.last_sequence,
                        "failed write left entries in the WAL"
                    );
                }
                *record = durable;
            }
            Err(err) => {
                error!(workflow_id = %record.workflow_id, error = %err, "cannot rebuild record from WAL");
            }
        }
    }

    /// Re-hash every reported artifact from storage
    ///
    /// The outer error is a storage or validation failure; the inner one a
    /// content mismatch.
    fn verify_artifacts(
        &self,
        reported: &[EngineArtifact],
    ) -> KernelResult<Result<Vec<VerifiedArtifact>, ArtifactMismatch>> {
        let mut verified = Vec::with_capacity(reported.len());
        let mut mismatch = ArtifactMismatch::default();
        for artifact in reported {
            if !self.artifacts.exists(&artifact.path)? {
                return Err(ArtifactError::NotFound(artifact.path.clone()).into());
            }
            let (actual, size) = self.artifacts.hash(&artifact.path)?;
            if actual.ct_eq(&artifact.hash) {
                verified.push(VerifiedArtifact {
                    artifact: artifact.clone(),
                    size,
                });
            } else {
                mismatch.push(artifact, actual);
            }
        }
        if mismatch.is_empty() {
            Ok(Ok(verified))
        } else {
            Ok(Err(mismatch))
        }
    }

    /// Fail the workflow for a token mismatch and build the error to return
    fn token_mismatch(
        &self,
        record: &mut WorkflowStateRecord,
        step_id: &StepId,
        expected: ContentHash,
        actual: ContentHash,
    ) -> KernelError {
        let mismatch = KernelError::PlanTokenMismatch {
            workflow_id: record.workflow_id.clone(),
            expected,
            actual,
        };
        let integrity = AuditIntegrity {
            expected_plan_token: Some(expected),
            actual_plan_token: Some(actual),
            plan_token_match: Some(false),
            artifacts_match: None,
            differences: vec![format!("plan token {actual} does not match recorded {expected}")],
        };
        match self.fail_integrity(record, step_id, mismatch.to_string(), integrity) {
            Ok(()) => mismatch,
            Err(e) => e,
        }
    }

    /// Append `workflow_failed(integrity)` and audit it as critical
    fn fail_integrity(
        &self,
        record: &mut WorkflowStateRecord,
        step_id: &StepId,
        error: String,
        integrity: AuditIntegrity,
    ) -> KernelResult<()> {
        error!(workflow_id = %record.workflow_id, %error, "integrity check failed");
        self.commit(
            record,
            vec![WalEntryData::WorkflowFailed(WorkflowFailedData {
                error: error.clone(),
                failed_step: Some(step_id.clone()),
                kind: FailureKind::Integrity,
            })],
        )?;
        let event = self
            .event("integrity_failure", record, Some(step_id))
            .with_integrity(integrity)
            .with_message(error)
            .with_severity(AuditSeverity::Critical);
        self.audit_quietly(event);
        Ok(())
    }

    fn audit_corruption(&self, workflow_id: &WorkflowId, err: &WalError) {
        error!(workflow_id = %workflow_id, error = %err, "WAL failed verification");
        let state = self
            .wal
            .replay_prefix(workflow_id)
            .ok()
            .and_then(|(prefix, _)| fold_state(&prefix).ok())
            .map_or(State::Init, |r| r.current_state);
        let event = AuditEvent::new("wal_corruption", state, self.clock.now())
            .with_workflow(AuditWorkflow::new(workflow_id.clone(), None))
            .with_integrity(AuditIntegrity {
                differences: vec![err.to_string()],
                ..AuditIntegrity::default()
            })
            .with_message(err.to_string())
            .with_severity(AuditSeverity::Critical);
        self.audit_quietly(event);
    }

    fn event(
        &self,
        event_type: &str,
        record: &WorkflowStateRecord,
        step_id: Option<&StepId>,
    ) -> AuditEvent {
        AuditEvent::new(event_type, record.current_state, self.clock.now()).with_workflow(
            AuditWorkflow::new(record.workflow_id.clone(), step_id.cloned()),
        )
    }

    fn audit(&self, event: AuditEvent) -> KernelResult<()> {
        self.audit.append(event)?;
        Ok(())
    }

    /// Audit on a path that is already returning an error
    fn audit_quietly(&self, event: AuditEvent) {
        if let Err(e) = self.audit.append(event) {
            error!(error = %e, "failed to write audit event");
        }
    }
}

fn require_state(
    record: &WorkflowStateRecord,
    allowed: &[State],
    operation: &'static str,
) -> KernelResult<()> {
    if allowed.contains(&record.current_state) {
        Ok(())
    } else {
        Err(KernelError::InvalidState {
            workflow_id: record.workflow_id.clone(),
            operation,
            state: record.current_state,
        })
    }
}

/// Engine artifact whose stored content matched its reported hash
struct VerifiedArtifact {
    artifact: EngineArtifact,
    size: u64,
}

impl VerifiedArtifact {
    fn plan_entry(&self) -> PlanArtifactHash {
        PlanArtifactHash::new(self.artifact.name.clone(), self.artifact.hash).with_size(self.size)
    }

    fn created(&self, step_id: &StepId) -> KernelResult<ArtifactCreatedData> {
        Ok(ArtifactCreatedData {
            artifact_id: self.artifact.name.clone(),
            step_id: step_id.clone(),
            artifact_hash: self.artifact.hash,
            artifact_type: ArtifactKind::new(self.artifact.role.as_str())?,
            metadata: Some(meta_map([("path", self.artifact.path.as_str())])),
        })
    }
}

/// Reported artifacts whose stored content hashed differently
#[derive(Default)]
struct ArtifactMismatch {
    first: Option<(String, ContentHash, ContentHash)>,
    differences: Vec<String>,
}

impl ArtifactMismatch {
    fn push(&mut self, artifact: &EngineArtifact, actual: ContentHash) {
        self.differences.push(format!(
            "{}: reported {}, stored {}",
            artifact.name, artifact.hash, actual
        ));
        if self.first.is_none() {
            self.first = Some((artifact.name.clone(), artifact.hash, actual));
        }
    }

    fn is_empty(&self) -> bool {
        self.differences.is_empty()
    }

    fn error(&self) -> ArtifactError {
        match &self.first {
            Some((name, expected, actual)) => ArtifactError::HashMismatch {
                name: name.clone(),
                expected: *expected,
                actual: *actual,
            },
            None => ArtifactError::NotFound(String::new()),
        }
    }

    fn integrity(&self) -> AuditIntegrity {
        AuditIntegrity {
            artifacts_match: Some(false),
            differences: self.differences.clone(),
            ..AuditIntegrity::default()
        }
    }
}
