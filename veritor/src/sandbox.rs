//! Deterministic sandbox.
//!
//! Runs a plan under an execution domain, enforcing — in order — the domain
//! precondition, the capability precondition, and the resource quota, then
//! executes steps in plan order through the [`SkillExecutor`] seam. The
//! resulting state hash covers only node-independent data (step ids, step
//! success, used capabilities), so replaying the same plan with the same
//! context on any node reproduces it bit-identically.
//!
//! Quota violations, capability denials and policy violations are terminal:
//! the current step fails, the remaining steps are skipped, and the result
//! reports the first failure.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::audit::{AuditChain, AuditEventType};
use crate::canonical::hash_value;
use crate::clock::SharedClock;
use crate::errors::{CapabilityError, FabricError, FabricResult};
use crate::governance::revocation::RevocationList;
use crate::governance::token::{CapabilityToken, TokenVerifier};
use crate::isolation::capability_matches;
use crate::isolation::domain::ExecutionDomain;
use crate::isolation::quota::{ExecutionQuota, QuotaLimits};
use crate::planning::plan::{Plan, PlanStep};
use crate::PROTOCOL_VERSION;

/// Capability-bound context an execution runs with.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub agent_id: String,
    pub tenant_id: String,
    pub task_id: String,
    pub tokens: Vec<CapabilityToken>,
    pub execution_seed: u64,
    /// Requested admission footprint, checked against the quota up front.
    pub cpu_seconds: u64,
    pub memory_mb: u64,
    /// Cooperative cancellation flag; checked between steps.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl ExecutionContext {
    pub fn new(
        agent_id: impl Into<String>,
        tenant_id: impl Into<String>,
        task_id: impl Into<String>,
        tokens: Vec<CapabilityToken>,
        execution_seed: u64,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            tenant_id: tenant_id.into(),
            task_id: task_id.into(),
            tokens,
            execution_seed,
            cpu_seconds: 0,
            memory_mb: 0,
            cancel: None,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Deterministic hash of the context, excluding volatile fields.
    pub fn context_hash(&self) -> String {
        let mut token_ids: Vec<&str> = self.tokens.iter().map(|t| t.token_id.as_str()).collect();
        token_ids.sort();
        hash_value(&json!({
            "agent_id": self.agent_id,
            "tenant_id": self.tenant_id,
            "task_id": self.task_id,
            "tokens": token_ids,
            "execution_seed": self.execution_seed,
        }))
    }
}

/// Outcome of one skill invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillOutcome {
    pub success: bool,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl SkillOutcome {
    pub fn ok(output: Value) -> Self {
        Self {
            success: true,
            output: Some(output),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }
}

/// Implements each plan step's action. Must be idempotent enough that a
/// replay under an identical context reproduces the same outcome.
#[async_trait]
pub trait SkillExecutor: Send + Sync {
    async fn execute(
        &self,
        action: &str,
        parameters: &BTreeMap<String, Value>,
        ctx: &ExecutionContext,
    ) -> FabricResult<SkillOutcome>;
}

/// Skill executor that succeeds on every action with an empty output. The
/// default wiring for tests and for nodes whose skills live elsewhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSkillExecutor;

#[async_trait]
impl SkillExecutor for NullSkillExecutor {
    async fn execute(
        &self,
        _action: &str,
        _parameters: &BTreeMap<String, Value>,
        _ctx: &ExecutionContext,
    ) -> FabricResult<SkillOutcome> {
        Ok(SkillOutcome::ok(Value::Null))
    }
}

/// One recorded step of an execution trace. The timestamp is taken at step
/// start and never participates in the state hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub step_id: String,
    pub action: String,
    pub success: bool,
    pub timestamp: String,
    pub error: Option<String>,
}

/// Result of one sandboxed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub plan_hash: String,
    pub trace: Vec<TraceEvent>,
    pub used_capabilities: BTreeSet<String>,
    pub state_hash: String,
    pub error: Option<String>,
    pub error_kind: Option<String>,
    pub failed_step_id: Option<String>,
    pub timestamp: String,
    pub protocol_version: String,
}

/// Entry in the sandbox's execution history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub context_hash: String,
    pub result_hash: String,
    pub domain_id: String,
}

/// Isolated deterministic execution environment.
pub struct DeterministicSandbox {
    sandbox_id: String,
    quota: ExecutionQuota,
    skills: Arc<dyn SkillExecutor>,
    verifier: TokenVerifier,
    revocations: Arc<RwLock<RevocationList>>,
    audit: Arc<Mutex<AuditChain>>,
    clock: SharedClock,
    history: Vec<ExecutionRecord>,
}

impl std::fmt::Debug for DeterministicSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeterministicSandbox")
            .field("sandbox_id", &self.sandbox_id)
            .field("history", &self.history.len())
            .finish()
    }
}

impl DeterministicSandbox {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sandbox_id: impl Into<String>,
        limits: QuotaLimits,
        skills: Arc<dyn SkillExecutor>,
        verifier: TokenVerifier,
        revocations: Arc<RwLock<RevocationList>>,
        audit: Arc<Mutex<AuditChain>>,
        clock: SharedClock,
    ) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            quota: ExecutionQuota::new(limits),
            skills,
            verifier,
            revocations,
            audit,
            clock,
            history: Vec::new(),
        }
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub fn history(&self) -> &[ExecutionRecord] {
        &self.history
    }

    /// Execute a plan under a domain. Precondition failures (domain,
    /// capability, admission quota) return `Err` without producing any step
    /// event; failures during execution return `Ok` with `success == false`
    /// and the first failing step recorded.
    pub async fn run(
        &mut self,
        plan: &Plan,
        ctx: &ExecutionContext,
        domain: &ExecutionDomain,
    ) -> FabricResult<ExecutionResult> {
        self.quota.start();

        self.enforce_domain(ctx, domain)?;
        self.enforce_capabilities(plan, ctx, domain)?;
        self.quota.admit(ctx.cpu_seconds, ctx.memory_mb)?;

        let plan_hash = plan.compute_hash();
        let started = Instant::now();
        let mut trace: Vec<TraceEvent> = Vec::new();
        let mut used_capabilities: BTreeSet<String> = BTreeSet::new();
        let mut failure: Option<(String, FabricError)> = None;

        let mut ordered: Vec<&PlanStep> = plan.steps.iter().collect();
        ordered.sort_by_key(|s| s.order);

        for step in ordered {
            if ctx.cancelled() {
                self.emit_step_failed(step, ctx, "cancelled")?;
                trace.push(self.trace_event(step, false, Some("cancelled".into())));
                failure = Some((step.step_id.clone(), FabricError::Cancelled));
                break;
            }

            if let Err(quota_err) = self.quota.record_step() {
                self.emit(
                    AuditEventType::QuotaExceeded,
                    json!({"step_id": step.step_id, "detail": quota_err.to_string()}),
                    ctx,
                )?;
                failure = Some((step.step_id.clone(), quota_err.into()));
                break;
            }

            let elapsed_ms = started.elapsed().as_millis() as u64;
            if let Err(quota_err) = self.quota.check_time(elapsed_ms) {
                self.emit(
                    AuditEventType::QuotaExceeded,
                    json!({"step_id": step.step_id, "detail": quota_err.to_string()}),
                    ctx,
                )?;
                trace.push(self.trace_event(step, false, Some("timeout".into())));
                failure = Some((step.step_id.clone(), quota_err.into()));
                break;
            }

            // Step-time capability use: each call is counted and validated
            // afresh against the verifier and the domain.
            if let Err(err) = self.validate_step_capabilities(step, ctx, domain) {
                self.emit(
                    AuditEventType::CapabilityDenied,
                    json!({"step_id": step.step_id, "detail": err.to_string()}),
                    ctx,
                )?;
                self.emit_step_failed(step, ctx, &err.to_string())?;
                trace.push(self.trace_event(step, false, Some(err.to_string())));
                failure = Some((step.step_id.clone(), err));
                break;
            }

            self.emit(
                AuditEventType::StepStarted,
                json!({"step_id": step.step_id, "action": step.action}),
                ctx,
            )?;
            let step_started_at = self.clock.timestamp();

            let remaining = self.quota.remaining_time_ms();
            let outcome = self.invoke_skill(step, ctx, remaining).await;

            match outcome {
                Ok(outcome) if outcome.success => {
                    used_capabilities.extend(step.required_capabilities.iter().cloned());
                    self.emit(
                        AuditEventType::StepCompleted,
                        json!({"step_id": step.step_id, "action": step.action}),
                        ctx,
                    )?;
                    trace.push(TraceEvent {
                        step_id: step.step_id.clone(),
                        action: step.action.clone(),
                        success: true,
                        timestamp: step_started_at,
                        error: None,
                    });
                }
                Ok(outcome) => {
                    let reason = outcome.error.unwrap_or_else(|| "skill failure".into());
                    self.emit_step_failed(step, ctx, &reason)?;
                    trace.push(TraceEvent {
                        step_id: step.step_id.clone(),
                        action: step.action.clone(),
                        success: false,
                        timestamp: step_started_at,
                        error: Some(reason.clone()),
                    });
                    failure = Some((
                        step.step_id.clone(),
                        FabricError::Registration(
                            crate::errors::RegistrationFailed::SkillRejected {
                                name: step.action.clone(),
                                reason,
                            },
                        ),
                    ));
                    break;
                }
                Err(err) => {
                    self.emit_step_failed(step, ctx, &err.to_string())?;
                    trace.push(TraceEvent {
                        step_id: step.step_id.clone(),
                        action: step.action.clone(),
                        success: false,
                        timestamp: step_started_at,
                        error: Some(err.to_string()),
                    });
                    failure = Some((step.step_id.clone(), err));
                    break;
                }
            }
        }

        let state_hash = compute_state_hash(&trace, &used_capabilities);
        let result = match failure {
            None => ExecutionResult {
                success: true,
                plan_hash,
                trace,
                used_capabilities,
                state_hash: state_hash.clone(),
                error: None,
                error_kind: None,
                failed_step_id: None,
                timestamp: self.clock.timestamp(),
                protocol_version: PROTOCOL_VERSION.to_string(),
            },
            Some((step_id, err)) => {
                let error = match &err {
                    FabricError::Cancelled => "cancelled".to_string(),
                    FabricError::Quota(crate::errors::QuotaExceeded::Time { .. }) => {
                        "timeout".to_string()
                    }
                    other => other.to_string(),
                };
                ExecutionResult {
                    success: false,
                    plan_hash,
                    trace,
                    used_capabilities,
                    state_hash: state_hash.clone(),
                    error: Some(error),
                    error_kind: Some(err.kind().to_string()),
                    failed_step_id: Some(step_id),
                    timestamp: self.clock.timestamp(),
                    protocol_version: PROTOCOL_VERSION.to_string(),
                }
            }
        };

        self.history.push(ExecutionRecord {
            context_hash: ctx.context_hash(),
            result_hash: state_hash,
            domain_id: domain.domain_id.clone(),
        });

        Ok(result)
    }

    /// Replay has the same contract as [`run`]: identical inputs must yield
    /// a result whose state hash and trace (minus wall clock) match the
    /// original bit-identically.
    pub async fn replay(
        &mut self,
        plan: &Plan,
        ctx: &ExecutionContext,
        domain: &ExecutionDomain,
    ) -> FabricResult<ExecutionResult> {
        self.run(plan, ctx, domain).await
    }

    fn enforce_domain(&self, ctx: &ExecutionContext, domain: &ExecutionDomain) -> FabricResult<()> {
        domain.validate()?;
        if !domain.validate_tenant(&ctx.tenant_id) {
            return Err(crate::errors::DomainViolation::TenantMismatch {
                tenant_id: ctx.tenant_id.clone(),
                domain_id: domain.domain_id.clone(),
                domain_tenant: domain.tenant_id.clone(),
            }
            .into());
        }
        Ok(())
    }

    /// Capability precondition: the union of required capabilities over all
    /// steps must be covered by a verified token and lie inside the domain.
    fn enforce_capabilities(
        &mut self,
        plan: &Plan,
        ctx: &ExecutionContext,
        domain: &ExecutionDomain,
    ) -> FabricResult<()> {
        let required = plan.all_capabilities();
        if required.is_empty() {
            return Ok(());
        }
        if ctx.tokens.is_empty() {
            self.emit(
                AuditEventType::CapabilityDenied,
                json!({"detail": "no capability tokens presented"}),
                ctx,
            )?;
            return Err(CapabilityError::NoCapabilities.into());
        }
        for capability in &required {
            if let Err(err) = self.check_capability(capability, ctx, domain) {
                self.emit(
                    AuditEventType::CapabilityDenied,
                    json!({"capability": capability, "detail": err.to_string()}),
                    ctx,
                )?;
                return Err(err);
            }
        }
        Ok(())
    }

    fn validate_step_capabilities(
        &mut self,
        step: &PlanStep,
        ctx: &ExecutionContext,
        domain: &ExecutionDomain,
    ) -> FabricResult<()> {
        for capability in &step.required_capabilities {
            self.quota.record_capability_call()?;
            self.check_capability(capability, ctx, domain)?;
        }
        Ok(())
    }

    fn check_capability(
        &self,
        capability: &str,
        ctx: &ExecutionContext,
        domain: &ExecutionDomain,
    ) -> FabricResult<()> {
        let token = ctx
            .tokens
            .iter()
            .find(|t| {
                capability_matches(&t.capability, capability)
                    || capability_matches(&t.effective_capability(), capability)
            })
            .ok_or_else(|| CapabilityError::Missing {
                capability: capability.to_string(),
            })?;

        if token.agent_id != ctx.agent_id {
            return Err(CapabilityError::AgentMismatch {
                token_id: token.token_id.clone(),
                bound_agent: token.agent_id.clone(),
                presenting_agent: ctx.agent_id.clone(),
            }
            .into());
        }

        let revocations = self.revocations.read().expect("revocation lock poisoned");
        self.verifier.verify(token, &revocations)?;

        if !domain.has_capability(capability) {
            return Err(CapabilityError::ScopeViolation {
                capability: capability.to_string(),
                domain_id: domain.domain_id.clone(),
            }
            .into());
        }
        Ok(())
    }

    async fn invoke_skill(
        &self,
        step: &PlanStep,
        ctx: &ExecutionContext,
        remaining_ms: u64,
    ) -> FabricResult<SkillOutcome> {
        let budget = std::time::Duration::from_millis(remaining_ms.max(1));
        match tokio::time::timeout(budget, self.skills.execute(&step.action, &step.parameters, ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(crate::errors::QuotaExceeded::Time {
                elapsed_ms: self.quota.limits().max_time_ms,
                limit_ms: self.quota.limits().max_time_ms,
            }
            .into()),
        }
    }

    fn trace_event(&self, step: &PlanStep, success: bool, error: Option<String>) -> TraceEvent {
        TraceEvent {
            step_id: step.step_id.clone(),
            action: step.action.clone(),
            success,
            timestamp: self.clock.timestamp(),
            error,
        }
    }

    fn emit(
        &self,
        event_type: AuditEventType,
        details: Value,
        ctx: &ExecutionContext,
    ) -> FabricResult<()> {
        let mut audit = self.audit.lock().expect("audit chain lock poisoned");
        audit.emit(event_type, details, Some(ctx.agent_id.as_str()))?;
        Ok(())
    }

    fn emit_step_failed(
        &self,
        step: &PlanStep,
        ctx: &ExecutionContext,
        reason: &str,
    ) -> FabricResult<()> {
        self.emit(
            AuditEventType::StepFailed,
            json!({"step_id": step.step_id, "action": step.action, "detail": reason}),
            ctx,
        )
    }
}

/// State hash over the node-independent projection of an execution: the
/// trace reduced to `(step_id, success)` pairs plus the sorted used
/// capabilities. Wall clock and node identity never enter this digest.
pub fn compute_state_hash(trace: &[TraceEvent], used_capabilities: &BTreeSet<String>) -> String {
    hash_value(&json!({
        "trace": trace
            .iter()
            .map(|t| json!({"step_id": t.step_id, "success": t.success}))
            .collect::<Vec<_>>(),
        "capabilities": used_capabilities.iter().collect::<Vec<_>>(),
    }))
}
