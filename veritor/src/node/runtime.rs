//! Execution node runtime.
//!
//! The request/reply surface for one machine. A request passes through, in
//! order: protocol version check, token verification, policy-constrained
//! planning, workflow validation, risk gating, then sandboxed execution in
//! a fresh per-contract domain. Every phase writes an audit event; a
//! missing capability yields a structured denial, never a silent success.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::approval::{ApprovalGate, GateOutcome};
use crate::audit::{AuditChain, AuditEventType};
use crate::cluster::membership::TrustedNodeDescriptor;
use crate::errors::{FabricError, FabricResult, ProtocolError};
use crate::governance::registry::CapabilityRegistry;
use crate::governance::token::CapabilityToken;
use crate::node::bridge::{ExecutionProof, RuntimeBridge};
use crate::node::security::NodeSecurity;
use crate::planning::planner::{PlanningConstraints, PolicyConstrainedPlanner};
use crate::rollback::{RollbackCoordinator, RollbackReport};
use crate::sandbox::{DeterministicSandbox, ExecutionContext, ExecutionResult};
use crate::telemetry::Telemetry;
use crate::PROTOCOL_VERSION;

/// A contract execution request as received by a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionRequest {
    pub protocol_version: String,
    pub tenant_id: String,
    pub agent_id: String,
    pub contract_id: String,
    pub task_id: String,
    pub task: String,
    pub input: Value,
    pub tokens: Vec<CapabilityToken>,
    /// Capabilities the contract declares it needs; tokens must cover them.
    pub required_capabilities: BTreeSet<String>,
    pub execution_seed: u64,
    /// Fan rollback out across the cluster when this execution fails.
    #[serde(default)]
    pub cluster_wide_rollback: bool,
}

/// Structured reply for one execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecutionResponse {
    pub status: String,
    pub result: Option<ExecutionResult>,
    pub proof: Option<ExecutionProof>,
    pub rollback: Option<RollbackReport>,
    pub error_kind: Option<String>,
    pub details: Option<String>,
    pub protocol_version: String,
}

impl NodeExecutionResponse {
    fn failure(err: &FabricError) -> Self {
        Self {
            status: "failed".into(),
            result: None,
            proof: None,
            rollback: None,
            error_kind: Some(err.kind().to_string()),
            details: Some(err.to_string()),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    fn pending_approval(request_id: &str) -> Self {
        Self {
            status: "pending_approval".into(),
            result: None,
            proof: None,
            rollback: None,
            error_kind: Some("approval_pending".into()),
            details: Some(format!("approval request {} pending", request_id)),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// One machine's execution host: security, planner, sandbox, audit chain and
/// proof bridge behind a single `execute` surface.
pub struct ExecutionNode {
    node_id: String,
    descriptor: TrustedNodeDescriptor,
    security: NodeSecurity,
    planner: PolicyConstrainedPlanner,
    sandbox: DeterministicSandbox,
    audit: Arc<Mutex<AuditChain>>,
    registry: Arc<RwLock<CapabilityRegistry>>,
    bridge: RuntimeBridge,
    approval: Option<ApprovalGate>,
    rollback: Option<RollbackCoordinator>,
    telemetry: Option<Arc<dyn Telemetry>>,
}

impl std::fmt::Debug for ExecutionNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionNode")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl ExecutionNode {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        descriptor: TrustedNodeDescriptor,
        security: NodeSecurity,
        planner: PolicyConstrainedPlanner,
        sandbox: DeterministicSandbox,
        audit: Arc<Mutex<AuditChain>>,
        registry: Arc<RwLock<CapabilityRegistry>>,
        bridge: RuntimeBridge,
    ) -> Self {
        Self {
            node_id: descriptor.node_id.clone(),
            descriptor,
            security,
            planner,
            sandbox,
            audit,
            registry,
            bridge,
            approval: None,
            rollback: None,
            telemetry: None,
        }
    }

    pub fn set_approval_gate(&mut self, gate: ApprovalGate) {
        self.approval = Some(gate);
    }

    pub fn set_rollback(&mut self, coordinator: RollbackCoordinator) {
        self.rollback = Some(coordinator);
    }

    pub fn set_telemetry(&mut self, telemetry: Arc<dyn Telemetry>) {
        self.telemetry = Some(telemetry);
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn descriptor(&self) -> &TrustedNodeDescriptor {
        &self.descriptor
    }

    pub fn audit(&self) -> Arc<Mutex<AuditChain>> {
        self.audit.clone()
    }

    /// Current Merkle root of this node's audit chain.
    pub fn audit_root(&self) -> String {
        self.audit
            .lock()
            .expect("audit chain lock poisoned")
            .merkle_root()
    }

    /// Execute a contract request end to end.
    pub async fn execute(&mut self, request: NodeExecutionRequest) -> NodeExecutionResponse {
        match self.execute_inner(request).await {
            Ok(response) => response,
            Err(err) => {
                log::warn!("[node {}] execution refused: {}", self.node_id, err);
                NodeExecutionResponse::failure(&err)
            }
        }
    }

    async fn execute_inner(
        &mut self,
        request: NodeExecutionRequest,
    ) -> FabricResult<NodeExecutionResponse> {
        // 1. protocol version must equal the negotiated value
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION.to_string(),
                actual: request.protocol_version.clone(),
            }
            .into());
        }

        self.emit(
            AuditEventType::ExecutionStarted,
            json!({
                "contract_id": request.contract_id,
                "tenant_id": request.tenant_id,
                "task_id": request.task_id,
            }),
            &request.agent_id,
        )?;

        // 2. token verification and contract capability coverage
        if let Err(err) = self
            .security
            .validate_tokens(&request.agent_id, &request.tokens)
            .and_then(|_| {
                self.security
                    .check_required_capabilities(&request.required_capabilities, &request.tokens)
            })
        {
            self.emit(
                AuditEventType::CapabilityDenied,
                json!({"contract_id": request.contract_id, "detail": err.to_string()}),
                &request.agent_id,
            )?;
            return Ok(NodeExecutionResponse::failure(&err));
        }
        for token in &request.tokens {
            self.emit(
                AuditEventType::CapabilityVerified,
                json!({"token_id": token.token_id, "capability": token.capability}),
                &request.agent_id,
            )?;
        }

        // 3. plan under policy
        let allowed: BTreeSet<String> = request
            .tokens
            .iter()
            .map(|t| t.capability.clone())
            .collect();
        let constraints = PlanningConstraints::new(allowed, self.planner.policy_hash());
        let planning = self.planner.generate_plan(
            &request.task_id,
            &request.task,
            &constraints,
            request.execution_seed,
        );
        let plan = match planning.plan {
            Some(plan) if planning.success => plan,
            _ => {
                let violation = crate::errors::PolicyViolation::new(
                    crate::errors::PolicyViolationKind::MissingCapabilities,
                    crate::errors::Severity::Critical,
                    format!("planning failed: {}", planning.violations.join("; ")),
                    json!({"task_id": request.task_id}),
                );
                return Ok(NodeExecutionResponse::failure(&FabricError::Policy(
                    violation,
                )));
            }
        };
        self.emit(
            AuditEventType::PlanBuilt,
            json!({
                "plan_id": plan.plan_id,
                "plan_hash": planning.plan_hash,
                "violations": planning.violations,
            }),
            &request.agent_id,
        )?;

        // granted patterns: the bare capability plus its scoped form
        let mut granted: BTreeSet<String> = BTreeSet::new();
        for token in &request.tokens {
            granted.insert(token.capability.clone());
            granted.insert(token.effective_capability());
        }

        // refuse on any workflow-policy violation
        let validation = self.planner.engine().validate_workflow(&plan, &granted);
        if !validation.ok {
            let violation = validation.violations[0].clone();
            self.emit(
                AuditEventType::CapabilityDenied,
                json!({"plan_id": plan.plan_id, "violations": validation.violations}),
                &request.agent_id,
            )?;
            return Ok(NodeExecutionResponse::failure(&FabricError::Policy(
                violation,
            )));
        }

        // 4. risk gating before the sandbox
        if let Some(response) = self.gate_on_risk(&request, &plan).await? {
            return Ok(response);
        }

        // 5. fresh execution domain for this (tenant, contract)
        let domain = crate::isolation::domain::ExecutionDomain::for_contract(
            &request.tenant_id,
            &request.contract_id,
            granted,
        )?;

        let ctx = ExecutionContext::new(
            request.agent_id.clone(),
            request.tenant_id.clone(),
            request.task_id.clone(),
            request.tokens.clone(),
            request.execution_seed,
        );

        // checkpoint ahead of execution when rollback is wired
        let checkpoint_id = match &self.rollback {
            Some(coordinator) => Some(
                coordinator
                    .create_checkpoint(&request.agent_id, &request.contract_id)
                    .await?,
            ),
            None => None,
        };

        let result = self.sandbox.run(&plan, &ctx, &domain).await?;
        self.emit(
            AuditEventType::ExecutionCompleted,
            json!({
                "contract_id": request.contract_id,
                "success": result.success,
                "state_hash": result.state_hash,
            }),
            &request.agent_id,
        )?;
        if let Some(telemetry) = &self.telemetry {
            telemetry.record(
                "execution_completed",
                json!({
                    "node_id": self.node_id,
                    "contract_id": request.contract_id,
                    "success": result.success,
                    "steps": result.trace.len(),
                }),
            );
        }

        // 6. rollback on failure, proof either way
        let rollback = if !result.success {
            match &self.rollback {
                Some(coordinator) => Some(
                    coordinator
                        .handle_failure(
                            &request.agent_id,
                            checkpoint_id.as_deref(),
                            request.cluster_wide_rollback,
                        )
                        .await?,
                ),
                None => None,
            }
        } else {
            None
        };

        let proof = self.bridge.attest(&request.contract_id, &request.input);

        Ok(NodeExecutionResponse {
            status: if result.success {
                "completed".into()
            } else {
                "failed".into()
            },
            error_kind: result.error_kind.clone(),
            details: result.error.clone(),
            result: Some(result),
            proof: Some(proof),
            rollback,
            protocol_version: PROTOCOL_VERSION.to_string(),
        })
    }

    /// Consult the approval gate when the plan's risk demands it. Returns a
    /// terminal response for denials and parked requests.
    async fn gate_on_risk(
        &mut self,
        request: &NodeExecutionRequest,
        plan: &crate::planning::plan::Plan,
    ) -> FabricResult<Option<NodeExecutionResponse>> {
        let capabilities = plan.all_capabilities();
        let risk_level = {
            let registry = self.registry.read().expect("registry lock poisoned");
            registry.max_risk_level(capabilities.iter())
        };
        let needs_approval = self
            .planner
            .engine()
            .requires_approval(risk_level, capabilities.iter().map(String::as_str));
        if !needs_approval {
            return Ok(None);
        }

        self.emit(
            AuditEventType::ApprovalRequested,
            json!({"task_id": request.task_id, "risk_level": risk_level}),
            &request.agent_id,
        )?;

        let gate = match self.approval.as_mut() {
            Some(gate) => gate,
            None => {
                // approval required but no channel wired: park, never bypass
                return Ok(Some(NodeExecutionResponse::pending_approval("unrouted")));
            }
        };

        let state = json!({
            "contract_id": request.contract_id,
            "task": request.task,
            "input": request.input,
        });
        match gate
            .request_approval(
                &request.tenant_id,
                &request.task_id,
                &request.task,
                risk_level,
                &state,
            )
            .await?
        {
            GateOutcome::Proceed => {
                self.emit(
                    AuditEventType::ApprovalGranted,
                    json!({"task_id": request.task_id}),
                    &request.agent_id,
                )?;
                Ok(None)
            }
            GateOutcome::Denied { request_id, reason } => {
                self.emit(
                    AuditEventType::ApprovalDenied,
                    json!({"task_id": request.task_id, "reason": reason.clone()}),
                    &request.agent_id,
                )?;
                Ok(Some(NodeExecutionResponse::failure(
                    &FabricError::ApprovalDenied { request_id, reason },
                )))
            }
            GateOutcome::Pending { request_id } => Ok(Some(
                NodeExecutionResponse::pending_approval(&request_id),
            )),
        }
    }

    fn emit(&self, event_type: AuditEventType, details: Value, agent_id: &str) -> FabricResult<()> {
        let mut audit = self.audit.lock().expect("audit chain lock poisoned");
        audit.emit(event_type, details, Some(agent_id))?;
        Ok(())
    }
}
