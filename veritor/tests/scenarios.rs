//! End-to-end execution scenarios through the full node stack.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use veritor::prelude::*;
use veritor::sandbox::compute_state_hash;

use common::{audit_events_of, build_node, build_node_with_skills, caps, request};

// S1: registered capability, valid token, one-step plan, success with a
// reproducible state hash.
#[tokio::test]
async fn s1_happy_path_read_contract() {
    let mut harness = build_node("n0");
    let telemetry = Arc::new(InMemoryTelemetry::new());
    harness.node.set_telemetry(telemetry.clone());
    let token = harness
        .issuer
        .issue("agent-1", "fs:read", "/workspace/**", 3600);

    let response = harness
        .node
        .execute(request(
            "t1",
            "agent-1",
            "c1",
            "read the workspace report",
            vec![token],
            &["fs:read"],
            42,
        ))
        .await;

    assert_eq!(response.status, "completed");
    let result = response.result.unwrap();
    assert!(result.success);
    assert_eq!(result.trace.len(), 1);
    assert!(result.trace[0].success);
    assert_eq!(result.used_capabilities, caps(&["fs:read"]));
    assert_eq!(
        result.state_hash,
        compute_state_hash(&result.trace, &result.used_capabilities)
    );

    // plan was built from the keyword mapping with the expected shape
    let plans = audit_events_of(&harness, AuditEventType::PlanBuilt);
    assert_eq!(plans.len(), 1);
    assert!(plans[0]["plan_hash"].as_str().unwrap().len() == 64);

    let proof = response.proof.unwrap();
    assert!(proof.proof_id.starts_with("proof_"));
    assert_eq!(telemetry.event_count("execution_completed"), 1);
}

// S2: same contract, no token issued: a structured capability denial, no
// step events, and a capability_denied audit record.
#[tokio::test]
async fn s2_denied_without_token() {
    let mut harness = build_node("n0");

    let response = harness
        .node
        .execute(request(
            "t1",
            "agent-1",
            "c1",
            "read the workspace report",
            vec![],
            &["fs:read"],
            42,
        ))
        .await;

    assert_eq!(response.status, "failed");
    assert_eq!(response.error_kind.as_deref(), Some("capability_error"));
    assert!(response.result.is_none());

    assert!(!audit_events_of(&harness, AuditEventType::CapabilityDenied).is_empty());
    assert!(audit_events_of(&harness, AuditEventType::StepStarted).is_empty());
}

// S3: a token issued to tenant A's agent is useless to tenant B, while the
// scheduler still places the contract deterministically.
#[tokio::test]
async fn s3_cross_tenant_token_theft_fails() {
    let mut harness = build_node("n0");
    let stolen = harness
        .issuer
        .issue("agent-a", "fs:read", "/workspace/**", 3600);

    let response = harness
        .node
        .execute(request(
            "tB",
            "agent-b",
            "c1",
            "read the workspace report",
            vec![stolen],
            &["fs:read"],
            42,
        ))
        .await;

    assert_eq!(response.status, "failed");
    assert_eq!(response.error_kind.as_deref(), Some("capability_error"));

    // placement is unaffected by the denial and fully deterministic
    let scheduler = ClusterScheduler::new(
        vec!["n0".into(), "n1".into(), "n2".into()],
        fixed_clock(),
    );
    assert_eq!(
        scheduler.schedule("tB", "c1").unwrap(),
        scheduler.schedule("tB", "c1").unwrap()
    );
}

// S4: the same contract replayed on a different node reproduces the state
// hash, the plan hash, and the proof's audit root.
#[tokio::test]
async fn s4_replay_on_second_node_is_bit_identical() {
    let run = |node_id: &'static str| async move {
        let mut harness = build_node(node_id);
        let token = harness
            .issuer
            .issue("agent-1", "fs:read", "/workspace/**", 3600);
        harness
            .node
            .execute(request(
                "t1",
                "agent-1",
                "c1",
                "read the workspace report",
                vec![token],
                &["fs:read"],
                42,
            ))
            .await
    };

    let first = run("n0").await;
    let second = run("n1").await;

    let left = first.result.unwrap();
    let right = second.result.unwrap();
    assert_eq!(left.state_hash, right.state_hash);
    assert_eq!(left.plan_hash, right.plan_hash);
    assert_eq!(left.trace.len(), right.trace.len());
    for (a, b) in left.trace.iter().zip(right.trace.iter()) {
        assert_eq!(a.step_id, b.step_id);
        assert_eq!(a.success, b.success);
    }
    assert_eq!(
        first.proof.unwrap().audit_root,
        second.proof.unwrap().audit_root
    );
}

// S5: a task expanding past the step budget is truncated with a recorded
// violation, and the truncated plan still executes to success.
#[tokio::test]
async fn s5_truncated_plan_executes_to_success() {
    let mut harness = build_node("n0");
    let token = harness
        .issuer
        .issue("agent-1", "fs:read", "/workspace/**", 3600);

    let task = vec!["read the log"; 12].join("; ");
    let response = harness
        .node
        .execute(request("t1", "agent-1", "c5", &task, vec![token], &["fs:read"], 42))
        .await;

    assert_eq!(response.status, "completed");
    let result = response.result.unwrap();
    assert!(result.success);
    assert_eq!(result.trace.len(), 10);

    let plans = audit_events_of(&harness, AuditEventType::PlanBuilt);
    let violations = plans[0]["violations"].as_array().unwrap();
    assert!(violations
        .iter()
        .any(|v| v.as_str() == Some("Plan truncated to 10 steps")));
}

// S6: a skill failing mid-plan with cluster-wide rollback over three nodes.
#[tokio::test]
async fn s6_cluster_wide_rollback_on_step_failure() {
    struct RegistrationFails;

    #[async_trait]
    impl SkillExecutor for RegistrationFails {
        async fn execute(
            &self,
            action: &str,
            _parameters: &BTreeMap<String, Value>,
            _ctx: &ExecutionContext,
        ) -> FabricResult<SkillOutcome> {
            if action == "write" {
                Ok(SkillOutcome::failed("skill registration refused"))
            } else {
                Ok(SkillOutcome::ok(Value::Null))
            }
        }
    }

    struct ThreeNodes;

    #[async_trait]
    impl ClusterRollback for ThreeNodes {
        async fn rollback_all(&self) -> FabricResult<usize> {
            Ok(3)
        }
    }

    let mut harness = build_node_with_skills("n0", Arc::new(RegistrationFails));
    let provider = Arc::new(InMemoryCheckpoints::new(harness.clock.clone()));
    let coordinator = RollbackCoordinator::new(provider, harness.audit.clone())
        .with_cluster(Arc::new(ThreeNodes));
    harness.node.set_rollback(coordinator);

    let read = harness.issuer.issue("agent-1", "fs:read", "", 3600);
    let write = harness.issuer.issue("agent-1", "fs:write", "", 3600);
    let mut req = request(
        "t1",
        "agent-1",
        "c6",
        "read the input then write the output then read the summary",
        vec![read, write],
        &["fs:read", "fs:write"],
        42,
    );
    req.cluster_wide_rollback = true;

    let response = harness.node.execute(req).await;

    assert_eq!(response.status, "failed");
    let result = response.result.unwrap();
    assert!(!result.success);
    assert_eq!(result.trace.len(), 2);
    assert!(result.failed_step_id.is_some());

    let rollback = response.rollback.unwrap();
    assert!(rollback.rollback_executed);
    assert!(rollback.cluster_rollback);
    assert_eq!(rollback.nodes_affected, 3);

    assert!(!audit_events_of(&harness, AuditEventType::RollbackExecuted).is_empty());
}

// Approval gating: a high-risk capability routes through the gate; a denial
// surfaces as approval_denied, never as success.
#[tokio::test]
async fn high_risk_execution_requires_approval() {
    struct Deny;

    #[async_trait]
    impl ApprovalChannel for Deny {
        async fn send_approval_request(
            &self,
            _request: &ApprovalRequest,
        ) -> FabricResult<Option<ApprovalDecision>> {
            Ok(Some(ApprovalDecision {
                approved: false,
                approver: "operator".into(),
                timestamp: "t".into(),
                reason: Some("not in a change window".into()),
            }))
        }
    }

    let mut harness = build_node("n0");
    let gate = ApprovalGate::new(harness.clock.clone()).with_channel(Arc::new(Deny));
    harness.node.set_approval_gate(gate);

    // os:process is registered at risk level 3
    let token = harness.issuer.issue("agent-1", "os:process", "", 3600);
    let response = harness
        .node
        .execute(request(
            "t1",
            "agent-1",
            "c7",
            "run the maintenance script",
            vec![token],
            &["os:process"],
            42,
        ))
        .await;

    assert_eq!(response.status, "failed");
    assert_eq!(response.error_kind.as_deref(), Some("approval_denied"));
    assert!(!audit_events_of(&harness, AuditEventType::ApprovalDenied).is_empty());
    assert!(audit_events_of(&harness, AuditEventType::StepStarted).is_empty());
}

// A stale protocol version is refused before any other processing.
#[tokio::test]
async fn version_mismatch_fails_closed() {
    let mut harness = build_node("n0");
    let mut req = request("t1", "agent-1", "c1", "read it", vec![], &[], 42);
    req.protocol_version = "0.9".into();

    let response = harness.node.execute(req).await;
    assert_eq!(response.status, "failed");
    assert_eq!(response.error_kind.as_deref(), Some("protocol_error"));
}
