//! Shared wiring for integration tests: a fully assembled execution node
//! with a fixed clock, a seeded capability registry, and helpers for
//! issuing tokens and building requests.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, RwLock};

use serde_json::{json, Value};
use veritor::prelude::*;

pub const TEST_SECRET: &[u8] = b"integration-test-secret";

pub struct NodeHarness {
    pub node: ExecutionNode,
    pub issuer: TokenIssuer,
    pub revocations: Arc<RwLock<RevocationList>>,
    pub audit: Arc<Mutex<AuditChain>>,
    pub clock: Arc<FixedClock>,
}

pub fn caps(ids: &[&str]) -> BTreeSet<String> {
    ids.iter().map(|s| s.to_string()).collect()
}

/// Build a node with the standard test capability catalog registered.
pub fn build_node(node_id: &str) -> NodeHarness {
    build_node_with_skills(node_id, Arc::new(NullSkillExecutor))
}

pub fn build_node_with_skills(node_id: &str, skills: Arc<dyn SkillExecutor>) -> NodeHarness {
    let clock = fixed_clock();
    let shared: SharedClock = clock.clone();

    let mut registry = CapabilityRegistry::new();
    for (id, risk) in [
        ("fs:read", 1),
        ("fs:write", 2),
        ("net:http", 2),
        ("os:process", 3),
    ] {
        registry
            .register(
                id,
                CapabilityMetadata::new(id, "test capability", "core", risk, &shared),
            )
            .unwrap();
    }

    let issuer = TokenIssuer::new("issuer-0", SecretKey::from_bytes(TEST_SECRET.to_vec()), shared.clone());
    let revocations = Arc::new(RwLock::new(RevocationList::new()));
    let audit = Arc::new(Mutex::new(AuditChain::new(node_id, shared.clone())));

    let security = NodeSecurity::new(issuer.verifier(), revocations.clone());
    let engine = PolicyEngine::new(PolicyRuleset::default(), shared.clone());
    let planner = PolicyConstrainedPlanner::new(engine, shared.clone());
    let sandbox = DeterministicSandbox::new(
        format!("sb-{}", node_id),
        QuotaLimits::default(),
        skills,
        issuer.verifier(),
        revocations.clone(),
        audit.clone(),
        shared.clone(),
    );
    let bridge = RuntimeBridge::new(node_id, shared.clone());
    let descriptor = TrustedNodeDescriptor::new(
        node_id,
        format!("test-{}", node_id),
        format!("pk-{}", node_id),
        1,
        shared.timestamp(),
    );

    let node = ExecutionNode::new(
        descriptor,
        security,
        planner,
        sandbox,
        audit.clone(),
        Arc::new(RwLock::new(registry)),
        bridge,
    );

    NodeHarness {
        node,
        issuer,
        revocations,
        audit,
        clock,
    }
}

pub fn request(
    tenant_id: &str,
    agent_id: &str,
    contract_id: &str,
    task: &str,
    tokens: Vec<CapabilityToken>,
    required: &[&str],
    seed: u64,
) -> NodeExecutionRequest {
    NodeExecutionRequest {
        protocol_version: PROTOCOL_VERSION.to_string(),
        tenant_id: tenant_id.into(),
        agent_id: agent_id.into(),
        contract_id: contract_id.into(),
        task_id: contract_id.into(),
        task: task.into(),
        input: json!({"action": "read"}),
        tokens,
        required_capabilities: caps(required),
        execution_seed: seed,
        cluster_wide_rollback: false,
    }
}

pub fn audit_events_of(harness: &NodeHarness, event_type: AuditEventType) -> Vec<Value> {
    harness
        .audit
        .lock()
        .unwrap()
        .events_of_type(event_type)
        .into_iter()
        .map(|e| e.details.clone())
        .collect()
}
