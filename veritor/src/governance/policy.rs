//! Policy engine.
//!
//! Two questions are answered here, both at issuance time and at workflow
//! validation time: may this capability be issued to this agent, and may
//! this plan run with these capabilities. The active ruleset is hashed into
//! `policy_hash`; plans bind to that hash, so changing the rules invalidates
//! every cached plan.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::hash_value;
use crate::clock::SharedClock;
use crate::errors::{PolicyViolation, PolicyViolationKind, Severity};
use crate::governance::registry::CapabilityMetadata;
use crate::isolation::capability_matches;
use crate::planning::plan::Plan;
use crate::PROTOCOL_VERSION;

/// Step parameter naming the step ids this step depends on. Used by the
/// dependency-cycle check.
const DEPENDS_ON_PARAM: &str = "depends_on";

/// Human-authored policy rules. Hashed canonically into `policy_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRuleset {
    /// Actions no plan step may carry.
    pub forbidden_actions: BTreeSet<String>,
    /// When non-empty, every step capability must match one of these
    /// patterns.
    pub allowed_capabilities: BTreeSet<String>,
    /// Issuance ceiling: capabilities above this risk level are never issued.
    pub max_issuance_risk: u8,
    /// Capability patterns that always route through human approval,
    /// regardless of risk level.
    pub approval_required_patterns: BTreeSet<String>,
}

impl Default for PolicyRuleset {
    fn default() -> Self {
        Self {
            forbidden_actions: BTreeSet::new(),
            allowed_capabilities: BTreeSet::new(),
            max_issuance_risk: 3,
            approval_required_patterns: BTreeSet::new(),
        }
    }
}

impl PolicyRuleset {
    fn canonical_value(&self) -> Value {
        json!({
            "forbidden_actions": self.forbidden_actions.iter().collect::<Vec<_>>(),
            "allowed_capabilities": self.allowed_capabilities.iter().collect::<Vec<_>>(),
            "max_issuance_risk": self.max_issuance_risk,
            "approval_required_patterns": self.approval_required_patterns.iter().collect::<Vec<_>>(),
            "protocol_version": PROTOCOL_VERSION,
        })
    }

    /// Deterministic hash of the ruleset.
    pub fn compute_hash(&self) -> String {
        hash_value(&self.canonical_value())
    }
}

/// Outcome of workflow validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub ok: bool,
    pub violations: Vec<PolicyViolation>,
    pub workflow_id: String,
    pub timestamp: String,
    pub protocol_version: String,
}

/// Evaluates issuance and workflow policy against a fixed ruleset.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    ruleset: PolicyRuleset,
    policy_hash: String,
    clock: SharedClock,
}

impl PolicyEngine {
    pub fn new(ruleset: PolicyRuleset, clock: SharedClock) -> Self {
        let policy_hash = ruleset.compute_hash();
        Self {
            ruleset,
            policy_hash,
            clock,
        }
    }

    pub fn policy_hash(&self) -> &str {
        &self.policy_hash
    }

    pub fn ruleset(&self) -> &PolicyRuleset {
        &self.ruleset
    }

    /// Issuance policy: may `capability_id` be issued to `agent_id`.
    pub fn check_issuance(
        &self,
        agent_id: &str,
        capability_id: &str,
        metadata: &CapabilityMetadata,
    ) -> Result<(), PolicyViolation> {
        if metadata.risk_level > self.ruleset.max_issuance_risk {
            return Err(PolicyViolation::new(
                PolicyViolationKind::RiskTooHigh,
                Severity::Critical,
                format!(
                    "capability {} has risk {} above issuance ceiling {}",
                    capability_id, metadata.risk_level, self.ruleset.max_issuance_risk
                ),
                json!({"agent_id": agent_id, "capability": capability_id}),
            ));
        }
        if !self.ruleset.allowed_capabilities.is_empty()
            && !self
                .ruleset
                .allowed_capabilities
                .iter()
                .any(|p| capability_matches(p, capability_id))
        {
            return Err(PolicyViolation::new(
                PolicyViolationKind::ScopeExceeded,
                Severity::Error,
                format!("capability {} is outside the allowed set", capability_id),
                json!({"agent_id": agent_id, "capability": capability_id}),
            ));
        }
        Ok(())
    }

    /// True iff a step action is allowed by the ruleset.
    pub fn action_allowed(&self, action: &str) -> bool {
        !self.ruleset.forbidden_actions.contains(action)
    }

    /// Approval is required iff `risk_level >= 3` OR a rule flags one of the
    /// capabilities — the disjunction, never only one side.
    pub fn requires_approval<'a>(
        &self,
        risk_level: u8,
        capability_ids: impl IntoIterator<Item = &'a str>,
    ) -> bool {
        if risk_level >= 3 {
            return true;
        }
        capability_ids.into_iter().any(|cap| {
            self.ruleset
                .approval_required_patterns
                .iter()
                .any(|p| capability_matches(p, cap))
        })
    }

    /// Workflow policy: enumerate every violation of a proposed plan under
    /// the tenant's capabilities.
    pub fn validate_workflow(&self, plan: &Plan, capabilities: &BTreeSet<String>) -> ValidationResult {
        let mut violations = Vec::new();

        self.check_missing_capabilities(plan, capabilities, &mut violations);
        self.check_scope(plan, &mut violations);
        self.check_forbidden_actions(plan, &mut violations);
        self.check_dependency_cycles(plan, &mut violations);
        self.check_escalation(plan, capabilities, &mut violations);

        ValidationResult {
            ok: violations.is_empty(),
            violations,
            workflow_id: plan.plan_id.clone(),
            timestamp: self.clock.timestamp(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    fn check_missing_capabilities(
        &self,
        plan: &Plan,
        capabilities: &BTreeSet<String>,
        violations: &mut Vec<PolicyViolation>,
    ) {
        let missing: Vec<String> = plan
            .all_capabilities()
            .into_iter()
            .filter(|cap| !capabilities.iter().any(|p| capability_matches(p, cap)))
            .collect();
        if !missing.is_empty() {
            violations.push(PolicyViolation::new(
                PolicyViolationKind::MissingCapabilities,
                Severity::Critical,
                format!("missing required capabilities: {}", missing.join(", ")),
                json!({
                    "required": missing,
                    "available": capabilities.iter().collect::<Vec<_>>(),
                }),
            ));
        }
    }

    fn check_scope(&self, plan: &Plan, violations: &mut Vec<PolicyViolation>) {
        if self.ruleset.allowed_capabilities.is_empty() {
            return;
        }
        for cap in plan.all_capabilities() {
            if !self
                .ruleset
                .allowed_capabilities
                .iter()
                .any(|p| capability_matches(p, &cap))
            {
                violations.push(PolicyViolation::new(
                    PolicyViolationKind::ScopeExceeded,
                    Severity::Error,
                    format!("capability {} exceeds the policy scope", cap),
                    json!({"capability": cap}),
                ));
            }
        }
    }

    fn check_forbidden_actions(&self, plan: &Plan, violations: &mut Vec<PolicyViolation>) {
        for step in &plan.steps {
            if !self.action_allowed(&step.action) {
                violations.push(PolicyViolation::new(
                    PolicyViolationKind::ForbiddenAction,
                    Severity::Critical,
                    format!("action {} is forbidden by policy", step.action),
                    json!({"step_id": step.step_id, "action": step.action}),
                ));
            }
        }
    }

    /// Detect cycles in the `depends_on` graph declared through step
    /// parameters.
    fn check_dependency_cycles(&self, plan: &Plan, violations: &mut Vec<PolicyViolation>) {
        let mut edges: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for step in &plan.steps {
            if let Some(Value::Array(deps)) = step.parameters.get(DEPENDS_ON_PARAM) {
                let targets: Vec<&str> = deps.iter().filter_map(|d| d.as_str()).collect();
                edges.insert(step.step_id.as_str(), targets);
            }
        }
        if edges.is_empty() {
            return;
        }

        let mut visiting: HashSet<&str> = HashSet::new();
        let mut done: HashSet<&str> = HashSet::new();
        for start in edges.keys() {
            if has_cycle(start, &edges, &mut visiting, &mut done) {
                violations.push(PolicyViolation::new(
                    PolicyViolationKind::DependencyCycle,
                    Severity::Critical,
                    format!("dependency cycle involving step {}", start),
                    json!({"step_id": start}),
                ));
                return;
            }
        }
    }

    /// A required capability carrying a wildcard is an escalation attempt
    /// unless an issued pattern grants exactly that pattern. Matching a
    /// wildcard request against a narrower grant would widen the grant
    /// implicitly.
    fn check_escalation(
        &self,
        plan: &Plan,
        capabilities: &BTreeSet<String>,
        violations: &mut Vec<PolicyViolation>,
    ) {
        for cap in plan.all_capabilities() {
            if cap.contains('*') && !capabilities.contains(&cap) {
                violations.push(PolicyViolation::new(
                    PolicyViolationKind::ImplicitEscalation,
                    Severity::Critical,
                    format!(
                        "capability {} requests a wildcard scope that was never issued",
                        cap
                    ),
                    json!({"capability": cap}),
                ));
            }
        }
    }
}

fn has_cycle<'a>(
    node: &'a str,
    edges: &BTreeMap<&'a str, Vec<&'a str>>,
    visiting: &mut HashSet<&'a str>,
    done: &mut HashSet<&'a str>,
) -> bool {
    if done.contains(node) {
        return false;
    }
    if !visiting.insert(node) {
        return true;
    }
    if let Some(targets) = edges.get(node) {
        for target in targets {
            if has_cycle(target, edges, visiting, done) {
                return true;
            }
        }
    }
    visiting.remove(node);
    done.insert(node);
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;
    use crate::errors::PolicyViolationKind;
    use crate::planning::plan::PlanBuilder;

    fn engine(ruleset: PolicyRuleset) -> PolicyEngine {
        PolicyEngine::new(ruleset, fixed_clock())
    }

    fn caps(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn one_step_plan(action: &str, cap: &str, policy_hash: &str) -> Plan {
        let mut builder = PlanBuilder::new("t-1", 42, policy_hash);
        builder.add_step(action, caps(&[cap]), BTreeMap::new());
        builder.build(&*fixed_clock())
    }

    #[test]
    fn policy_hash_changes_with_rules() {
        let default_hash = PolicyRuleset::default().compute_hash();
        let mut strict = PolicyRuleset::default();
        strict.forbidden_actions.insert("erase".into());
        assert_ne!(default_hash, strict.compute_hash());
    }

    #[test]
    fn missing_capability_is_critical() {
        let engine = engine(PolicyRuleset::default());
        let plan = one_step_plan("read", "fs:read", engine.policy_hash());
        let result = engine.validate_workflow(&plan, &caps(&[]));
        assert!(!result.ok);
        assert_eq!(
            result.violations[0].kind,
            PolicyViolationKind::MissingCapabilities
        );
    }

    #[test]
    fn glob_grant_satisfies_requirement() {
        let engine = engine(PolicyRuleset::default());
        let plan = one_step_plan("read", "fs:read:/workspace/data", engine.policy_hash());
        let result = engine.validate_workflow(&plan, &caps(&["fs:read:/workspace/**"]));
        assert!(result.ok, "violations: {:?}", result.violations);
    }

    #[test]
    fn forbidden_action_is_flagged() {
        let mut ruleset = PolicyRuleset::default();
        ruleset.forbidden_actions.insert("erase".into());
        let engine = engine(ruleset);
        let plan = one_step_plan("erase", "fs:write", engine.policy_hash());
        let result = engine.validate_workflow(&plan, &caps(&["fs:write"]));
        assert!(result
            .violations
            .iter()
            .any(|v| v.kind == PolicyViolationKind::ForbiddenAction));
    }

    #[test]
    fn wildcard_request_without_matching_grant_is_escalation() {
        let engine = engine(PolicyRuleset::default());
        let plan = one_step_plan("read", "fs:*", engine.policy_hash());
        let result = engine.validate_workflow(&plan, &caps(&["fs:read"]));
        assert!(result
            .violations
            .iter()
            .any(|v| v.kind == PolicyViolationKind::ImplicitEscalation));
    }

    #[test]
    fn dependency_cycle_detected() {
        let engine = engine(PolicyRuleset::default());
        let mut builder = PlanBuilder::new("t-cyc", 1, engine.policy_hash());
        builder.add_step("read", caps(&["fs:read"]), BTreeMap::new());
        builder.add_step("write", caps(&["fs:write"]), BTreeMap::new());
        let mut plan = builder.build(&*fixed_clock());

        // wire a cycle through the depends_on parameter
        let first = plan.steps[0].step_id.clone();
        let second = plan.steps[1].step_id.clone();
        let mut steps = plan.steps.clone();
        steps[0]
            .parameters
            .insert(DEPENDS_ON_PARAM.into(), json!([second]));
        steps[1]
            .parameters
            .insert(DEPENDS_ON_PARAM.into(), json!([first]));
        plan.steps = steps;

        let result = engine.validate_workflow(&plan, &caps(&["fs:read", "fs:write"]));
        assert!(result
            .violations
            .iter()
            .any(|v| v.kind == PolicyViolationKind::DependencyCycle));
    }

    #[test]
    fn approval_is_disjunction_of_risk_and_rules() {
        let mut ruleset = PolicyRuleset::default();
        ruleset
            .approval_required_patterns
            .insert("payments:*".into());
        let engine = engine(ruleset);

        assert!(engine.requires_approval(3, []));
        assert!(engine.requires_approval(1, ["payments:transfer"]));
        assert!(!engine.requires_approval(2, ["fs:read"]));
    }

    #[test]
    fn issuance_rejects_high_risk() {
        let clock: SharedClock = fixed_clock();
        let engine = engine(PolicyRuleset::default());
        let metadata = CapabilityMetadata::new("Deploy", "", "ops", 4, &clock);
        let violation = engine
            .check_issuance("agent-1", "ops:deploy", &metadata)
            .unwrap_err();
        assert_eq!(violation.kind, PolicyViolationKind::RiskTooHigh);
    }
}
