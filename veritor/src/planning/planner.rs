//! Policy-constrained deterministic planner.
//!
//! Planning runs in five pure stages: parse the task into candidate steps,
//! filter by allowed capabilities, validate against policy, truncate to the
//! step budget, and build the immutable plan. A cache keyed by the canonical
//! hash of the inputs is a pure optimization; identical inputs yield
//! identical output whether cached or recomputed.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::hash_value;
use crate::clock::SharedClock;
use crate::governance::policy::PolicyEngine;
use crate::planning::plan::{Plan, PlanBuilder};
use crate::PROTOCOL_VERSION;

/// Constraints a plan must be generated under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningConstraints {
    pub allowed_capabilities: BTreeSet<String>,
    pub max_steps: usize,
    pub max_depth: usize,
    pub policy_hash: String,
    pub protocol_version: String,
}

impl PlanningConstraints {
    pub fn new(allowed_capabilities: BTreeSet<String>, policy_hash: impl Into<String>) -> Self {
        Self {
            allowed_capabilities,
            max_steps: 10,
            max_depth: 5,
            policy_hash: policy_hash.into(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    fn canonical_value(&self) -> Value {
        json!({
            "allowed_capabilities": self.allowed_capabilities.iter().collect::<Vec<_>>(),
            "max_steps": self.max_steps,
            "max_depth": self.max_depth,
            "policy_hash": self.policy_hash,
            "protocol_version": self.protocol_version,
        })
    }
}

/// Outcome of a planning attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningResult {
    pub success: bool,
    pub plan: Option<Plan>,
    pub violations: Vec<String>,
    pub plan_hash: Option<String>,
    pub timestamp: String,
    pub protocol_version: String,
}

/// A candidate step produced by task parsing, before policy filtering.
#[derive(Debug, Clone)]
struct CandidateStep {
    action: &'static str,
    capabilities: BTreeSet<String>,
    parameters: BTreeMap<String, Value>,
}

impl CandidateStep {
    fn new(action: &'static str, capability: Option<&str>, parameters: &[(&str, Value)]) -> Self {
        Self {
            action,
            capabilities: capability.into_iter().map(str::to_string).collect(),
            parameters: parameters
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        }
    }
}

/// Planner that enforces policy constraints during plan construction.
#[derive(Debug)]
pub struct PolicyConstrainedPlanner {
    engine: PolicyEngine,
    clock: SharedClock,
    cache: HashMap<String, PlanningResult>,
}

impl PolicyConstrainedPlanner {
    pub fn new(engine: PolicyEngine, clock: SharedClock) -> Self {
        Self {
            engine,
            clock,
            cache: HashMap::new(),
        }
    }

    pub fn policy_hash(&self) -> &str {
        self.engine.policy_hash()
    }

    pub fn engine(&self) -> &PolicyEngine {
        &self.engine
    }

    /// Generate a deterministic plan for the task within the constraints.
    pub fn generate_plan(
        &mut self,
        task_id: &str,
        task_description: &str,
        constraints: &PlanningConstraints,
        execution_seed: u64,
    ) -> PlanningResult {
        let cache_key = hash_value(&json!({
            "task_id": task_id,
            "task": task_description,
            "constraints": constraints.canonical_value(),
            "execution_seed": execution_seed,
        }));
        if let Some(cached) = self.cache.get(&cache_key) {
            return cached.clone();
        }

        let result = self.plan_uncached(task_id, task_description, constraints, execution_seed);
        self.cache.insert(cache_key, result.clone());
        result
    }

    fn plan_uncached(
        &self,
        task_id: &str,
        task_description: &str,
        constraints: &PlanningConstraints,
        execution_seed: u64,
    ) -> PlanningResult {
        let mut violations = Vec::new();

        // Stage 1: parse the task into candidate steps
        let candidates = parse_task(task_description, execution_seed);

        // Stage 2: filter out steps whose capabilities were not granted
        let mut filtered = Vec::new();
        for step in candidates {
            let missing: Vec<String> = step
                .capabilities
                .iter()
                .filter(|cap| !constraints.allowed_capabilities.contains(*cap))
                .cloned()
                .collect();
            if missing.is_empty() {
                filtered.push(step);
            } else {
                violations.push(format!(
                    "Step '{}' requires missing capabilities: {}",
                    step.action,
                    missing.join(", ")
                ));
            }
        }

        // Stage 3: validate surviving steps against policy
        let mut validated = Vec::new();
        for step in filtered {
            if self.engine.action_allowed(step.action) {
                validated.push(step);
            } else {
                violations.push(format!("Step '{}' violates policy", step.action));
            }
        }

        // Stage 4: truncate to the step budget
        if validated.len() > constraints.max_steps {
            validated.truncate(constraints.max_steps);
            violations.push(format!("Plan truncated to {} steps", constraints.max_steps));
        }

        // Stage 5: build the immutable plan
        if validated.is_empty() {
            return PlanningResult {
                success: false,
                plan: None,
                violations,
                plan_hash: None,
                timestamp: self.clock.timestamp(),
                protocol_version: PROTOCOL_VERSION.to_string(),
            };
        }

        let mut builder = PlanBuilder::new(task_id, execution_seed, self.engine.policy_hash());
        for step in validated {
            builder.add_step(step.action, step.capabilities, step.parameters);
        }
        let plan = builder.build(self.clock.as_ref());
        let plan_hash = plan.compute_hash();

        PlanningResult {
            success: true,
            plan: Some(plan),
            violations,
            plan_hash: Some(plan_hash),
            timestamp: self.clock.timestamp(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Parse a task description into candidate steps with a deterministic
/// keyword mapping. Clauses separated by `;` or ` then ` each contribute
/// their own steps, in clause order. The seed never reaches a random source;
/// it exists so the caller can pin distinct plans for the same wording.
fn parse_task(task_description: &str, _execution_seed: u64) -> Vec<CandidateStep> {
    let mut steps = Vec::new();

    for clause in split_clauses(task_description) {
        let clause_lower = clause.to_lowercase();

        if contains_word(&clause_lower, "read") || contains_word(&clause_lower, "get") {
            steps.push(CandidateStep::new(
                "read",
                Some("fs:read"),
                &[("path", json!("/workspace"))],
            ));
        }
        if contains_word(&clause_lower, "write") || contains_word(&clause_lower, "save") {
            steps.push(CandidateStep::new(
                "write",
                Some("fs:write"),
                &[("path", json!("/workspace"))],
            ));
        }
        if contains_word(&clause_lower, "execute") || contains_word(&clause_lower, "run") {
            steps.push(CandidateStep::new(
                "execute",
                Some("os:process"),
                &[("command", json!("echo"))],
            ));
        }
        if contains_word(&clause_lower, "search") || contains_word(&clause_lower, "find") {
            steps.push(CandidateStep::new(
                "search",
                Some("net:http"),
                &[("query", json!(""))],
            ));
        }
    }

    if steps.is_empty() {
        steps.push(CandidateStep::new("analyze", None, &[]));
    }

    steps
}

fn split_clauses(task_description: &str) -> Vec<&str> {
    task_description
        .split(';')
        .flat_map(|part| part.split(" then "))
        .map(str::trim)
        .filter(|clause| !clause.is_empty())
        .collect()
}

fn contains_word(haystack: &str, needle: &str) -> bool {
    haystack
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| word == needle)
}
