//! Immutable plan model.
//!
//! Plans and steps are frozen after creation; any change produces a new value
//! with a new id. The plan hash covers everything except wall-clock fields,
//! so two plans built from identical inputs hash identically regardless of
//! when or where they were built.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::{canonical_json, hash_value, short_id};
use crate::clock::Clock;
use crate::PROTOCOL_VERSION;

/// One immutable step of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub step_id: String,
    pub action: String,
    pub required_capabilities: BTreeSet<String>,
    pub parameters: BTreeMap<String, Value>,
    pub order: u32,
    pub protocol_version: String,
}

impl PlanStep {
    fn canonical_value(&self) -> Value {
        json!({
            "step_id": self.step_id,
            "action": self.action,
            "required_capabilities": self.required_capabilities.iter().collect::<Vec<_>>(),
            "parameters": self.parameters,
            "order": self.order,
            "protocol_version": self.protocol_version,
        })
    }

    /// Canonical serialization of this step.
    pub fn to_canonical(&self) -> String {
        canonical_json(&self.canonical_value())
    }
}

/// Immutable deterministic plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub task_id: String,
    pub steps: Vec<PlanStep>,
    pub required_capabilities: BTreeSet<String>,
    pub policy_hash: String,
    pub execution_seed: u64,
    pub created_at: String,
    pub protocol_version: String,
}

impl Plan {
    /// Deterministic hash of the plan. Excludes `created_at`; identical for
    /// any two plans with the same task, steps, capabilities, policy hash and
    /// seed.
    pub fn compute_hash(&self) -> String {
        let mut ordered: Vec<&PlanStep> = self.steps.iter().collect();
        ordered.sort_by_key(|s| s.order);
        let data = json!({
            "id": self.plan_id,
            "task_id": self.task_id,
            "steps": ordered.iter().map(|s| s.to_canonical()).collect::<Vec<_>>(),
            "required_capabilities": self.required_capabilities.iter().collect::<Vec<_>>(),
            "policy_hash": self.policy_hash,
            "execution_seed": self.execution_seed,
            "protocol_version": self.protocol_version,
        });
        hash_value(&data)
    }

    /// Union of the plan-level capabilities and every step's requirements.
    pub fn all_capabilities(&self) -> BTreeSet<String> {
        let mut caps = self.required_capabilities.clone();
        for step in &self.steps {
            caps.extend(step.required_capabilities.iter().cloned());
        }
        caps
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}

/// Builds plans deterministically: step ids derive from
/// `(task_id, order, action)` and the plan id from
/// `(task_id, execution_seed, policy_hash)`.
#[derive(Debug)]
pub struct PlanBuilder {
    task_id: String,
    execution_seed: u64,
    policy_hash: String,
    steps: Vec<PlanStep>,
    capabilities: BTreeSet<String>,
}

impl PlanBuilder {
    pub fn new(
        task_id: impl Into<String>,
        execution_seed: u64,
        policy_hash: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            execution_seed,
            policy_hash: policy_hash.into(),
            steps: Vec::new(),
            capabilities: BTreeSet::new(),
        }
    }

    pub fn add_step(
        &mut self,
        action: impl Into<String>,
        capabilities: BTreeSet<String>,
        parameters: BTreeMap<String, Value>,
    ) -> &mut Self {
        let action = action.into();
        let order = self.steps.len() as u32;
        let step_id = short_id(&format!("{}:{}:{}", self.task_id, order, action));
        self.capabilities.extend(capabilities.iter().cloned());
        self.steps.push(PlanStep {
            step_id,
            action,
            required_capabilities: capabilities,
            parameters,
            order,
            protocol_version: PROTOCOL_VERSION.to_string(),
        });
        self
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Freeze the accumulated steps into an immutable plan. The clock stamps
    /// `created_at` only; it never reaches the plan hash.
    pub fn build(&self, clock: &dyn Clock) -> Plan {
        let plan_id = short_id(&format!(
            "{}:{}:{}",
            self.task_id, self.execution_seed, self.policy_hash
        ));
        Plan {
            plan_id,
            task_id: self.task_id.clone(),
            steps: self.steps.clone(),
            required_capabilities: self.capabilities.clone(),
            policy_hash: self.policy_hash.clone(),
            execution_seed: self.execution_seed,
            created_at: clock.timestamp(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{fixed_clock, FixedClock};
    use chrono::Duration;

    fn caps(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn sample_plan(clock: &dyn Clock) -> Plan {
        let mut builder = PlanBuilder::new("task-7", 42, "policy-hash");
        builder.add_step("read", caps(&["fs:read"]), BTreeMap::new());
        builder.add_step("write", caps(&["fs:write"]), BTreeMap::new());
        builder.build(clock)
    }

    #[test]
    fn step_ids_derive_from_task_order_action() {
        let plan = sample_plan(&*fixed_clock());
        assert_eq!(plan.steps[0].step_id, short_id("task-7:0:read"));
        assert_eq!(plan.steps[1].step_id, short_id("task-7:1:write"));
    }

    #[test]
    fn hash_ignores_created_at() {
        let clock = FixedClock::default_epoch();
        let first = sample_plan(&clock);
        clock.advance(Duration::hours(6));
        let second = sample_plan(&clock);

        assert_ne!(first.created_at, second.created_at);
        assert_eq!(first.compute_hash(), second.compute_hash());
    }

    #[test]
    fn hash_changes_with_seed() {
        let clock = fixed_clock();
        let mut builder = PlanBuilder::new("task-7", 43, "policy-hash");
        builder.add_step("read", caps(&["fs:read"]), BTreeMap::new());
        builder.add_step("write", caps(&["fs:write"]), BTreeMap::new());
        let other = builder.build(&*clock);
        assert_ne!(sample_plan(&*clock).compute_hash(), other.compute_hash());
    }

    #[test]
    fn serde_round_trip_preserves_hash() {
        let plan = sample_plan(&*fixed_clock());
        let encoded = serde_json::to_string(&plan).unwrap();
        let decoded: Plan = serde_json::from_str(&encoded).unwrap();
        assert_eq!(plan.compute_hash(), decoded.compute_hash());
        assert_eq!(plan, decoded);
    }

    #[test]
    fn all_capabilities_unions_steps() {
        let plan = sample_plan(&*fixed_clock());
        assert_eq!(plan.all_capabilities(), caps(&["fs:read", "fs:write"]));
    }
}
