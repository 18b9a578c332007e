//! Cluster scheduler.
//!
//! Deterministic placement of tasks onto nodes by consistent hashing over
//! `(tenant_id, task_id)`. The schedule hash is a pure function of the
//! schedule's content — same input, same hash, on any machine, no matter
//! when nodes joined.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::{hash_value, sha256_hex, short_hash_value};
use crate::clock::SharedClock;
use crate::errors::{FabricError, FabricResult};
use crate::PROTOCOL_VERSION;

/// A task submitted for cluster scheduling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    pub action: String,
    pub input: Value,
    pub priority: i32,
    pub protocol_version: String,
}

impl ScheduledTask {
    pub fn new(task_id: impl Into<String>, action: impl Into<String>, input: Value) -> Self {
        Self {
            task_id: task_id.into(),
            action: action.into(),
            input,
            priority: 0,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Schedule for cluster-wide execution of one tenant's tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSchedule {
    pub schedule_id: String,
    pub tenant_id: String,
    /// node_id -> task ids assigned there.
    pub node_assignments: BTreeMap<String, Vec<String>>,
    pub execution_seed: u64,
    pub created_at: String,
    pub protocol_version: String,
}

/// Deterministic scheduler over a fixed node pool.
#[derive(Debug, Clone)]
pub struct ClusterScheduler {
    nodes: Vec<String>,
    clock: SharedClock,
}

impl ClusterScheduler {
    pub fn new(nodes: Vec<String>, clock: SharedClock) -> Self {
        let mut scheduler = Self {
            nodes: Vec::new(),
            clock,
        };
        for node in nodes {
            scheduler.add_node(&node);
        }
        scheduler
    }

    pub fn add_node(&mut self, node_id: &str) {
        if !self.nodes.iter().any(|n| n == node_id) {
            self.nodes.push(node_id.to_string());
            self.nodes.sort();
        }
    }

    pub fn remove_node(&mut self, node_id: &str) {
        self.nodes.retain(|n| n != node_id);
    }

    /// Sorted node pool, the basis for every placement decision.
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    /// Consistent-hash placement: first 8 hex chars of
    /// `SHA-256("tenant:task")` reduced modulo the sorted node list.
    pub fn schedule(&self, tenant_id: &str, task_id: &str) -> FabricResult<String> {
        if self.nodes.is_empty() {
            return Err(FabricError::Config("no nodes registered".into()));
        }
        let digest = sha256_hex(format!("{}:{}", tenant_id, task_id).as_bytes());
        let bucket = u64::from_str_radix(&digest[..8], 16)
            .expect("sha256 hex prefix is valid hex");
        let index = (bucket as usize) % self.nodes.len();
        Ok(self.nodes[index].clone())
    }

    /// Build a schedule for a batch of tasks. An absent seed is derived
    /// deterministically from `(tenant_id, sorted task_ids)` — never from
    /// the wall clock.
    pub fn create_schedule(
        &self,
        tenant_id: &str,
        tasks: &[ScheduledTask],
        execution_seed: Option<u64>,
    ) -> FabricResult<ClusterSchedule> {
        let execution_seed =
            execution_seed.unwrap_or_else(|| derive_seed(tenant_id, tasks));

        let mut node_assignments: BTreeMap<String, Vec<String>> = self
            .nodes
            .iter()
            .map(|n| (n.clone(), Vec::new()))
            .collect();
        for task in tasks {
            let node_id = self.schedule(tenant_id, &task.task_id)?;
            node_assignments
                .get_mut(&node_id)
                .expect("scheduled node is in the pool")
                .push(task.task_id.clone());
        }

        let mut task_ids: Vec<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        task_ids.sort();
        let schedule_id = format!(
            "schedule_{}",
            short_hash_value(&json!({
                "tenant_id": tenant_id,
                "tasks": task_ids,
                "execution_seed": execution_seed,
            }))
        );

        Ok(ClusterSchedule {
            schedule_id,
            tenant_id: tenant_id.to_string(),
            node_assignments,
            execution_seed,
            created_at: self.clock.timestamp(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        })
    }

    /// Deterministic hash of a schedule: sorted assignment keys, sorted task
    /// lists, wall-clock fields excluded.
    pub fn compute_schedule_hash(&self, schedule: &ClusterSchedule) -> String {
        compute_schedule_hash(schedule)
    }
}

/// Free-function form so verifiers without a scheduler can recompute.
pub fn compute_schedule_hash(schedule: &ClusterSchedule) -> String {
    let assignments: BTreeMap<&String, Vec<&String>> = schedule
        .node_assignments
        .iter()
        .map(|(node, tasks)| {
            let mut sorted: Vec<&String> = tasks.iter().collect();
            sorted.sort();
            (node, sorted)
        })
        .collect();
    hash_value(&json!({
        "schedule_id": schedule.schedule_id,
        "tenant_id": schedule.tenant_id,
        "node_assignments": assignments,
        "execution_seed": schedule.execution_seed,
        "protocol_version": schedule.protocol_version,
    }))
}

fn derive_seed(tenant_id: &str, tasks: &[ScheduledTask]) -> u64 {
    let mut task_ids: Vec<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
    task_ids.sort();
    let digest = hash_value(&json!({
        "tenant_id": tenant_id,
        "tasks": task_ids,
    }));
    u64::from_str_radix(&digest[..8], 16).expect("sha256 hex prefix is valid hex")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;

    fn scheduler() -> ClusterScheduler {
        ClusterScheduler::new(
            vec!["node_2".into(), "node_0".into(), "node_1".into()],
            fixed_clock(),
        )
    }

    fn tasks(ids: &[&str]) -> Vec<ScheduledTask> {
        ids.iter()
            .map(|id| ScheduledTask::new(*id, "read", json!({})))
            .collect()
    }

    #[test]
    fn placement_is_deterministic_across_runs() {
        let a = scheduler();
        let b = scheduler();
        for task in ["t-1", "t-2", "t-3", "t-4"] {
            assert_eq!(
                a.schedule("tenant-1", task).unwrap(),
                b.schedule("tenant-1", task).unwrap()
            );
        }
    }

    #[test]
    fn node_pool_is_kept_sorted_and_deduplicated() {
        let mut scheduler = scheduler();
        scheduler.add_node("node_1");
        assert_eq!(scheduler.nodes(), ["node_0", "node_1", "node_2"]);
        scheduler.remove_node("node_1");
        assert_eq!(scheduler.nodes(), ["node_0", "node_2"]);
    }

    #[test]
    fn derived_seed_ignores_task_order() {
        let scheduler = scheduler();
        let forward = scheduler
            .create_schedule("tenant-1", &tasks(&["a", "b", "c"]), None)
            .unwrap();
        let reversed = scheduler
            .create_schedule("tenant-1", &tasks(&["c", "b", "a"]), None)
            .unwrap();
        assert_eq!(forward.execution_seed, reversed.execution_seed);
    }

    #[test]
    fn schedule_hash_is_machine_independent() {
        let scheduler = scheduler();
        let batch = tasks(&["t-1", "t-2", "t-3"]);
        let first = scheduler.create_schedule("tenant-1", &batch, Some(7)).unwrap();
        let second = scheduler.create_schedule("tenant-1", &batch, Some(7)).unwrap();

        assert_eq!(first.schedule_id, second.schedule_id);
        assert_eq!(
            compute_schedule_hash(&first),
            compute_schedule_hash(&second)
        );
    }

    #[test]
    fn explicit_seed_is_used_verbatim() {
        let scheduler = scheduler();
        let schedule = scheduler
            .create_schedule("tenant-1", &tasks(&["t-1"]), Some(99))
            .unwrap();
        assert_eq!(schedule.execution_seed, 99);
    }

    #[test]
    fn empty_pool_fails_placement() {
        let scheduler = ClusterScheduler::new(vec![], fixed_clock());
        assert!(scheduler.schedule("tenant-1", "t-1").is_err());
    }
}
