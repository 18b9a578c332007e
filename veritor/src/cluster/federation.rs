//! Federated audit coordinator.
//!
//! Collects per-node Merkle roots and aggregates them into one cluster
//! root. Two coordinators fed identical root maps compute identical cluster
//! roots; cross-node replay verification compares key sets and root values
//! exactly.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical::{hash_value, is_valid_sha256_hex, sha256_hex};
use crate::clock::SharedClock;
use crate::errors::IntegrityError;
use crate::PROTOCOL_VERSION;

/// Point-in-time aggregation of per-node audit roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedAuditRoot {
    pub aggregation_id: String,
    pub timestamp: String,
    pub node_roots: BTreeMap<String, String>,
    pub global_root: String,
    pub protocol_version: String,
}

/// Aggregates audit roots from the node pool into the cluster root.
#[derive(Debug)]
pub struct FederatedAuditCoordinator {
    clock: SharedClock,
    node_roots: BTreeMap<String, String>,
    aggregation_history: Vec<FederatedAuditRoot>,
    aggregation_counter: u64,
}

impl FederatedAuditCoordinator {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            node_roots: BTreeMap::new(),
            aggregation_history: Vec::new(),
            aggregation_counter: 0,
        }
    }

    /// Record the Merkle root reported by one node.
    pub fn collect_node_root(&mut self, node_id: &str, audit_root: String) {
        self.node_roots.insert(node_id.to_string(), audit_root);
    }

    pub fn node_root(&self, node_id: &str) -> Option<&str> {
        self.node_roots.get(node_id).map(String::as_str)
    }

    pub fn all_node_roots(&self) -> &BTreeMap<String, String> {
        &self.node_roots
    }

    pub fn remove_node_root(&mut self, node_id: &str) -> bool {
        self.node_roots.remove(node_id).is_some()
    }

    pub fn clear_node_roots(&mut self) {
        self.node_roots.clear();
    }

    /// Cluster root over the sorted `(node_id, root)` pairs. An empty
    /// collection has the stable `empty` root.
    pub fn compute_cluster_root(&self) -> String {
        if self.node_roots.is_empty() {
            return sha256_hex(b"empty");
        }
        let nodes: Vec<_> = self
            .node_roots
            .iter()
            .map(|(node_id, root)| json!({"node_id": node_id, "root": root}))
            .collect();
        hash_value(&json!({
            "nodes": nodes,
            "protocol_version": PROTOCOL_VERSION,
        }))
    }

    /// Every stored root must be a well-formed lowercase SHA-256 digest.
    pub fn verify_cluster_integrity(&self) -> Result<(), IntegrityError> {
        for (node_id, root) in &self.node_roots {
            if !is_valid_sha256_hex(root) {
                return Err(IntegrityError::ChainDrift {
                    context: format!("node {} reported a malformed root", node_id),
                });
            }
        }
        Ok(())
    }

    /// Cross-node replay check: identical key sets and identical root
    /// values, nothing less.
    pub fn verify_cross_node_replay(&self, expected: &BTreeMap<String, String>) -> bool {
        if self.node_roots.len() != expected.len() {
            return false;
        }
        expected
            .iter()
            .all(|(node_id, root)| self.node_roots.get(node_id) == Some(root))
    }

    /// Snapshot the current aggregation.
    pub fn create_federated_root(&mut self) -> FederatedAuditRoot {
        self.aggregation_counter += 1;
        let root = FederatedAuditRoot {
            aggregation_id: format!("federation_{}", self.aggregation_counter),
            timestamp: self.clock.timestamp(),
            node_roots: self.node_roots.clone(),
            global_root: self.compute_cluster_root(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        self.aggregation_history.push(root.clone());
        root
    }

    pub fn aggregation_history(&self) -> &[FederatedAuditRoot] {
        &self.aggregation_history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;

    fn root_of(label: &str) -> String {
        sha256_hex(label.as_bytes())
    }

    #[test]
    fn identical_root_maps_produce_identical_cluster_roots() {
        let mut a = FederatedAuditCoordinator::new(fixed_clock());
        let mut b = FederatedAuditCoordinator::new(fixed_clock());

        a.collect_node_root("n0", root_of("zero"));
        a.collect_node_root("n1", root_of("one"));
        // reversed insertion order
        b.collect_node_root("n1", root_of("one"));
        b.collect_node_root("n0", root_of("zero"));

        assert_eq!(a.compute_cluster_root(), b.compute_cluster_root());
    }

    #[test]
    fn empty_cluster_has_stable_root() {
        let coordinator = FederatedAuditCoordinator::new(fixed_clock());
        assert_eq!(coordinator.compute_cluster_root(), sha256_hex(b"empty"));
        coordinator.verify_cluster_integrity().unwrap();
    }

    #[test]
    fn malformed_root_fails_integrity() {
        let mut coordinator = FederatedAuditCoordinator::new(fixed_clock());
        coordinator.collect_node_root("n0", "not-a-hash".into());
        assert!(coordinator.verify_cluster_integrity().is_err());
    }

    #[test]
    fn cross_node_replay_requires_exact_match() {
        let mut coordinator = FederatedAuditCoordinator::new(fixed_clock());
        coordinator.collect_node_root("n0", root_of("zero"));
        coordinator.collect_node_root("n1", root_of("one"));

        let mut expected = BTreeMap::new();
        expected.insert("n0".to_string(), root_of("zero"));
        expected.insert("n1".to_string(), root_of("one"));
        assert!(coordinator.verify_cross_node_replay(&expected));

        expected.insert("n1".to_string(), root_of("drifted"));
        assert!(!coordinator.verify_cross_node_replay(&expected));

        expected.remove("n1");
        assert!(!coordinator.verify_cross_node_replay(&expected));
    }

    #[test]
    fn snapshots_accumulate_in_history() {
        let mut coordinator = FederatedAuditCoordinator::new(fixed_clock());
        coordinator.collect_node_root("n0", root_of("zero"));
        let first = coordinator.create_federated_root();
        coordinator.collect_node_root("n1", root_of("one"));
        let second = coordinator.create_federated_root();

        assert_eq!(first.aggregation_id, "federation_1");
        assert_eq!(second.aggregation_id, "federation_2");
        assert_ne!(first.global_root, second.global_root);
        assert_eq!(coordinator.aggregation_history().len(), 2);
    }
}
