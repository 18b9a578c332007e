//! Cluster membership authority.
//!
//! The trust registry: which nodes may participate, at what trust level,
//! under which public key. Membership decisions are quorum-gated and the
//! whole registry is summarized by a deterministic membership hash that
//! feeds the cluster identity hash.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical::hash_value;
use crate::clock::SharedClock;
use crate::errors::IntegrityError;
use crate::PROTOCOL_VERSION;

/// Descriptor for a trusted cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedNodeDescriptor {
    pub node_id: String,
    pub node_name: String,
    pub public_key: String,
    pub trust_level: u8,
    pub registered_at: String,
    pub protocol_version: String,
}

impl TrustedNodeDescriptor {
    pub fn new(
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        public_key: impl Into<String>,
        trust_level: u8,
        registered_at: String,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            public_key: public_key.into(),
            trust_level,
            registered_at,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Deterministic hash of this descriptor.
    pub fn compute_node_hash(&self) -> String {
        hash_value(&json!({
            "node_id": self.node_id,
            "node_name": self.node_name,
            "public_key": self.public_key,
            "trust_level": self.trust_level,
            "registered_at": self.registered_at,
            "protocol_version": self.protocol_version,
        }))
    }
}

/// Quorum-gated registry of trusted nodes.
#[derive(Debug)]
pub struct MembershipAuthority {
    clock: SharedClock,
    nodes: HashMap<String, TrustedNodeDescriptor>,
    quorum_threshold: usize,
    membership_hash: Option<String>,
    last_updated: Option<String>,
}

impl MembershipAuthority {
    pub fn new(quorum_threshold: usize, clock: SharedClock) -> Self {
        Self {
            clock,
            nodes: HashMap::new(),
            quorum_threshold,
            membership_hash: None,
            last_updated: None,
        }
    }

    /// Register (or re-register) a trusted node and refresh the membership
    /// hash.
    pub fn register_trusted_node(&mut self, descriptor: TrustedNodeDescriptor) -> String {
        let node_id = descriptor.node_id.clone();
        log::info!(
            "[membership] trusted node {} registered at trust level {}",
            node_id,
            descriptor.trust_level
        );
        self.nodes.insert(node_id.clone(), descriptor);
        self.refresh();
        node_id
    }

    pub fn unregister_node(&mut self, node_id: &str) -> bool {
        let removed = self.nodes.remove(node_id).is_some();
        if removed {
            self.refresh();
        }
        removed
    }

    pub fn verify_membership(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn get_node(&self, node_id: &str) -> Option<&TrustedNodeDescriptor> {
        self.nodes.get(node_id)
    }

    /// All trusted nodes, sorted by node id.
    pub fn list_nodes(&self) -> Vec<&TrustedNodeDescriptor> {
        let mut nodes: Vec<&TrustedNodeDescriptor> = self.nodes.values().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    pub fn nodes_by_trust_level(&self, trust_level: u8) -> Vec<String> {
        let mut ids: Vec<String> = self
            .nodes
            .values()
            .filter(|n| n.trust_level == trust_level)
            .map(|n| n.node_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn quorum_threshold(&self) -> usize {
        self.quorum_threshold
    }

    /// Quorum holds iff the registered count reaches the threshold.
    pub fn validate_quorum(&self) -> bool {
        self.nodes.len() >= self.quorum_threshold
    }

    /// Deterministic hash over the sorted trusted descriptors.
    pub fn compute_membership_hash(&self) -> String {
        match &self.membership_hash {
            Some(hash) => hash.clone(),
            None => self.compute_membership_hash_uncached(),
        }
    }

    /// Combine membership hash, node count, quorum threshold and protocol
    /// version into the cluster identity.
    pub fn compute_cluster_identity_hash(&self) -> String {
        hash_value(&json!({
            "membership_hash": self.compute_membership_hash(),
            "node_count": self.nodes.len(),
            "quorum_threshold": self.quorum_threshold,
            "protocol_version": PROTOCOL_VERSION,
        }))
    }

    /// The cached membership hash must match a fresh recomputation.
    pub fn verify_membership_integrity(&self) -> Result<(), IntegrityError> {
        let computed = self.compute_membership_hash_uncached();
        if let Some(cached) = &self.membership_hash {
            if cached != &computed {
                return Err(IntegrityError::HashMismatch {
                    expected: cached.clone(),
                    actual: computed,
                });
            }
        }
        Ok(())
    }

    pub fn last_updated(&self) -> Option<&str> {
        self.last_updated.as_deref()
    }

    fn refresh(&mut self) {
        self.membership_hash = Some(self.compute_membership_hash_uncached());
        self.last_updated = Some(self.clock.timestamp());
    }

    fn compute_membership_hash_uncached(&self) -> String {
        let nodes: Vec<_> = self
            .list_nodes()
            .into_iter()
            .map(|n| {
                json!({
                    "node_id": n.node_id,
                    "node_name": n.node_name,
                    "public_key": n.public_key,
                    "trust_level": n.trust_level,
                    "registered_at": n.registered_at,
                    "node_hash": n.compute_node_hash(),
                })
            })
            .collect();
        hash_value(&json!({
            "nodes": nodes,
            "quorum_threshold": self.quorum_threshold,
            "protocol_version": PROTOCOL_VERSION,
        }))
    }
}
