//! Distributed execution domain.
//!
//! Federates execution domains across the node pool: node registration with
//! heartbeat tracking, deterministic contract assignment by consistent
//! hashing over sorted node ids, and domain membership integrity.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical::{hash_value, sha256_hex};
use crate::clock::SharedClock;
use crate::errors::{FabricError, FabricResult, RegistrationFailed};
use crate::PROTOCOL_VERSION;

/// Descriptor for one worker node in the distributed domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_id: String,
    pub node_name: String,
    pub capabilities: Vec<String>,
    pub resource_limits: BTreeMap<String, u64>,
    pub endpoint: String,
    pub registered_at: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub protocol_version: String,
}

impl NodeDescriptor {
    pub fn new(
        node_id: impl Into<String>,
        node_name: impl Into<String>,
        capabilities: Vec<String>,
        endpoint: impl Into<String>,
        registered_at: String,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_name: node_name.into(),
            capabilities,
            resource_limits: BTreeMap::new(),
            endpoint: endpoint.into(),
            registered_at,
            last_heartbeat: None,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// Cross-node domain registry with deterministic assignment.
#[derive(Debug)]
pub struct DistributedExecutionDomain {
    clock: SharedClock,
    nodes: HashMap<String, NodeDescriptor>,
    /// domain_id -> node ids participating in that domain.
    domain_memberships: HashMap<String, Vec<String>>,
    heartbeat_timeout: Duration,
}

impl DistributedExecutionDomain {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            nodes: HashMap::new(),
            domain_memberships: HashMap::new(),
            heartbeat_timeout: Duration::seconds(30),
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Register a node. Duplicate ids are refused.
    pub fn register_node(&mut self, descriptor: NodeDescriptor) -> FabricResult<String> {
        if self.nodes.contains_key(&descriptor.node_id) {
            return Err(RegistrationFailed::DuplicateNode {
                node_id: descriptor.node_id,
            }
            .into());
        }
        let node_id = descriptor.node_id.clone();
        log::info!("[cluster] node {} joined the execution domain", node_id);
        self.nodes.insert(node_id.clone(), descriptor);
        Ok(node_id)
    }

    pub fn unregister_node(&mut self, node_id: &str) -> bool {
        self.nodes.remove(node_id).is_some()
    }

    pub fn get_node(&self, node_id: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(node_id)
    }

    /// All nodes, sorted by node id.
    pub fn all_nodes(&self) -> Vec<&NodeDescriptor> {
        let mut nodes: Vec<&NodeDescriptor> = self.nodes.values().collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Record a heartbeat at the current clock instant.
    pub fn record_heartbeat(&mut self, node_id: &str) -> bool {
        match self.nodes.get_mut(node_id) {
            Some(node) => {
                node.last_heartbeat = Some(self.clock.now());
                true
            }
            None => false,
        }
    }

    /// Nodes whose last heartbeat is within the timeout, sorted by id.
    pub fn active_nodes(&self) -> Vec<&NodeDescriptor> {
        let now = self.clock.now();
        let mut active: Vec<&NodeDescriptor> = self
            .nodes
            .values()
            .filter(|node| match node.last_heartbeat {
                Some(beat) => now - beat < self.heartbeat_timeout,
                None => false,
            })
            .collect();
        active.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        active
    }

    /// Deterministic contract assignment by consistent hashing over the
    /// sorted node id list.
    pub fn assign_execution(&self, tenant_id: &str, contract_id: &str) -> FabricResult<String> {
        if self.nodes.is_empty() {
            return Err(FabricError::Config("no nodes registered in domain".into()));
        }
        let digest = sha256_hex(format!("{}:{}", tenant_id, contract_id).as_bytes());
        let bucket = u64::from_str_radix(&digest[..8], 16)
            .expect("sha256 hex prefix is valid hex");

        let mut node_ids: Vec<&String> = self.nodes.keys().collect();
        node_ids.sort();
        let index = (bucket as usize) % node_ids.len();
        Ok(node_ids[index].to_string())
    }

    /// Record that a domain spans the given nodes.
    pub fn record_domain_membership(&mut self, domain_id: &str, node_ids: Vec<String>) {
        self.domain_memberships
            .insert(domain_id.to_string(), node_ids);
    }

    /// A domain's integrity holds iff every node it references is still
    /// registered. Unknown domains are valid (nothing to contradict).
    pub fn verify_domain_integrity(&self, domain_id: &str) -> bool {
        match self.domain_memberships.get(domain_id) {
            Some(node_ids) => node_ids.iter().all(|id| self.nodes.contains_key(id)),
            None => true,
        }
    }

    /// Deterministic hash of the domain state, over sorted node summaries.
    pub fn compute_domain_hash(&self) -> String {
        let nodes: Vec<_> = self
            .all_nodes()
            .into_iter()
            .map(|n| {
                let mut capabilities = n.capabilities.clone();
                capabilities.sort();
                json!({
                    "node_id": n.node_id,
                    "capabilities": capabilities,
                    "endpoint": n.endpoint,
                })
            })
            .collect();
        hash_value(&json!({
            "nodes": nodes,
            "protocol_version": PROTOCOL_VERSION,
        }))
    }
}
