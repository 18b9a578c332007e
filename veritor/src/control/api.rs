//! Orchestrator control API.
//!
//! The only legitimate entry point for external submitters (HTTP/CLI/GUI
//! surfaces consume this contract). A submission without a runtime contract
//! is refused outright; every accepted operation is audit-logged and leaves
//! a provenance record behind.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::canonical::{hash_value, sha256_hex, short_hash_value};
use crate::clock::SharedClock;
use crate::cluster::federation::FederatedAuditCoordinator;
use crate::cluster::membership::MembershipAuthority;
use crate::cluster::scheduler::ClusterScheduler;
use crate::control::provenance::{ProvenanceRecord, ProvenanceRegistry};
use crate::errors::{FabricResult, ProtocolError};
use crate::PROTOCOL_VERSION;

/// Control-plane audit log entry. Distinct from the node audit chain: this
/// log tracks control operations, not execution steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub audit_id: String,
    pub operation: String,
    pub tenant_id: String,
    pub execution_id: Option<String>,
    pub timestamp: String,
    pub details: Value,
    pub protocol_version: String,
}

/// Tracked status of one submitted execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatusRecord {
    pub execution_id: String,
    pub status: String,
    pub tenant_id: String,
    pub contract_id: String,
    pub node_id: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error: Option<String>,
    pub protocol_version: String,
}

/// Reply to a successful submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionReceipt {
    pub execution_id: String,
    pub status: String,
    pub audit_id: String,
    pub timestamp: String,
    pub protocol_version: String,
}

/// Tenant-facing control surface over the cluster.
pub struct ControlApi {
    clock: SharedClock,
    provenance: Arc<RwLock<ProvenanceRegistry>>,
    membership: Arc<RwLock<MembershipAuthority>>,
    federation: Arc<RwLock<FederatedAuditCoordinator>>,
    scheduler: Option<ClusterScheduler>,
    audit_log: Vec<AuditLogEntry>,
    executions: HashMap<String, ExecutionStatusRecord>,
    proofs: HashMap<String, Value>,
}

impl std::fmt::Debug for ControlApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlApi")
            .field("executions", &self.executions.len())
            .field("audit_log", &self.audit_log.len())
            .finish()
    }
}

impl ControlApi {
    pub fn new(
        clock: SharedClock,
        provenance: Arc<RwLock<ProvenanceRegistry>>,
        membership: Arc<RwLock<MembershipAuthority>>,
        federation: Arc<RwLock<FederatedAuditCoordinator>>,
    ) -> Self {
        Self {
            clock,
            provenance,
            membership,
            federation,
            scheduler: None,
            audit_log: Vec::new(),
            executions: HashMap::new(),
            proofs: HashMap::new(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: ClusterScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Submit an execution request. The runtime contract is mandatory;
    /// submissions without one are a protocol error, not a soft failure.
    pub fn submit_execution_request(
        &mut self,
        tenant_id: &str,
        contract_id: Option<&str>,
        input_data: &Value,
    ) -> FabricResult<SubmissionReceipt> {
        let contract_id = contract_id.ok_or(ProtocolError::ContractRequired)?;

        let issued_at = self.clock.timestamp();
        let input_hash = hash_value(input_data);
        let execution_id = short_hash_value(&json!({
            "tenant_id": tenant_id,
            "contract_id": contract_id,
            "input_hash": input_hash,
            "issued_at": issued_at,
            "protocol_version": PROTOCOL_VERSION,
        }));

        let audit_id = self.log_operation(
            "submit_execution_request",
            tenant_id,
            Some(execution_id.as_str()),
            json!({"contract_id": contract_id, "input_hash": input_hash}),
        );

        self.executions.insert(
            execution_id.clone(),
            ExecutionStatusRecord {
                execution_id: execution_id.clone(),
                status: "pending".into(),
                tenant_id: tenant_id.to_string(),
                contract_id: contract_id.to_string(),
                node_id: None,
                started_at: None,
                completed_at: None,
                error: None,
                protocol_version: PROTOCOL_VERSION.to_string(),
            },
        );

        self.proofs.insert(
            execution_id.clone(),
            json!({
                "execution_id": execution_id,
                "tenant_id": tenant_id,
                "contract_id": contract_id,
                "input_hash": input_hash,
                "audit_id": audit_id,
                "timestamp": issued_at,
                "protocol_version": PROTOCOL_VERSION,
            }),
        );

        // place the execution and record its provenance
        let node_id = match &self.scheduler {
            Some(scheduler) => scheduler.schedule(tenant_id, &execution_id)?,
            None => "node_0".to_string(),
        };
        let record = ProvenanceRecord {
            execution_id: execution_id.clone(),
            tenant_id: tenant_id.to_string(),
            contract_hash: sha256_hex(contract_id.as_bytes()),
            node_id,
            cluster_schedule_hash: sha256_hex(execution_id.as_bytes()),
            audit_root: sha256_hex(audit_id.as_bytes()),
            execution_proof: sha256_hex(format!("proof_{}", execution_id).as_bytes()),
            timestamp: issued_at.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        self.provenance
            .write()
            .expect("provenance lock poisoned")
            .record(record)?;

        Ok(SubmissionReceipt {
            execution_id,
            status: "pending".into(),
            audit_id,
            timestamp: issued_at,
            protocol_version: PROTOCOL_VERSION.to_string(),
        })
    }

    /// Move a tracked execution through its lifecycle.
    pub fn update_execution_status(
        &mut self,
        execution_id: &str,
        status: &str,
        node_id: Option<String>,
        error: Option<String>,
    ) -> bool {
        let now = self.clock.timestamp();
        match self.executions.get_mut(execution_id) {
            Some(record) => {
                record.status = status.to_string();
                if node_id.is_some() {
                    record.node_id = node_id;
                }
                match status {
                    "running" => record.started_at = Some(now),
                    "completed" | "failed" => record.completed_at = Some(now),
                    _ => {}
                }
                record.error = error;
                true
            }
            None => false,
        }
    }

    pub fn query_execution_status(&mut self, execution_id: &str) -> Option<ExecutionStatusRecord> {
        self.log_operation("query_execution_status", "system", Some(execution_id), json!({}));
        self.executions.get(execution_id).cloned()
    }

    pub fn retrieve_execution_proof(&mut self, execution_id: &str) -> Option<Value> {
        self.log_operation(
            "retrieve_execution_proof",
            "system",
            Some(execution_id),
            json!({}),
        );
        self.proofs.get(execution_id).cloned()
    }

    /// Trusted nodes, sorted by node id.
    pub fn list_cluster_nodes(&mut self) -> Vec<Value> {
        self.log_operation("list_cluster_nodes", "system", None, json!({}));
        let membership = self.membership.read().expect("membership lock poisoned");
        membership
            .list_nodes()
            .into_iter()
            .map(|n| {
                json!({
                    "node_id": n.node_id,
                    "node_name": n.node_name,
                    "trust_level": n.trust_level,
                    "registered_at": n.registered_at,
                    "protocol_version": n.protocol_version,
                })
            })
            .collect()
    }

    /// Cluster root view: membership hash plus the federated global root.
    pub fn get_cluster_root(&mut self) -> Value {
        self.log_operation("get_cluster_root", "system", None, json!({}));
        let membership = self.membership.read().expect("membership lock poisoned");
        let federation = self.federation.read().expect("federation lock poisoned");
        json!({
            "membership_hash": membership.compute_membership_hash(),
            "node_count": membership.node_count(),
            "global_root": federation.compute_cluster_root(),
            "protocol_version": PROTOCOL_VERSION,
        })
    }

    pub fn get_audit_log(&self) -> &[AuditLogEntry] {
        &self.audit_log
    }

    fn log_operation(
        &mut self,
        operation: &str,
        tenant_id: &str,
        execution_id: Option<&str>,
        details: Value,
    ) -> String {
        let audit_id = format!("audit_{}", &Uuid::new_v4().simple().to_string()[..12]);
        self.audit_log.push(AuditLogEntry {
            audit_id: audit_id.clone(),
            operation: operation.to_string(),
            tenant_id: tenant_id.to_string(),
            execution_id: execution_id.map(str::to_string),
            timestamp: self.clock.timestamp(),
            details,
            protocol_version: PROTOCOL_VERSION.to_string(),
        });
        audit_id
    }
}
