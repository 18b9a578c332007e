//! Execution provenance registry.
//!
//! Append-only lineage: who submitted what, which node ran it, under which
//! schedule, with which audit root and proof. Each execution accumulates a
//! chain of records whose chain hash is recomputable; drift between the
//! stored and recomputed hash is an integrity failure.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical::hash_value;
use crate::errors::{FabricResult, IntegrityError};
use crate::PROTOCOL_VERSION;

/// One provenance record for an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceRecord {
    pub execution_id: String,
    pub tenant_id: String,
    pub contract_hash: String,
    pub node_id: String,
    pub cluster_schedule_hash: String,
    pub audit_root: String,
    pub execution_proof: String,
    pub timestamp: String,
    pub protocol_version: String,
}

impl ProvenanceRecord {
    fn canonical_value(&self) -> serde_json::Value {
        json!({
            "execution_id": self.execution_id,
            "tenant_id": self.tenant_id,
            "contract_hash": self.contract_hash,
            "node_id": self.node_id,
            "cluster_schedule_hash": self.cluster_schedule_hash,
            "audit_root": self.audit_root,
            "execution_proof": self.execution_proof,
            "timestamp": self.timestamp,
            "protocol_version": self.protocol_version,
        })
    }

    /// Deterministic hash of this record.
    pub fn compute_provenance_hash(&self) -> String {
        hash_value(&self.canonical_value())
    }
}

/// Ordered chain of provenance records for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvenanceChain {
    pub execution_id: String,
    pub records: Vec<ProvenanceRecord>,
    pub chain_hash: String,
    pub protocol_version: String,
}

/// Tracks full execution lineage across the cluster.
#[derive(Debug, Default)]
pub struct ProvenanceRegistry {
    records: HashMap<String, ProvenanceRecord>,
    chains: HashMap<String, ProvenanceChain>,
    audit_roots: HashMap<String, String>,
    /// Append-only JSONL log; `None` for in-memory operation.
    persist_path: Option<PathBuf>,
}

impl ProvenanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry persisted as an append-only JSONL log at `path`.
    pub fn with_persistence(path: PathBuf) -> FabricResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                IntegrityError::Io(format!("cannot create provenance log dir: {}", e))
            })?;
        }
        Ok(Self {
            persist_path: Some(path),
            ..Self::default()
        })
    }

    /// Record provenance; appends to the execution's chain and refreshes its
    /// chain hash. Persisted registries also append the record to the log;
    /// a log write failure is an integrity error, not a best-effort skip.
    pub fn record(&mut self, record: ProvenanceRecord) -> FabricResult<String> {
        if let Some(path) = &self.persist_path {
            let line = serde_json::to_string(&record).map_err(|e| {
                IntegrityError::Io(format!("cannot encode provenance record: {}", e))
            })?;
            append_line(path, &line)?;
        }

        let execution_id = record.execution_id.clone();
        self.audit_roots
            .insert(execution_id.clone(), record.audit_root.clone());
        self.records.insert(execution_id.clone(), record.clone());

        let chain = self
            .chains
            .entry(execution_id.clone())
            .or_insert_with(|| ProvenanceChain {
                execution_id: execution_id.clone(),
                records: Vec::new(),
                chain_hash: String::new(),
                protocol_version: PROTOCOL_VERSION.to_string(),
            });
        chain.records.push(record);
        chain.chain_hash = compute_chain_hash(&chain.records);
        Ok(execution_id)
    }

    pub fn get(&self, execution_id: &str) -> Option<&ProvenanceRecord> {
        self.records.get(execution_id)
    }

    pub fn get_chain(&self, execution_id: &str) -> Option<&ProvenanceChain> {
        self.chains.get(execution_id)
    }

    pub fn audit_root(&self, execution_id: &str) -> Option<&str> {
        self.audit_roots.get(execution_id).map(String::as_str)
    }

    /// Validate the record hash, the audit root presence, and the chain-hash
    /// consistency for one execution.
    pub fn verify_provenance_chain(&self, execution_id: &str) -> Result<(), IntegrityError> {
        let record = self.records.get(execution_id).ok_or_else(|| {
            IntegrityError::ChainDrift {
                context: format!("no provenance record for execution {}", execution_id),
            }
        })?;

        match self.audit_roots.get(execution_id) {
            None => {
                return Err(IntegrityError::ChainDrift {
                    context: format!("execution {} has no audit root", execution_id),
                })
            }
            Some(root) if root != &record.audit_root => {
                return Err(IntegrityError::HashMismatch {
                    expected: root.clone(),
                    actual: record.audit_root.clone(),
                })
            }
            Some(_) => {}
        }

        let chain = self.chains.get(execution_id).ok_or_else(|| {
            IntegrityError::ChainDrift {
                context: format!("execution {} has no provenance chain", execution_id),
            }
        })?;
        let expected = compute_chain_hash(&chain.records);
        if chain.chain_hash != expected {
            return Err(IntegrityError::HashMismatch {
                expected,
                actual: chain.chain_hash.clone(),
            });
        }
        Ok(())
    }

    /// All execution ids, sorted.
    pub fn list_executions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.records.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn executions_by_tenant(&self, tenant_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.tenant_id == tenant_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn executions_by_node(&self, node_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| r.node_id == node_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Deterministic hash of the whole registry, over sorted summaries.
    pub fn registry_hash(&self) -> String {
        let mut summaries: Vec<_> = self
            .records
            .values()
            .map(|r| {
                json!({
                    "execution_id": r.execution_id,
                    "tenant_id": r.tenant_id,
                    "contract_hash": r.contract_hash,
                    "node_id": r.node_id,
                    "audit_root": r.audit_root,
                })
            })
            .collect();
        summaries.sort_by_key(|v| v["execution_id"].as_str().map(str::to_string));
        hash_value(&json!({
            "executions": summaries,
            "protocol_version": PROTOCOL_VERSION,
        }))
    }
}

fn append_line(path: &std::path::Path, line: &str) -> Result<(), IntegrityError> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| IntegrityError::Io(format!("cannot open {}: {}", path.display(), e)))?;
    writeln!(file, "{}", line)
        .map_err(|e| IntegrityError::Io(format!("cannot append to {}: {}", path.display(), e)))?;
    Ok(())
}

fn compute_chain_hash(records: &[ProvenanceRecord]) -> String {
    let records: Vec<_> = records.iter().map(|r| r.canonical_value()).collect();
    hash_value(&json!({
        "records": records,
        "protocol_version": PROTOCOL_VERSION,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(execution_id: &str, node_id: &str) -> ProvenanceRecord {
        ProvenanceRecord {
            execution_id: execution_id.into(),
            tenant_id: "tenant-1".into(),
            contract_hash: "c".repeat(64),
            node_id: node_id.into(),
            cluster_schedule_hash: "s".repeat(64),
            audit_root: "a".repeat(64),
            execution_proof: "p".repeat(64),
            timestamp: "2026-01-01T00:00:00+00:00".into(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    #[test]
    fn recorded_chain_verifies() {
        let mut registry = ProvenanceRegistry::new();
        registry.record(record("e1", "n0")).unwrap();
        registry.verify_provenance_chain("e1").unwrap();
        assert_eq!(registry.audit_root("e1"), Some("a".repeat(64).as_str()));
    }

    #[test]
    fn chain_hash_tracks_appends() {
        let mut registry = ProvenanceRegistry::new();
        registry.record(record("e1", "n0")).unwrap();
        let first = registry.get_chain("e1").unwrap().chain_hash.clone();
        registry.record(record("e1", "n1")).unwrap();
        let second = registry.get_chain("e1").unwrap().chain_hash.clone();
        assert_ne!(first, second);
        assert_eq!(registry.get_chain("e1").unwrap().records.len(), 2);
        registry.verify_provenance_chain("e1").unwrap();
    }

    #[test]
    fn tampered_chain_hash_is_detected() {
        let mut registry = ProvenanceRegistry::new();
        registry.record(record("e1", "n0")).unwrap();
        registry.chains.get_mut("e1").unwrap().chain_hash = "f".repeat(64);
        assert!(registry.verify_provenance_chain("e1").is_err());
    }

    #[test]
    fn missing_execution_fails_verification() {
        let registry = ProvenanceRegistry::new();
        assert!(registry.verify_provenance_chain("ghost").is_err());
    }

    #[test]
    fn tenant_and_node_indices() {
        let mut registry = ProvenanceRegistry::new();
        registry.record(record("e1", "n0")).unwrap();
        registry.record(record("e2", "n1")).unwrap();
        assert_eq!(registry.executions_by_tenant("tenant-1"), vec!["e1", "e2"]);
        assert_eq!(registry.executions_by_node("n1"), vec!["e2"]);
        assert_eq!(registry.list_executions(), vec!["e1", "e2"]);
    }

    #[test]
    fn persisted_registry_appends_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("provenance").join("chain.jsonl");
        let mut registry = ProvenanceRegistry::with_persistence(path.clone()).unwrap();
        registry.record(record("e1", "n0")).unwrap();
        registry.record(record("e2", "n1")).unwrap();

        let log = std::fs::read_to_string(&path).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains("\"execution_id\":\"e1\""));
        registry.verify_provenance_chain("e2").unwrap();
    }

    #[test]
    fn registry_hash_is_insertion_order_independent() {
        let mut a = ProvenanceRegistry::new();
        a.record(record("e1", "n0")).unwrap();
        a.record(record("e2", "n1")).unwrap();
        let mut b = ProvenanceRegistry::new();
        b.record(record("e2", "n1")).unwrap();
        b.record(record("e1", "n0")).unwrap();
        assert_eq!(a.registry_hash(), b.registry_hash());
    }
}
