//! Orchestrator/runtime bridge.
//!
//! For every executed contract the bridge derives a deterministic execution
//! hash and audit root and indexes a signed-shape [`ExecutionProof`] under
//! its proof id. Verification recomputes the audit root from the execution
//! hash, so a forged proof fails without any network round trip.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::hash_value;
use crate::clock::SharedClock;
use crate::errors::{IntegrityError, ProtocolError};
use crate::PROTOCOL_VERSION;

/// Proof that a specific contract was executed on a specific node with a
/// specific audit root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionProof {
    pub proof_id: String,
    pub node_id: String,
    pub contract_id: String,
    pub execution_hash: String,
    pub audit_root: String,
    pub timestamp: String,
    pub protocol_version: String,
}

/// Bridge between the cluster orchestrator and a node's runtime.
#[derive(Debug)]
pub struct RuntimeBridge {
    node_id: String,
    clock: SharedClock,
    proofs: HashMap<String, ExecutionProof>,
}

impl RuntimeBridge {
    pub fn new(node_id: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            node_id: node_id.into(),
            clock,
            proofs: HashMap::new(),
        }
    }

    /// `SHA-256(canonical({contract_id, input, protocol_version}))`.
    pub fn compute_execution_hash(&self, contract_id: &str, input: &Value) -> String {
        hash_value(&json!({
            "contract_id": contract_id,
            "input": input,
            "protocol_version": PROTOCOL_VERSION,
        }))
    }

    /// `SHA-256(canonical({execution_hash, protocol_version}))`.
    pub fn compute_audit_root(&self, execution_hash: &str) -> String {
        hash_value(&json!({
            "execution_hash": execution_hash,
            "protocol_version": PROTOCOL_VERSION,
        }))
    }

    /// Build and index the proof for one executed contract.
    pub fn attest(&mut self, contract_id: &str, input: &Value) -> ExecutionProof {
        let execution_hash = self.compute_execution_hash(contract_id, input);
        let proof = ExecutionProof {
            proof_id: format!("proof_{}", &execution_hash[..16]),
            node_id: self.node_id.clone(),
            contract_id: contract_id.to_string(),
            execution_hash: execution_hash.clone(),
            audit_root: self.compute_audit_root(&execution_hash),
            timestamp: self.clock.timestamp(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        self.proofs.insert(proof.proof_id.clone(), proof.clone());
        proof
    }

    /// Verify a proof produced by any node: protocol version,
    /// well-formedness, and that the audit root recomputes from the
    /// execution hash.
    pub fn verify_remote_execution(
        &self,
        proof: &ExecutionProof,
    ) -> Result<(), crate::errors::FabricError> {
        if proof.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION.to_string(),
                actual: proof.protocol_version.clone(),
            }
            .into());
        }
        if proof.proof_id.is_empty() || proof.execution_hash.is_empty() {
            return Err(ProtocolError::MalformedEnvelope {
                reason: "proof is missing its id or execution hash".into(),
            }
            .into());
        }
        let expected = self.compute_audit_root(&proof.execution_hash);
        if proof.audit_root != expected {
            return Err(IntegrityError::HashMismatch {
                expected,
                actual: proof.audit_root.clone(),
            }
            .into());
        }
        Ok(())
    }

    pub fn get_proof(&self, proof_id: &str) -> Option<&ExecutionProof> {
        self.proofs.get(proof_id)
    }
}
