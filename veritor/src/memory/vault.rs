//! Memory vault.
//!
//! Immutable, hash-addressed storage for agent memory. Retrieval is gated by
//! the snapshot's required capabilities; integrity is re-checkable at any
//! time by recomputing the content hash. Stores for a given agent are
//! serialized by the owner; retrieves read immutable snapshots.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{hash_value, short_id};
use crate::clock::SharedClock;
use crate::errors::IntegrityError;
use crate::PROTOCOL_VERSION;

/// Immutable content-addressed memory snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub snapshot_id: String,
    pub agent_id: String,
    pub data: Value,
    pub required_capabilities: BTreeSet<String>,
    pub data_hash: String,
    pub created_at: String,
    pub protocol_version: String,
}

/// Hash-addressed vault for agent memory.
#[derive(Debug)]
pub struct MemoryVault {
    clock: SharedClock,
    snapshots: HashMap<String, MemorySnapshot>,
    agent_snapshots: HashMap<String, Vec<String>>,
}

impl MemoryVault {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            snapshots: HashMap::new(),
            agent_snapshots: HashMap::new(),
        }
    }

    /// Store data and return the immutable snapshot.
    pub fn store(
        &mut self,
        agent_id: &str,
        data: Value,
        required_capabilities: BTreeSet<String>,
    ) -> MemorySnapshot {
        let data_hash = hash_value(&data);
        let created_at = self.clock.timestamp();
        let snapshot_id = short_id(&format!("{}:{}:{}", agent_id, data_hash, created_at));

        let snapshot = MemorySnapshot {
            snapshot_id: snapshot_id.clone(),
            agent_id: agent_id.to_string(),
            data,
            required_capabilities,
            data_hash,
            created_at,
            protocol_version: PROTOCOL_VERSION.to_string(),
        };

        self.snapshots.insert(snapshot_id.clone(), snapshot.clone());
        self.agent_snapshots
            .entry(agent_id.to_string())
            .or_default()
            .push(snapshot_id);
        snapshot
    }

    /// Retrieve a snapshot iff the caller's capabilities cover the
    /// snapshot's requirements.
    pub fn retrieve(
        &self,
        snapshot_id: &str,
        capabilities: &BTreeSet<String>,
    ) -> Option<&MemorySnapshot> {
        let snapshot = self.snapshots.get(snapshot_id)?;
        if snapshot.required_capabilities.is_subset(capabilities) {
            Some(snapshot)
        } else {
            None
        }
    }

    pub fn agent_snapshots(&self, agent_id: &str) -> Vec<String> {
        self.agent_snapshots.get(agent_id).cloned().unwrap_or_default()
    }

    /// Recompute the content hash and compare with the stored one.
    pub fn verify_integrity(&self, snapshot_id: &str) -> Result<(), IntegrityError> {
        let snapshot = self.snapshots.get(snapshot_id).ok_or_else(|| {
            IntegrityError::TamperedSnapshot {
                snapshot_id: snapshot_id.to_string(),
            }
        })?;
        let computed = hash_value(&snapshot.data);
        if computed != snapshot.data_hash {
            return Err(IntegrityError::HashMismatch {
                expected: snapshot.data_hash.clone(),
                actual: computed,
            });
        }
        Ok(())
    }

    pub fn detect_tampering(&self, snapshot_id: &str) -> bool {
        self.verify_integrity(snapshot_id).is_err()
    }

    /// Return the stored data when the snapshot verifies.
    pub fn reconstruct(&self, snapshot_id: &str) -> Option<Value> {
        self.verify_integrity(snapshot_id).ok()?;
        self.snapshots.get(snapshot_id).map(|s| s.data.clone())
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }
}
