//! State hash consensus.
//!
//! Nodes submit the state hash they computed for an execution; consensus
//! holds when the agreement ratio of the majority hash reaches the required
//! threshold. Disagreeing nodes are named so the operator can investigate a
//! divergent replay.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::PROTOCOL_VERSION;

/// One node's reported state hash for one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedStateHash {
    pub execution_id: String,
    pub node_id: String,
    pub hash_value: String,
    pub timestamp: String,
    pub protocol_version: String,
}

/// Result of a consensus check over one execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub agreed: bool,
    pub agreed_hash: Option<String>,
    pub disagreeing_nodes: Vec<String>,
    pub timestamp: String,
    pub protocol_version: String,
}

/// Collects per-node state hashes and checks agreement.
#[derive(Debug)]
pub struct StateHashConsensus {
    clock: SharedClock,
    required_agreement: f64,
    /// (execution_id, node_id) -> submission.
    submissions: HashMap<(String, String), SubmittedStateHash>,
}

impl StateHashConsensus {
    /// `required_agreement` is a ratio in (0, 1]; 1.0 demands unanimity.
    pub fn new(required_agreement: f64, clock: SharedClock) -> Self {
        Self {
            clock,
            required_agreement: required_agreement.clamp(0.0, 1.0),
            submissions: HashMap::new(),
        }
    }

    /// Record (or replace) a node's hash for an execution.
    pub fn submit_hash(&mut self, execution_id: &str, node_id: &str, hash_value: String) {
        let submission = SubmittedStateHash {
            execution_id: execution_id.to_string(),
            node_id: node_id.to_string(),
            hash_value,
            timestamp: self.clock.timestamp(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        self.submissions.insert(
            (execution_id.to_string(), node_id.to_string()),
            submission,
        );
    }

    /// Check whether the nodes agree on the execution's state hash.
    pub fn check_consensus(&self, execution_id: &str) -> ConsensusResult {
        let submissions: Vec<&SubmittedStateHash> = self
            .submissions
            .values()
            .filter(|s| s.execution_id == execution_id)
            .collect();

        if submissions.is_empty() {
            return ConsensusResult {
                agreed: false,
                agreed_hash: None,
                disagreeing_nodes: Vec::new(),
                timestamp: self.clock.timestamp(),
                protocol_version: PROTOCOL_VERSION.to_string(),
            };
        }

        // hash -> sorted node ids reporting it; BTreeMap keeps tie-breaking
        // deterministic
        let mut by_hash: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for submission in &submissions {
            by_hash
                .entry(submission.hash_value.as_str())
                .or_default()
                .push(submission.node_id.as_str());
        }

        // ascending iteration + strictly-greater keeps the smallest hash on
        // ties, so the winner is deterministic
        let mut majority_hash: &str = "";
        let mut majority_count = 0usize;
        for (hash, nodes) in &by_hash {
            if nodes.len() > majority_count {
                majority_count = nodes.len();
                majority_hash = *hash;
            }
        }

        let agreement = majority_count as f64 / submissions.len() as f64;
        let agreed = agreement >= self.required_agreement;

        let mut disagreeing: Vec<String> = by_hash
            .iter()
            .filter(|(hash, _)| **hash != majority_hash)
            .flat_map(|(_, nodes)| nodes.iter().map(|n| n.to_string()))
            .collect();
        disagreeing.sort();

        ConsensusResult {
            agreed,
            agreed_hash: agreed.then(|| majority_hash.to_string()),
            disagreeing_nodes: disagreeing,
            timestamp: self.clock.timestamp(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Drop all submissions for an execution.
    pub fn clear_execution(&mut self, execution_id: &str) {
        self.submissions
            .retain(|(exec_id, _), _| exec_id != execution_id);
    }
}
