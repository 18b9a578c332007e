//! Memory seals.
//!
//! An HMAC over `(agent_id, data_hash)` binds a memory payload to its agent.
//! A mutated payload or a swapped seal id both fail verification; the
//! comparison is constant time.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::{hash_value, hmac_sign, hmac_verify, short_id};
use crate::clock::SharedClock;
use crate::config::SecretKey;
use crate::PROTOCOL_VERSION;

/// Immutable cryptographic seal over a memory payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMemory {
    pub seal_id: String,
    pub agent_id: String,
    pub data_hash: String,
    pub signature: String,
    pub created_at: String,
    pub protocol_version: String,
}

/// Creates and verifies memory seals under one secret key.
pub struct MemorySeal {
    secret: SecretKey,
    clock: SharedClock,
    seals: HashMap<String, SealedMemory>,
}

impl std::fmt::Debug for MemorySeal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySeal")
            .field("seals", &self.seals.len())
            .finish()
    }
}

impl MemorySeal {
    pub fn new(secret: SecretKey, clock: SharedClock) -> Self {
        Self {
            secret,
            clock,
            seals: HashMap::new(),
        }
    }

    /// Seal a payload for an agent.
    pub fn seal(&mut self, agent_id: &str, data: &Value) -> SealedMemory {
        let data_hash = hash_value(data);
        let signature = self.sign(agent_id, &data_hash);
        let created_at = self.clock.timestamp();
        let seal_id = short_id(&format!("{}:{}:{}", agent_id, data_hash, created_at));

        let sealed = SealedMemory {
            seal_id: seal_id.clone(),
            agent_id: agent_id.to_string(),
            data_hash,
            signature,
            created_at,
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        self.seals.insert(seal_id, sealed.clone());
        sealed
    }

    /// Verify a payload against a stored seal. False for unknown seals,
    /// hash mismatches, or signature mismatches.
    pub fn verify(&self, seal_id: &str, data: &Value) -> bool {
        let sealed = match self.seals.get(seal_id) {
            Some(sealed) => sealed,
            None => return false,
        };
        if hash_value(data) != sealed.data_hash {
            return false;
        }
        let message = format!("{}:{}", sealed.agent_id, sealed.data_hash);
        hmac_verify(self.secret.as_bytes(), message.as_bytes(), &sealed.signature)
    }

    pub fn detect_tampering(&self, seal_id: &str, data: &Value) -> bool {
        !self.verify(seal_id, data)
    }

    /// Return the payload when the seal verifies.
    pub fn reconstruct(&self, seal_id: &str, data: &Value) -> Option<Value> {
        if self.verify(seal_id, data) {
            Some(data.clone())
        } else {
            None
        }
    }

    pub fn seal_count(&self) -> usize {
        self.seals.len()
    }

    pub fn agent_seals(&self, agent_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .seals
            .values()
            .filter(|s| s.agent_id == agent_id)
            .map(|s| s.seal_id.clone())
            .collect();
        ids.sort();
        ids
    }

    fn sign(&self, agent_id: &str, data_hash: &str) -> String {
        let message = format!("{}:{}", agent_id, data_hash);
        hmac_sign(self.secret.as_bytes(), message.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;
    use serde_json::json;

    fn sealer() -> MemorySeal {
        MemorySeal::new(SecretKey::from_bytes(b"seal-secret".to_vec()), fixed_clock())
    }

    #[test]
    fn seal_then_verify_round_trip() {
        let mut sealer = sealer();
        let data = json!({"memo": "classified"});
        let sealed = sealer.seal("agent-1", &data);

        assert!(sealer.verify(&sealed.seal_id, &data));
        assert!(!sealer.verify(&sealed.seal_id, &json!({"memo": "altered"})));
    }

    #[test]
    fn swapped_seal_id_fails() {
        let mut sealer = sealer();
        let first = sealer.seal("agent-1", &json!({"v": 1}));
        let second = sealer.seal("agent-1", &json!({"v": 2}));

        assert!(sealer.detect_tampering(&first.seal_id, &json!({"v": 2})));
        assert!(sealer.detect_tampering(&second.seal_id, &json!({"v": 1})));
        assert!(sealer.detect_tampering("unknown-seal", &json!({"v": 1})));
    }

    #[test]
    fn reconstruct_only_when_valid() {
        let mut sealer = sealer();
        let data = json!({"k": true});
        let sealed = sealer.seal("agent-1", &data);

        assert_eq!(sealer.reconstruct(&sealed.seal_id, &data), Some(data.clone()));
        assert_eq!(sealer.reconstruct(&sealed.seal_id, &json!({"k": false})), None);
    }

    #[test]
    fn agent_seal_index() {
        let mut sealer = sealer();
        sealer.seal("agent-1", &json!(1));
        sealer.seal("agent-2", &json!(2));
        assert_eq!(sealer.agent_seals("agent-1").len(), 1);
        assert_eq!(sealer.seal_count(), 2);
    }
}
