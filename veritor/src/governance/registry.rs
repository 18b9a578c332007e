//! Capability registry.
//!
//! The authoritative list of capabilities a deployment knows about, keyed by
//! capability id (`namespace:action[:scope]`). Registration is explicit and
//! duplicate registration is a hard error; issuance and planning consult the
//! stored risk metadata.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::errors::{FabricResult, RegistrationFailed};
use crate::PROTOCOL_VERSION;

/// Metadata attached to a registered capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityMetadata {
    pub name: String,
    pub description: String,
    pub category: String,
    /// 1 (lowest) ..= 5 (highest). Risk >= 3 routes through human approval.
    pub risk_level: u8,
    pub protocol_version: String,
    pub created_at: DateTime<Utc>,
}

impl CapabilityMetadata {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        category: impl Into<String>,
        risk_level: u8,
        clock: &SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            category: category.into(),
            risk_level: risk_level.clamp(1, 5),
            protocol_version: PROTOCOL_VERSION.to_string(),
            created_at: clock.now(),
        }
    }
}

/// In-memory capability registry. Owned by the node or the control plane and
/// mutated under a single-writer discipline; wrap in `Arc<RwLock<_>>` when
/// shared.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    capabilities: HashMap<String, CapabilityMetadata>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a capability. Fails if the id is already present.
    pub fn register(
        &mut self,
        capability_id: impl Into<String>,
        metadata: CapabilityMetadata,
    ) -> FabricResult<()> {
        let capability_id = capability_id.into();
        if self.capabilities.contains_key(&capability_id) {
            return Err(RegistrationFailed::AlreadyRegistered { capability_id }.into());
        }
        log::debug!(
            "[registry] registered capability {} (risk {})",
            capability_id,
            metadata.risk_level
        );
        self.capabilities.insert(capability_id, metadata);
        Ok(())
    }

    pub fn get_metadata(&self, capability_id: &str) -> Option<&CapabilityMetadata> {
        self.capabilities.get(capability_id)
    }

    /// All registered capability ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.capabilities.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn unregister(&mut self, capability_id: &str) -> bool {
        self.capabilities.remove(capability_id).is_some()
    }

    pub fn contains(&self, capability_id: &str) -> bool {
        self.capabilities.contains_key(capability_id)
    }

    /// Highest risk level among the given capability ids. Unknown ids count
    /// at the maximum so unregistered capabilities are never treated as safe.
    pub fn max_risk_level(&self, capability_ids: impl IntoIterator<Item = impl AsRef<str>>) -> u8 {
        let mut max = 1;
        for id in capability_ids {
            let risk = self
                .capabilities
                .get(id.as_ref())
                .map(|m| m.risk_level)
                .unwrap_or(5);
            max = max.max(risk);
        }
        max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;
    use crate::clock::SharedClock;

    fn clock() -> SharedClock {
        fixed_clock()
    }

    #[test]
    fn duplicate_registration_fails() {
        let clock = clock();
        let mut registry = CapabilityRegistry::new();
        let meta = CapabilityMetadata::new("Read", "read files", "fs", 1, &clock);
        registry.register("fs:read", meta.clone()).unwrap();

        let err = registry.register("fs:read", meta).unwrap_err();
        assert_eq!(err.kind(), "registration_failed");
    }

    #[test]
    fn list_is_sorted() {
        let clock = clock();
        let mut registry = CapabilityRegistry::new();
        for id in ["net:http", "fs:read", "os:process"] {
            registry
                .register(id, CapabilityMetadata::new(id, "", "core", 2, &clock))
                .unwrap();
        }
        assert_eq!(registry.list(), vec!["fs:read", "net:http", "os:process"]);
    }

    #[test]
    fn unknown_capability_is_max_risk() {
        let registry = CapabilityRegistry::new();
        assert_eq!(registry.max_risk_level(["ghost:cap"]), 5);
    }
}
