//! Capability domain.
//!
//! Scope boundary for a capability set, optionally bound to a tenant.
//! Prevents capability reuse between tenants and forbids escalation across
//! the boundary — escalation is never implicit.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::isolation::capability_matches;
use crate::PROTOCOL_VERSION;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDomain {
    pub domain_id: String,
    pub allowed_capabilities: BTreeSet<String>,
    pub tenant_id: Option<String>,
    pub protocol_version: String,
}

impl CapabilityDomain {
    pub fn new(
        domain_id: impl Into<String>,
        allowed_capabilities: BTreeSet<String>,
        tenant_id: Option<String>,
    ) -> Self {
        Self {
            domain_id: domain_id.into(),
            allowed_capabilities,
            tenant_id,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Is the capability within this domain's scope.
    pub fn validate_capability_scope(&self, capability: &str) -> bool {
        self.allowed_capabilities
            .iter()
            .any(|pattern| capability_matches(pattern, capability))
    }

    /// Alias used by callers phrased around boundaries.
    pub fn is_within_boundary(&self, capability: &str) -> bool {
        self.validate_capability_scope(capability)
    }

    /// Escalation is never allowed implicitly, whatever the target.
    pub fn can_escalate_to(&self, _target_capability: &str) -> bool {
        false
    }

    /// Capabilities visible to a tenant: the full set for the owning tenant
    /// (or for unbound domains), nothing for anyone else.
    pub fn capabilities_for_tenant(&self, tenant_id: &str) -> BTreeSet<String> {
        match &self.tenant_id {
            Some(owner) if owner != tenant_id => BTreeSet::new(),
            _ => self.allowed_capabilities.clone(),
        }
    }

    pub fn validate_tenant_access(&self, tenant_id: &str) -> bool {
        match &self.tenant_id {
            Some(owner) => owner == tenant_id,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn scope_validation_with_globs() {
        let domain = CapabilityDomain::new("cd1", caps(&["fs:read:/workspace/**"]), None);
        assert!(domain.validate_capability_scope("fs:read:/workspace/file.txt"));
        assert!(!domain.validate_capability_scope("fs:read:/etc/shadow"));
    }

    #[test]
    fn escalation_is_never_implicit() {
        let domain = CapabilityDomain::new("cd1", caps(&["fs:*"]), None);
        assert!(!domain.can_escalate_to("os:process"));
        assert!(!domain.can_escalate_to("fs:read"));
    }

    #[test]
    fn foreign_tenant_sees_nothing() {
        let domain =
            CapabilityDomain::new("cd1", caps(&["fs:read"]), Some("tenant-a".to_string()));
        assert!(domain.capabilities_for_tenant("tenant-b").is_empty());
        assert_eq!(domain.capabilities_for_tenant("tenant-a"), caps(&["fs:read"]));
        assert!(!domain.validate_tenant_access("tenant-b"));
    }
}
