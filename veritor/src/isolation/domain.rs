//! Execution domain.
//!
//! A cryptographically identified execution scope for one tenant. Frozen
//! after creation; the state hash deliberately excludes node identity so the
//! same plan in the same domain yields the same hash on any node.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical::{hash_value, short_id};
use crate::errors::DomainViolation;
use crate::isolation::capability_matches;
use crate::PROTOCOL_VERSION;

/// Immutable execution domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionDomain {
    pub domain_id: String,
    pub tenant_id: String,
    pub capabilities: BTreeSet<String>,
    pub state_hash: String,
    pub protocol_version: String,
}

impl ExecutionDomain {
    /// Create a domain, computing its state hash at construction.
    pub fn new(
        domain_id: impl Into<String>,
        tenant_id: impl Into<String>,
        capabilities: BTreeSet<String>,
    ) -> Result<Self, DomainViolation> {
        let domain_id = domain_id.into();
        let tenant_id = tenant_id.into();
        if domain_id.is_empty() {
            return Err(DomainViolation::InvalidDomain {
                reason: "domain_id is required".into(),
            });
        }
        if tenant_id.is_empty() {
            return Err(DomainViolation::InvalidDomain {
                reason: "tenant_id is required".into(),
            });
        }

        let mut domain = Self {
            domain_id,
            tenant_id,
            capabilities,
            state_hash: String::new(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        domain.state_hash = domain.compute_state_hash();
        Ok(domain)
    }

    /// Domain for one (tenant, contract) pair with a deterministic id, so a
    /// replay on a different node rebuilds the identical domain.
    pub fn for_contract(
        tenant_id: &str,
        contract_id: &str,
        capabilities: BTreeSet<String>,
    ) -> Result<Self, DomainViolation> {
        let domain_id = short_id(&format!("{}:{}", tenant_id, contract_id));
        Self::new(domain_id, tenant_id, capabilities)
    }

    /// Deterministic state hash. Excludes node identity by construction.
    pub fn compute_state_hash(&self) -> String {
        hash_value(&json!({
            "domain_id": self.domain_id,
            "tenant_id": self.tenant_id,
            "capabilities": self.capabilities.iter().collect::<Vec<_>>(),
            "protocol_version": self.protocol_version,
        }))
    }

    /// Check a capability against the domain's set, resolving glob patterns.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities
            .iter()
            .any(|pattern| capability_matches(pattern, capability))
    }

    pub fn validate_tenant(&self, tenant_id: &str) -> bool {
        self.tenant_id == tenant_id
    }

    /// Well-formedness check used as the sandbox's first precondition.
    pub fn validate(&self) -> Result<(), DomainViolation> {
        if self.domain_id.is_empty() || self.tenant_id.is_empty() {
            return Err(DomainViolation::InvalidDomain {
                reason: "domain_id and tenant_id are required".into(),
            });
        }
        Ok(())
    }
}
