//! Isolation enforcer.
//!
//! Runtime checks at the tenant and domain boundaries: no cross-tenant
//! execution, no cross-domain access, no implicit escalation, and replay
//! results must be bit-identical. Every decision is appended to an
//! enforcement log for later inspection.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical::hash_value;
use crate::clock::SharedClock;
use crate::errors::{DomainViolation, IntegrityError};
use crate::isolation::capability_domain::CapabilityDomain;
use crate::isolation::domain::ExecutionDomain;
use crate::isolation::tenant::TenantContext;
use crate::PROTOCOL_VERSION;

/// One recorded enforcement decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnforcementEntry {
    pub timestamp: String,
    pub enforcement_type: String,
    pub source: String,
    pub target: String,
    pub allowed: bool,
    pub protocol_version: String,
}

/// Enforces isolation between tenants and domains.
#[derive(Debug)]
pub struct IsolationEnforcer {
    clock: SharedClock,
    log: Vec<EnforcementEntry>,
}

impl IsolationEnforcer {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            log: Vec::new(),
        }
    }

    /// A tenant may only execute in its own domain.
    pub fn enforce_tenant_isolation(
        &mut self,
        tenant: &TenantContext,
        domain: &ExecutionDomain,
    ) -> Result<(), DomainViolation> {
        let allowed = tenant.tenant_id == domain.tenant_id;
        self.record("tenant_isolation", &tenant.tenant_id, &domain.domain_id, allowed);
        if !allowed {
            return Err(DomainViolation::TenantMismatch {
                tenant_id: tenant.tenant_id.clone(),
                domain_id: domain.domain_id.clone(),
                domain_tenant: domain.tenant_id.clone(),
            });
        }
        Ok(())
    }

    /// A capability must sit inside the domain boundary to be usable.
    pub fn enforce_domain_boundary(
        &mut self,
        capability_domain: &CapabilityDomain,
        capability: &str,
    ) -> bool {
        let allowed = capability_domain.validate_capability_scope(capability);
        self.record(
            "domain_boundary",
            &capability_domain.domain_id,
            capability,
            allowed,
        );
        allowed
    }

    pub fn prevent_cross_tenant_execution(
        &mut self,
        tenant_a: &TenantContext,
        tenant_b: &TenantContext,
    ) -> Result<(), DomainViolation> {
        if tenant_a.tenant_id != tenant_b.tenant_id {
            self.record(
                "cross_tenant",
                &tenant_a.tenant_id,
                &tenant_b.tenant_id,
                false,
            );
            return Err(DomainViolation::CrossTenant {
                from: tenant_a.tenant_id.clone(),
                to: tenant_b.tenant_id.clone(),
            });
        }
        Ok(())
    }

    pub fn enforce_cross_domain_isolation(
        &mut self,
        domain_a: &ExecutionDomain,
        domain_b: &ExecutionDomain,
    ) -> Result<(), DomainViolation> {
        if domain_a.domain_id != domain_b.domain_id {
            self.record("cross_domain", &domain_a.domain_id, &domain_b.domain_id, false);
            return Err(DomainViolation::CrossDomain {
                from: domain_a.domain_id.clone(),
                to: domain_b.domain_id.clone(),
            });
        }
        Ok(())
    }

    /// Escalation is allowed only when the capability domain explicitly
    /// permits it — which it never does by default.
    pub fn enforce_escalation_prevention(
        &mut self,
        capability_domain: &CapabilityDomain,
        current: &str,
        target: &str,
    ) -> Result<(), DomainViolation> {
        if !capability_domain.can_escalate_to(target) {
            self.record("escalation", current, target, false);
            return Err(DomainViolation::CrossDomain {
                from: current.to_string(),
                to: target.to_string(),
            });
        }
        Ok(())
    }

    /// Replay must reproduce the execution bit-for-bit once volatile fields
    /// are stripped.
    pub fn verify_replay_identity(
        &mut self,
        domain: &ExecutionDomain,
        execution: &Value,
        replay: &Value,
    ) -> Result<(), IntegrityError> {
        let execution_hash = hash_value(&strip_volatile(execution));
        let replay_hash = hash_value(&strip_volatile(replay));
        let allowed = execution_hash == replay_hash;
        self.record("replay_identity", &domain.domain_id, &execution_hash, allowed);
        if !allowed {
            return Err(IntegrityError::ReplayDivergence {
                execution_hash,
                replay_hash,
            });
        }
        Ok(())
    }

    pub fn enforcement_log(&self) -> &[EnforcementEntry] {
        &self.log
    }

    fn record(&mut self, enforcement_type: &str, source: &str, target: &str, allowed: bool) {
        if !allowed {
            log::warn!(
                "[isolation] {} blocked: {} -> {}",
                enforcement_type,
                source,
                target
            );
        }
        self.log.push(EnforcementEntry {
            timestamp: self.clock.timestamp(),
            enforcement_type: enforcement_type.to_string(),
            source: source.to_string(),
            target: target.to_string(),
            allowed,
            protocol_version: PROTOCOL_VERSION.to_string(),
        });
    }
}

/// Drop keys prefixed with `_` — the convention for volatile, per-run
/// metadata that must not participate in replay comparison.
fn strip_volatile(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !k.starts_with('_'))
                .map(|(k, v)| (k.clone(), strip_volatile(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_volatile).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn tenant(id: &str) -> TenantContext {
        TenantContext::new(id, format!("domain-{}", id), BTreeSet::new(), 10)
    }

    fn domain(id: &str, tenant: &str) -> ExecutionDomain {
        ExecutionDomain::new(id, tenant, BTreeSet::new()).unwrap()
    }

    #[test]
    fn cross_tenant_execution_is_blocked() {
        let mut enforcer = IsolationEnforcer::new(fixed_clock());
        let err = enforcer
            .enforce_tenant_isolation(&tenant("a"), &domain("d-b", "b"))
            .unwrap_err();
        assert!(matches!(err, DomainViolation::TenantMismatch { .. }));
        assert!(!enforcer.enforcement_log()[0].allowed);
    }

    #[test]
    fn replay_identity_ignores_volatile_fields() {
        let mut enforcer = IsolationEnforcer::new(fixed_clock());
        let domain = domain("d1", "a");
        let execution = json!({"result": 1, "_node_id": "n0", "_elapsed_ms": 12});
        let replay = json!({"result": 1, "_node_id": "n1", "_elapsed_ms": 48});
        enforcer
            .verify_replay_identity(&domain, &execution, &replay)
            .unwrap();

        let diverged = json!({"result": 2, "_node_id": "n1"});
        let err = enforcer
            .verify_replay_identity(&domain, &execution, &diverged)
            .unwrap_err();
        assert!(matches!(err, IntegrityError::ReplayDivergence { .. }));
    }

    #[test]
    fn escalation_is_always_blocked_by_default() {
        let mut enforcer = IsolationEnforcer::new(fixed_clock());
        let cd = CapabilityDomain::new("cd", BTreeSet::new(), None);
        assert!(enforcer
            .enforce_escalation_prevention(&cd, "fs:read", "os:process")
            .is_err());
    }
}
