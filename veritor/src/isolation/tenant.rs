//! Tenant context.
//!
//! Immutable record of a tenant's identity, issued capabilities and
//! execution budget. The context itself never changes; consumption happens
//! through a mutable [`QuotaTracker`] emitted on request.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::errors::QuotaExceeded;
use crate::isolation::capability_matches;
use crate::PROTOCOL_VERSION;

/// Immutable multi-tenant security context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantContext {
    pub tenant_id: String,
    pub domain_id: String,
    pub issued_capabilities: BTreeSet<String>,
    pub execution_quota: u64,
    pub protocol_version: String,
}

impl TenantContext {
    pub fn new(
        tenant_id: impl Into<String>,
        domain_id: impl Into<String>,
        issued_capabilities: BTreeSet<String>,
        execution_quota: u64,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            domain_id: domain_id.into(),
            issued_capabilities,
            execution_quota,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Check an issued capability, resolving glob patterns.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.issued_capabilities
            .iter()
            .any(|pattern| capability_matches(pattern, capability))
    }

    /// Emit a mutable tracker over this tenant's execution budget.
    pub fn create_quota_tracker(&self) -> QuotaTracker {
        QuotaTracker {
            tenant_id: self.tenant_id.clone(),
            total_quota: self.execution_quota,
            consumed: 0,
        }
    }
}

/// Mutable consumption tracker for a tenant's execution budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaTracker {
    pub tenant_id: String,
    pub total_quota: u64,
    consumed: u64,
}

impl QuotaTracker {
    /// Consume budget; fails without consuming when the request exceeds what
    /// remains.
    pub fn consume(&mut self, amount: u64) -> Result<u64, QuotaExceeded> {
        if self.consumed + amount > self.total_quota {
            return Err(QuotaExceeded::TenantBudget {
                requested: amount,
                remaining: self.remaining(),
            });
        }
        self.consumed += amount;
        Ok(self.consumed)
    }

    pub fn remaining(&self) -> u64 {
        self.total_quota - self.consumed
    }

    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn reset(&mut self) {
        self.consumed = 0;
    }
}
