//! Audit event model.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::{canonical_json, sha256_hex};
use crate::PROTOCOL_VERSION;

/// The event vocabulary of the fabric core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    CapabilityIssued,
    CapabilityVerified,
    CapabilityDenied,
    CapabilityRevoked,
    PlanBuilt,
    StepStarted,
    StepCompleted,
    StepFailed,
    QuotaExceeded,
    ExecutionStarted,
    ExecutionCompleted,
    RollbackExecuted,
    ApprovalRequested,
    ApprovalGranted,
    ApprovalDenied,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::CapabilityIssued => "capability_issued",
            AuditEventType::CapabilityVerified => "capability_verified",
            AuditEventType::CapabilityDenied => "capability_denied",
            AuditEventType::CapabilityRevoked => "capability_revoked",
            AuditEventType::PlanBuilt => "plan_built",
            AuditEventType::StepStarted => "step_started",
            AuditEventType::StepCompleted => "step_completed",
            AuditEventType::StepFailed => "step_failed",
            AuditEventType::QuotaExceeded => "quota_exceeded",
            AuditEventType::ExecutionStarted => "execution_started",
            AuditEventType::ExecutionCompleted => "execution_completed",
            AuditEventType::RollbackExecuted => "rollback_executed",
            AuditEventType::ApprovalRequested => "approval_requested",
            AuditEventType::ApprovalGranted => "approval_granted",
            AuditEventType::ApprovalDenied => "approval_denied",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One audit event, canonically encodable for hashing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub details: Value,
    pub agent_id: Option<String>,
    pub timestamp: String,
    pub protocol_version: String,
}

impl AuditEvent {
    pub fn new(
        event_type: AuditEventType,
        details: Value,
        agent_id: Option<String>,
        timestamp: String,
    ) -> Self {
        Self {
            event_type,
            details,
            agent_id,
            timestamp,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    fn canonical_value(&self) -> Value {
        json!({
            "event_type": self.event_type.as_str(),
            "details": self.details,
            "agent_id": self.agent_id,
            "timestamp": self.timestamp,
            "protocol_version": self.protocol_version,
        })
    }

    pub fn to_canonical(&self) -> String {
        canonical_json(&self.canonical_value())
    }

    /// Merkle leaf: SHA-256 of the canonical event encoding.
    pub fn leaf_hash(&self) -> String {
        sha256_hex(self.to_canonical().as_bytes())
    }
}
