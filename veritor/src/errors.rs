//! Error taxonomy for the execution fabric.
//!
//! Errors are values, not control flow: every denial, violation or integrity
//! failure is a typed variant that callers surface in structured results and
//! emit into the audit chain. The fabric recovers locally only from
//! registration failures (rollback) and pending approvals (parking); nothing
//! is ever silently downgraded to success.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type FabricResult<T> = Result<T, FabricError>;

/// Capability denials. Always fail closed, never retried by the core.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    #[error("missing capability: {capability}")]
    Missing { capability: String },

    #[error("capability {capability} out of scope for domain {domain_id}")]
    ScopeViolation {
        capability: String,
        domain_id: String,
    },

    #[error("unknown capability: {capability}")]
    Unknown { capability: String },

    #[error("token {token_id} revoked: {reason}")]
    Revoked { token_id: String, reason: String },

    #[error("token {token_id} expired")]
    Expired { token_id: String },

    #[error("token {token_id} signature mismatch")]
    SignatureMismatch { token_id: String },

    #[error("token {token_id} issued by {issuer_id}, not accepted here")]
    IssuerMismatch { token_id: String, issuer_id: String },

    #[error("token {token_id} bound to agent {bound_agent}, presented by {presenting_agent}")]
    AgentMismatch {
        token_id: String,
        bound_agent: String,
        presenting_agent: String,
    },

    #[error("no capabilities provided: zero implicit permissions")]
    NoCapabilities,
}

/// Quota violations. Terminal: the remaining steps of an execution are
/// skipped and the result reports the first violation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QuotaExceeded {
    #[error("max steps exceeded: {used} of {limit}")]
    Steps { used: u64, limit: u64 },

    #[error("wall-time budget exceeded: {elapsed_ms}ms of {limit_ms}ms")]
    Time { elapsed_ms: u64, limit_ms: u64 },

    #[error("max capability calls exceeded: {used} of {limit}")]
    CapabilityCalls { used: u64, limit: u64 },

    #[error("cpu quota exceeded: requested {requested}s, available {available}s")]
    Cpu { requested: u64, available: u64 },

    #[error("memory quota exceeded: requested {requested_mb}MB, available {available_mb}MB")]
    Memory {
        requested_mb: u64,
        available_mb: u64,
    },

    #[error("tenant execution quota exceeded: requested {requested}, remaining {remaining}")]
    TenantBudget { requested: u64, remaining: u64 },
}

/// Cross-tenant or cross-domain access attempts. Raise and abort.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainViolation {
    #[error("tenant {tenant_id} cannot execute in domain {domain_id} (owned by {domain_tenant})")]
    TenantMismatch {
        tenant_id: String,
        domain_id: String,
        domain_tenant: String,
    },

    #[error("cross-tenant execution blocked: {from} cannot execute as {to}")]
    CrossTenant { from: String, to: String },

    #[error("cross-domain access blocked: {from} cannot access {to}")]
    CrossDomain { from: String, to: String },

    #[error("invalid execution domain: {reason}")]
    InvalidDomain { reason: String },
}

/// Hash or signature mismatches. Require operator intervention.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityError {
    #[error("hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("seal {seal_id} failed verification")]
    SealMismatch { seal_id: String },

    #[error("snapshot {snapshot_id} has been tampered with")]
    TamperedSnapshot { snapshot_id: String },

    #[error("chain hash drift: {context}")]
    ChainDrift { context: String },

    #[error("replay divergence: execution {execution_hash} != replay {replay_hash}")]
    ReplayDivergence {
        execution_hash: String,
        replay_hash: String,
    },

    #[error("i/o failure affecting hash input: {0}")]
    Io(String),
}

/// Malformed or mismatched wire traffic. Refuse to process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: String, actual: String },

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },

    #[error("runtime contract is required for execution")]
    ContractRequired,

    #[error("handshake rejected: {reason}")]
    HandshakeRejected { reason: String },
}

/// Skill or node registration refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationFailed {
    #[error("capability already registered: {capability_id}")]
    AlreadyRegistered { capability_id: String },

    #[error("node already registered: {node_id}")]
    DuplicateNode { node_id: String },

    #[error("skill registration refused: {name}: {reason}")]
    SkillRejected { name: String, reason: String },
}

/// Severity attached to a policy violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Error,
    Critical,
}

/// The classes of policy violation the engine reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyViolationKind {
    MissingCapabilities,
    ScopeExceeded,
    DependencyCycle,
    ImplicitEscalation,
    ForbiddenAction,
    RiskTooHigh,
    PlanTruncated,
}

/// A single finding from policy evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub kind: PolicyViolationKind,
    pub severity: Severity,
    pub description: String,
    pub context: serde_json::Value,
}

impl PolicyViolation {
    pub fn new(
        kind: PolicyViolationKind,
        severity: Severity,
        description: impl Into<String>,
        context: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            severity,
            description: description.into(),
            context,
        }
    }
}

impl std::fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description)
    }
}

/// Top-level fabric error, the union of the taxonomy.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FabricError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("policy violation: {0}")]
    Policy(PolicyViolation),

    #[error(transparent)]
    Quota(#[from] QuotaExceeded),

    #[error(transparent)]
    Domain(#[from] DomainViolation),

    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("approval denied for request {request_id}: {reason}")]
    ApprovalDenied { request_id: String, reason: String },

    #[error("approval pending for request {request_id}")]
    ApprovalPending { request_id: String },

    #[error(transparent)]
    Registration(#[from] RegistrationFailed),

    #[error("execution cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl FabricError {
    /// Stable snake_case kind string carried in result envelopes and audit
    /// event details.
    pub fn kind(&self) -> &'static str {
        match self {
            FabricError::Capability(_) => "capability_error",
            FabricError::Policy(_) => "policy_violation",
            FabricError::Quota(_) => "quota_exceeded",
            FabricError::Domain(_) => "domain_violation",
            FabricError::Integrity(_) => "integrity_error",
            FabricError::Protocol(_) => "protocol_error",
            FabricError::ApprovalDenied { .. } => "approval_denied",
            FabricError::ApprovalPending { .. } => "approval_pending",
            FabricError::Registration(_) => "registration_failed",
            FabricError::Cancelled => "cancelled",
            FabricError::Config(_) => "config_error",
        }
    }
}
