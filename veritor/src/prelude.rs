//! Convenience re-exports for fabric consumers.

pub use crate::approval::{
    ApprovalChannel, ApprovalDecision, ApprovalGate, ApprovalRequest, ApprovalStatus, GateOutcome,
};
pub use crate::audit::{AuditChain, AuditEvent, AuditEventType, AuditSink, Subscription};
pub use crate::canonical::{canonical_json, hash_value, sha256_hex, short_id};
pub use crate::clock::{fixed_clock, system_clock, Clock, FixedClock, SharedClock, SystemClock};
pub use crate::cluster::{
    ClusterSchedule, ClusterScheduler, DistributedExecutionDomain, FederatedAuditCoordinator,
    MembershipAuthority, ScheduledTask, StateHashConsensus, TrustedNodeDescriptor,
};
pub use crate::config::{NodeConfig, QuotaConfig, SecretKey};
pub use crate::control::{ControlApi, ProvenanceRecord, ProvenanceRegistry, SubmissionReceipt};
pub use crate::errors::{
    CapabilityError, DomainViolation, FabricError, FabricResult, IntegrityError, PolicyViolation,
    PolicyViolationKind, ProtocolError, QuotaExceeded, RegistrationFailed, Severity,
};
pub use crate::governance::{
    CapabilityMetadata, CapabilityRegistry, CapabilityToken, PolicyEngine, PolicyRuleset,
    RevocationList, TokenIssuer, TokenVerifier, ValidationResult,
};
pub use crate::isolation::{
    capability_matches, CapabilityDomain, ExecutionDomain, ExecutionQuota, IsolationEnforcer,
    QuotaLimits, QuotaTracker, TenantContext,
};
pub use crate::memory::{MemorySeal, MemorySnapshot, MemoryVault, SealedMemory};
pub use crate::node::{
    ExecutionNode, ExecutionProof, NodeExecutionRequest, NodeExecutionResponse, NodeSecurity,
    RuntimeBridge,
};
pub use crate::planning::{Plan, PlanBuilder, PlanStep, PlanningConstraints, PolicyConstrainedPlanner};
pub use crate::protocol::{Envelope, HandshakeRequest, HandshakeResponse, RemoteNodeProtocol};
pub use crate::rollback::{
    ClusterRollback, InMemoryCheckpoints, RollbackCoordinator, RollbackProvider, RollbackReport,
};
pub use crate::sandbox::{
    DeterministicSandbox, ExecutionContext, ExecutionResult, NullSkillExecutor, SkillExecutor,
    SkillOutcome, TraceEvent,
};
pub use crate::telemetry::{InMemoryTelemetry, NullTelemetry, Telemetry};
pub use crate::PROTOCOL_VERSION;
