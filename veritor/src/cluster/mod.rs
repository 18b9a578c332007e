//! Cluster fabric.
//!
//! Consistent-hash scheduling of contracts onto nodes, the distributed
//! execution domain, quorum-gated membership governance, federated audit
//! aggregation, and cross-node state hash consensus.

pub mod consensus;
pub mod domain;
pub mod federation;
pub mod membership;
pub mod scheduler;

pub use consensus::{ConsensusResult, StateHashConsensus};
pub use domain::{DistributedExecutionDomain, NodeDescriptor};
pub use federation::{FederatedAuditCoordinator, FederatedAuditRoot};
pub use membership::{MembershipAuthority, TrustedNodeDescriptor};
pub use scheduler::{ClusterSchedule, ClusterScheduler, ScheduledTask};
