//! Execution node.
//!
//! Binds security, planner, sandbox and audit chain for one machine and
//! exposes the request/reply execution surface. Each request is version
//! checked, token verified, planned under policy, risk gated, then run in a
//! fresh execution domain; the reply carries the structured result and a
//! signed execution proof.

pub mod bridge;
pub mod runtime;
pub mod security;

pub use bridge::{ExecutionProof, RuntimeBridge};
pub use runtime::{ExecutionNode, NodeExecutionRequest, NodeExecutionResponse};
pub use security::NodeSecurity;
