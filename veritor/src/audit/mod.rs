//! Audit chain.
//!
//! Ordered, canonical event log per node with a Merkle root. Tampering with
//! any recorded event changes the root on recomputation. Subscribers receive
//! events in append order through the sink registry.

pub mod chain;
pub mod events;
pub mod sink;

pub use chain::AuditChain;
pub use events::{AuditEvent, AuditEventType};
pub use sink::{AuditSink, EventBus, Subscription};
