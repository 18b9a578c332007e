//! Agent memory.
//!
//! Content-addressed, capability-protected snapshots in the vault, and
//! HMAC seals binding memory to its agent for tamper detection.

pub mod seal;
pub mod vault;

pub use seal::{MemorySeal, SealedMemory};
pub use vault::{MemorySnapshot, MemoryVault};
