//! Per-node audit chain.
//!
//! Append-only canonical event log with a Merkle root: leaf hashes are
//! SHA-256 over canonical event encodings, internal nodes hash the
//! concatenation of their children, an odd node is carried up unchanged.
//! The root is queryable at any time; recomputation detects any mutation of
//! a recorded event. Optionally persisted as an append-only JSONL file with
//! periodic root snapshots.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::audit::events::{AuditEvent, AuditEventType};
use crate::audit::sink::{AuditSink, EventBus, Subscription};
use crate::canonical::sha256_hex;
use crate::clock::SharedClock;
use crate::errors::{FabricResult, IntegrityError};

/// Append-only audit chain for one node.
pub struct AuditChain {
    node_id: String,
    clock: SharedClock,
    events: Vec<AuditEvent>,
    leaf_hashes: Vec<String>,
    bus: EventBus,
    /// JSONL persistence target; `None` for in-memory operation.
    persist_path: Option<PathBuf>,
}

impl std::fmt::Debug for AuditChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditChain")
            .field("node_id", &self.node_id)
            .field("events", &self.events.len())
            .field("persist_path", &self.persist_path)
            .finish()
    }
}

impl AuditChain {
    pub fn new(node_id: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            node_id: node_id.into(),
            clock,
            events: Vec::new(),
            leaf_hashes: Vec::new(),
            bus: EventBus::new(),
            persist_path: None,
        }
    }

    /// Chain persisted as an append-only JSONL log at `path`.
    pub fn with_persistence(
        node_id: impl Into<String>,
        clock: SharedClock,
        path: PathBuf,
    ) -> FabricResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| IntegrityError::Io(format!("cannot create audit log dir: {}", e)))?;
        }
        let mut chain = Self::new(node_id, clock);
        chain.persist_path = Some(path);
        Ok(chain)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn subscribe(&mut self, subscription: Subscription, sink: Arc<dyn AuditSink>) {
        self.bus.subscribe(subscription, sink);
    }

    /// Canonicalize and append an event, update the leaf set, notify
    /// subscribers.
    pub fn emit(
        &mut self,
        event_type: AuditEventType,
        details: Value,
        agent_id: Option<&str>,
    ) -> FabricResult<&AuditEvent> {
        let event = AuditEvent::new(
            event_type,
            details,
            agent_id.map(str::to_string),
            self.clock.timestamp(),
        );

        if let Some(path) = &self.persist_path {
            let line = serde_json::to_string(&event)
                .map_err(|e| IntegrityError::Io(format!("cannot encode audit event: {}", e)))?;
            append_line(path, &line)?;
        }

        self.leaf_hashes.push(event.leaf_hash());
        self.events.push(event);
        let appended = self.events.last().expect("event just appended");
        self.bus.publish(appended);
        Ok(appended)
    }

    pub fn events(&self) -> &[AuditEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events_of_type(&self, event_type: AuditEventType) -> Vec<&AuditEvent> {
        self.events
            .iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Current Merkle root over the stored leaf hashes.
    pub fn merkle_root(&self) -> String {
        merkle_root(&self.leaf_hashes)
    }

    /// Recompute every leaf from the stored events and compare against the
    /// incremental state. A single mutated event fails this check.
    pub fn verify_integrity(&self) -> Result<(), IntegrityError> {
        if self.events.len() != self.leaf_hashes.len() {
            return Err(IntegrityError::ChainDrift {
                context: format!(
                    "event count {} != leaf count {}",
                    self.events.len(),
                    self.leaf_hashes.len()
                ),
            });
        }
        for (i, event) in self.events.iter().enumerate() {
            let recomputed = event.leaf_hash();
            if recomputed != self.leaf_hashes[i] {
                return Err(IntegrityError::ChainDrift {
                    context: format!("leaf {} diverges from its event", i),
                });
            }
        }
        Ok(())
    }

    /// Append a `{root, length, timestamp}` snapshot next to the event log.
    pub fn write_root_snapshot(&self) -> FabricResult<()> {
        let path = match &self.persist_path {
            Some(path) => path.with_extension("roots"),
            None => return Ok(()),
        };
        let snapshot = json!({
            "node_id": self.node_id,
            "root": self.merkle_root(),
            "length": self.events.len(),
            "timestamp": self.clock.timestamp(),
        });
        append_line(&path, &snapshot.to_string())
    }

    /// Test hook: overwrite a stored event in place, bypassing append-only
    /// discipline, to exercise tamper detection.
    #[cfg(test)]
    pub(crate) fn tamper_event(&mut self, index: usize, details: Value) {
        self.events[index].details = details;
    }
}

fn append_line(path: &std::path::Path, line: &str) -> FabricResult<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| IntegrityError::Io(format!("cannot open {}: {}", path.display(), e)))?;
    writeln!(file, "{}", line)
        .map_err(|e| IntegrityError::Io(format!("cannot append to {}: {}", path.display(), e)))?;
    Ok(())
}

/// Merkle root over ordered leaf hashes. The empty log hashes the literal
/// `empty` marker so an empty chain still has a stable root.
pub fn merkle_root(leaves: &[String]) -> String {
    if leaves.is_empty() {
        return sha256_hex(b"empty");
    }
    let mut level: Vec<String> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len() / 2 + 1);
        for pair in level.chunks(2) {
            match pair {
                [left, right] => {
                    next.push(sha256_hex(format!("{}{}", left, right).as_bytes()));
                }
                [odd] => next.push(odd.clone()),
                _ => unreachable!("chunks(2) yields one or two elements"),
            }
        }
        level = next;
    }
    level.into_iter().next().expect("non-empty level")
}
