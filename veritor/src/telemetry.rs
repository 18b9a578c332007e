//! Telemetry hook.
//!
//! The fabric records coarse execution metrics through this seam so that
//! predictive and self-improvement collaborators can observe it without
//! reaching into the core. The in-memory recorder is the default wiring and
//! the one tests use.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;

/// Sink for named telemetry events.
pub trait Telemetry: Send + Sync {
    fn record(&self, event_name: &str, data: Value);
}

/// Telemetry recorder keeping per-event counts and a bounded recent-event
/// buffer.
#[derive(Debug)]
pub struct InMemoryTelemetry {
    inner: Mutex<TelemetryState>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct TelemetryState {
    counts: HashMap<String, u64>,
    recent: Vec<(String, Value)>,
}

impl InMemoryTelemetry {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(TelemetryState::default()),
            capacity,
        }
    }

    pub fn event_count(&self, event_name: &str) -> u64 {
        let state = self.inner.lock().expect("telemetry lock poisoned");
        state.counts.get(event_name).copied().unwrap_or(0)
    }

    /// All counts, sorted by event name for stable reporting.
    pub fn event_counts(&self) -> Vec<(String, u64)> {
        let state = self.inner.lock().expect("telemetry lock poisoned");
        let mut counts: Vec<(String, u64)> =
            state.counts.iter().map(|(k, v)| (k.clone(), *v)).collect();
        counts.sort();
        counts
    }

    pub fn recent_events(&self, max: usize) -> Vec<(String, Value)> {
        let state = self.inner.lock().expect("telemetry lock poisoned");
        let start = state.recent.len().saturating_sub(max);
        state.recent[start..].to_vec()
    }
}

impl Default for InMemoryTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry for InMemoryTelemetry {
    fn record(&self, event_name: &str, data: Value) {
        let mut state = self.inner.lock().expect("telemetry lock poisoned");
        *state.counts.entry(event_name.to_string()).or_insert(0) += 1;
        if state.recent.len() >= self.capacity {
            state.recent.remove(0);
        }
        state.recent.push((event_name.to_string(), data));
    }
}

/// Telemetry sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {
    fn record(&self, _event_name: &str, _data: Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn counts_and_recent_events() {
        let telemetry = InMemoryTelemetry::with_capacity(2);
        telemetry.record("execution_completed", json!({"node": "n0"}));
        telemetry.record("execution_completed", json!({"node": "n1"}));
        telemetry.record("step_failed", json!({}));

        assert_eq!(telemetry.event_count("execution_completed"), 2);
        assert_eq!(telemetry.event_count("step_failed"), 1);
        // capacity 2: oldest event evicted
        assert_eq!(telemetry.recent_events(10).len(), 2);
    }
}
