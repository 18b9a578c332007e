//! Audit event subscribers.
//!
//! Delivery is in append order per node. Three subscription shapes: all
//! events, one event type, or a wildcard pattern over event type names
//! (`capability_*`).

use std::collections::HashMap;
use std::sync::Arc;

use crate::audit::events::{AuditEvent, AuditEventType};
use crate::isolation::capability_matches;

/// Receiver for appended audit events.
pub trait AuditSink: Send + Sync {
    fn on_event(&self, event: &AuditEvent);
}

/// What a sink subscribed to.
#[derive(Debug, Clone)]
pub enum Subscription {
    All,
    Type(AuditEventType),
    /// Glob over the snake_case event type name.
    Wildcard(String),
}

/// Registry of subscribers, notified synchronously on every append.
#[derive(Default)]
pub struct EventBus {
    all: Vec<Arc<dyn AuditSink>>,
    by_type: HashMap<AuditEventType, Vec<Arc<dyn AuditSink>>>,
    wildcard: Vec<(String, Arc<dyn AuditSink>)>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("all", &self.all.len())
            .field("by_type", &self.by_type.len())
            .field("wildcard", &self.wildcard.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscription: Subscription, sink: Arc<dyn AuditSink>) {
        match subscription {
            Subscription::All => self.all.push(sink),
            Subscription::Type(event_type) => {
                self.by_type.entry(event_type).or_default().push(sink)
            }
            Subscription::Wildcard(pattern) => self.wildcard.push((pattern, sink)),
        }
    }

    /// Notify every matching subscriber, in registration order within each
    /// class.
    pub fn publish(&self, event: &AuditEvent) {
        for sink in &self.all {
            sink.on_event(event);
        }
        if let Some(sinks) = self.by_type.get(&event.event_type) {
            for sink in sinks {
                sink.on_event(event);
            }
        }
        let name = event.event_type.as_str();
        for (pattern, sink) in &self.wildcard {
            if capability_matches(pattern, name) {
                sink.on_event(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl AuditSink for Recorder {
        fn on_event(&self, event: &AuditEvent) {
            self.seen
                .lock()
                .unwrap()
                .push(event.event_type.to_string());
        }
    }

    fn event(event_type: AuditEventType) -> AuditEvent {
        AuditEvent::new(event_type, json!({}), None, "t0".into())
    }

    #[test]
    fn subscriptions_route_correctly() {
        let mut bus = EventBus::new();
        let all = Arc::new(Recorder::default());
        let typed = Arc::new(Recorder::default());
        let wild = Arc::new(Recorder::default());

        bus.subscribe(Subscription::All, all.clone());
        bus.subscribe(Subscription::Type(AuditEventType::StepFailed), typed.clone());
        bus.subscribe(Subscription::Wildcard("capability_*".into()), wild.clone());

        bus.publish(&event(AuditEventType::StepFailed));
        bus.publish(&event(AuditEventType::CapabilityDenied));
        bus.publish(&event(AuditEventType::PlanBuilt));

        assert_eq!(all.seen.lock().unwrap().len(), 3);
        assert_eq!(*typed.seen.lock().unwrap(), vec!["step_failed"]);
        assert_eq!(*wild.seen.lock().unwrap(), vec!["capability_denied"]);
    }
}
