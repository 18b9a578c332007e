//! Human-approval gate.
//!
//! High-risk actions (`risk_level >= 3`, or anything the policy engine
//! flags) route through an approval queue ordered deterministically by
//! `(requested_at, task_id)`. The gate is consulted synchronously before an
//! execution enters the sandbox: a denial marks the execution failed, an
//! unanswered request parks it as pending. Requests expire after a TTL, and
//! state snapshots are sanitized before they are queued so secrets never
//! reach an approver's screen.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::errors::{FabricError, FabricResult};
use crate::PROTOCOL_VERSION;

/// Status of an approval request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum ApprovalStatus {
    Pending,
    Approved { by: String, at: String },
    Denied { by: String, at: String, reason: String },
    Expired { at: String },
}

impl ApprovalStatus {
    pub fn is_pending(&self) -> bool {
        matches!(self, ApprovalStatus::Pending)
    }
}

/// A queued request for human approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub tenant_id: String,
    pub task_id: String,
    pub action: String,
    pub risk_level: u8,
    pub state_snapshot: Value,
    pub requested_at: String,
    pub expires_at: String,
    pub status: ApprovalStatus,
    pub protocol_version: String,
}

/// Decision returned by an external approval channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalDecision {
    pub approved: bool,
    pub approver: String,
    pub timestamp: String,
    pub reason: Option<String>,
}

/// External channel (connector, dashboard) that can resolve an approval
/// request. Returning `None` leaves the request pending in the queue.
#[async_trait]
pub trait ApprovalChannel: Send + Sync {
    async fn send_approval_request(
        &self,
        request: &ApprovalRequest,
    ) -> FabricResult<Option<ApprovalDecision>>;
}

/// Gate outcome as seen by the execution node.
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome {
    /// No approval needed, or approval granted.
    Proceed,
    /// Parked; the request stays pending in the queue.
    Pending { request_id: String },
    /// Denied by an approver.
    Denied { request_id: String, reason: String },
}

/// Synchronous approval gate in front of the sandbox.
pub struct ApprovalGate {
    clock: SharedClock,
    channel: Option<std::sync::Arc<dyn ApprovalChannel>>,
    queue: Vec<ApprovalRequest>,
    by_id: HashMap<String, usize>,
    ttl_hours: i64,
}

impl std::fmt::Debug for ApprovalGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalGate")
            .field("queue", &self.queue.len())
            .field("ttl_hours", &self.ttl_hours)
            .finish()
    }
}

impl ApprovalGate {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock,
            channel: None,
            queue: Vec::new(),
            by_id: HashMap::new(),
            ttl_hours: 24,
        }
    }

    pub fn with_channel(mut self, channel: std::sync::Arc<dyn ApprovalChannel>) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn with_ttl_hours(mut self, ttl_hours: i64) -> Self {
        self.ttl_hours = ttl_hours;
        self
    }

    /// Queue a request and consult the external channel synchronously.
    pub async fn request_approval(
        &mut self,
        tenant_id: &str,
        task_id: &str,
        action: &str,
        risk_level: u8,
        state: &Value,
    ) -> FabricResult<GateOutcome> {
        let now = self.clock.now();
        let request = ApprovalRequest {
            request_id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            task_id: task_id.to_string(),
            action: action.to_string(),
            risk_level,
            state_snapshot: sanitize_state(state),
            requested_at: now.to_rfc3339(),
            expires_at: (now + Duration::hours(self.ttl_hours)).to_rfc3339(),
            status: ApprovalStatus::Pending,
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        let request_id = request.request_id.clone();
        self.enqueue(request);

        let decision = match &self.channel {
            Some(channel) => {
                let request = self.get(&request_id).cloned().expect("request just queued");
                channel.send_approval_request(&request).await?
            }
            None => None,
        };

        match decision {
            Some(decision) if decision.approved => {
                self.resolve(&request_id, true, &decision.approver, decision.reason)?;
                Ok(GateOutcome::Proceed)
            }
            Some(decision) => {
                let reason = decision
                    .reason
                    .clone()
                    .unwrap_or_else(|| "denied by approver".into());
                self.resolve(&request_id, false, &decision.approver, decision.reason)?;
                Ok(GateOutcome::Denied { request_id, reason })
            }
            None => Ok(GateOutcome::Pending { request_id }),
        }
    }

    /// Resolve a queued request, e.g. from a dashboard callback.
    pub fn resolve(
        &mut self,
        request_id: &str,
        approved: bool,
        approver: &str,
        reason: Option<String>,
    ) -> FabricResult<()> {
        let now = self.clock.timestamp();
        let index = *self.by_id.get(request_id).ok_or_else(|| {
            FabricError::Config(format!("unknown approval request {}", request_id))
        })?;
        let request = &mut self.queue[index];
        if request.expires_at < now {
            request.status = ApprovalStatus::Expired { at: now };
            return Err(FabricError::ApprovalDenied {
                request_id: request_id.to_string(),
                reason: "request expired".into(),
            });
        }
        request.status = if approved {
            ApprovalStatus::Approved {
                by: approver.to_string(),
                at: now,
            }
        } else {
            ApprovalStatus::Denied {
                by: approver.to_string(),
                at: now,
                reason: reason.unwrap_or_else(|| "denied by approver".into()),
            }
        };
        Ok(())
    }

    /// Pending requests in deterministic `(requested_at, task_id)` order.
    pub fn pending(&self) -> Vec<&ApprovalRequest> {
        let mut pending: Vec<&ApprovalRequest> = self
            .queue
            .iter()
            .filter(|r| r.status.is_pending())
            .collect();
        pending.sort_by(|a, b| {
            (a.requested_at.as_str(), a.task_id.as_str())
                .cmp(&(b.requested_at.as_str(), b.task_id.as_str()))
        });
        pending
    }

    pub fn get(&self, request_id: &str) -> Option<&ApprovalRequest> {
        self.by_id.get(request_id).map(|&i| &self.queue[i])
    }

    /// Mark overdue pending requests expired; returns the ids that flipped.
    pub fn expire_overdue(&mut self) -> Vec<String> {
        let now = self.clock.timestamp();
        let mut expired = Vec::new();
        for request in &mut self.queue {
            if request.status.is_pending() && request.expires_at < now {
                request.status = ApprovalStatus::Expired { at: now.clone() };
                expired.push(request.request_id.clone());
            }
        }
        expired
    }

    fn enqueue(&mut self, request: ApprovalRequest) {
        self.by_id.insert(request.request_id.clone(), self.queue.len());
        self.queue.push(request);
    }
}

const SENSITIVE_KEY_MARKERS: [&str; 5] = ["password", "token", "secret", "key", "api_key"];

/// Redact values under keys that look secret-bearing before a snapshot is
/// queued for human eyes.
fn sanitize_state(state: &Value) -> Value {
    match state {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let lowered = k.to_lowercase();
                    if SENSITIVE_KEY_MARKERS.iter().any(|m| lowered.contains(m)) {
                        (k.clone(), Value::String("[REDACTED]".into()))
                    } else {
                        (k.clone(), sanitize_state(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_state).collect()),
        other => other.clone(),
    }
}
