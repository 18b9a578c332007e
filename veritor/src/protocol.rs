//! Remote node protocol.
//!
//! Handshake, capability negotiation and envelope framing between nodes.
//! Every message is a canonical JSON object; protocol version mismatches
//! fail closed, and a declared capability outside the negotiated set (and
//! not locally authorized) is a denial, not a warning.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::canonical::canonical_json;
use crate::clock::SharedClock;
use crate::errors::{CapabilityError, FabricResult, ProtocolError};
use crate::isolation::capability_domain::CapabilityDomain;
use crate::PROTOCOL_VERSION;

/// Capability the responder side must hold to accept handshakes.
pub const HANDSHAKE_CAPABILITY: &str = "handshake";

/// Wire envelope carried by every inter-node message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol_version: String,
    pub trace_id: String,
    /// Integer nanoseconds, normalized to a canonical monotonic form.
    pub timestamp: i64,
    pub node_id: String,
    pub capabilities: Vec<String>,
    pub payload: Value,
}

impl Envelope {
    /// Canonical wire form: UTF-8, sorted keys, ASCII separators.
    pub fn to_canonical(&self) -> String {
        canonical_json(&json!({
            "protocol_version": self.protocol_version,
            "trace_id": self.trace_id,
            "timestamp": self.timestamp,
            "node_id": self.node_id,
            "capabilities": self.capabilities,
            "payload": self.payload,
        }))
    }
}

/// Opening message of the node handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub node_id: String,
    pub protocol_version: String,
    pub capabilities: Vec<String>,
}

/// Responder's answer, carrying the negotiated capability set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub node_id: String,
    pub protocol_version: String,
    pub accepted: bool,
    pub negotiated_capabilities: Vec<String>,
}

/// Protocol endpoint for one node.
#[derive(Debug)]
pub struct RemoteNodeProtocol {
    node_id: String,
    /// Local capability authority consulted for incoming declarations.
    local_capabilities: CapabilityDomain,
    negotiated_capabilities: Vec<String>,
    clock: SharedClock,
}

impl RemoteNodeProtocol {
    pub fn new(
        node_id: impl Into<String>,
        local_capabilities: CapabilityDomain,
        clock: SharedClock,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            local_capabilities,
            negotiated_capabilities: Vec::new(),
            clock,
        }
    }

    pub fn negotiated_capabilities(&self) -> &[String] {
        &self.negotiated_capabilities
    }

    /// Respond to a handshake: validate the version, check our own
    /// handshake capability, then accept the requested capability set.
    pub fn handle_handshake(&mut self, request: &HandshakeRequest) -> FabricResult<HandshakeResponse> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION.to_string(),
                actual: request.protocol_version.clone(),
            }
            .into());
        }
        if !self
            .local_capabilities
            .validate_capability_scope(HANDSHAKE_CAPABILITY)
        {
            return Err(CapabilityError::Missing {
                capability: HANDSHAKE_CAPABILITY.to_string(),
            }
            .into());
        }

        self.negotiated_capabilities = request.capabilities.clone();
        Ok(HandshakeResponse {
            node_id: self.node_id.clone(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            accepted: true,
            negotiated_capabilities: self.negotiated_capabilities.clone(),
        })
    }

    /// Build an outgoing envelope with a fresh trace id and a normalized
    /// monotonic timestamp.
    pub fn prepare_message(&self, payload: Value) -> Envelope {
        Envelope {
            protocol_version: PROTOCOL_VERSION.to_string(),
            trace_id: Uuid::new_v4().to_string(),
            timestamp: normalize_timestamp(self.clock.timestamp_nanos()),
            node_id: self.node_id.clone(),
            capabilities: self.negotiated_capabilities.clone(),
            payload,
        }
    }

    /// Validate and parse an incoming envelope. Enforces field presence,
    /// protocol version equality, and that every declared capability is in
    /// the negotiated set or authorized by the local capability domain.
    pub fn validate_incoming(&self, envelope: &Value) -> FabricResult<Envelope> {
        for field in ["protocol_version", "trace_id", "timestamp", "node_id", "payload"] {
            if envelope.get(field).is_none() {
                return Err(ProtocolError::MissingField {
                    field: field.to_string(),
                }
                .into());
            }
        }

        let version = envelope["protocol_version"].as_str().unwrap_or_default();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                expected: PROTOCOL_VERSION.to_string(),
                actual: version.to_string(),
            }
            .into());
        }

        let parsed: Envelope = serde_json::from_value(envelope.clone()).map_err(|e| {
            ProtocolError::MalformedEnvelope {
                reason: e.to_string(),
            }
        })?;

        for capability in &parsed.capabilities {
            let negotiated = self.negotiated_capabilities.contains(capability);
            let authorized = self.local_capabilities.validate_capability_scope(capability);
            if !negotiated && !authorized {
                return Err(CapabilityError::Missing {
                    capability: capability.clone(),
                }
                .into());
            }
        }

        Ok(Envelope {
            timestamp: normalize_timestamp(parsed.timestamp),
            ..parsed
        })
    }
}

/// Normalize a nanosecond timestamp to microsecond resolution so two nodes
/// framing the same instant agree on the canonical value.
pub fn normalize_timestamp(nanos: i64) -> i64 {
    nanos - nanos.rem_euclid(1_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fixed_clock;
    use std::collections::BTreeSet;

    fn caps(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn endpoint(local: &[&str]) -> RemoteNodeProtocol {
        RemoteNodeProtocol::new(
            "n0",
            CapabilityDomain::new("proto-n0", caps(local), None),
            fixed_clock(),
        )
    }

    fn handshake(capabilities: &[&str]) -> HandshakeRequest {
        HandshakeRequest {
            node_id: "n1".into(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: capabilities.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn handshake_negotiates_requested_capabilities() {
        let mut endpoint = endpoint(&[HANDSHAKE_CAPABILITY]);
        let response = endpoint.handle_handshake(&handshake(&["execute", "relay"])).unwrap();
        assert!(response.accepted);
        assert_eq!(response.negotiated_capabilities, vec!["execute", "relay"]);
    }

    #[test]
    fn handshake_version_mismatch_fails_closed() {
        let mut endpoint = endpoint(&[HANDSHAKE_CAPABILITY]);
        let mut request = handshake(&[]);
        request.protocol_version = "2.0".into();
        assert_eq!(
            endpoint.handle_handshake(&request).unwrap_err().kind(),
            "protocol_error"
        );
    }

    #[test]
    fn handshake_requires_local_capability() {
        let mut endpoint = endpoint(&[]);
        assert_eq!(
            endpoint.handle_handshake(&handshake(&[])).unwrap_err().kind(),
            "capability_error"
        );
    }

    #[test]
    fn incoming_envelope_round_trip() {
        let mut endpoint = endpoint(&[HANDSHAKE_CAPABILITY]);
        endpoint.handle_handshake(&handshake(&["execute"])).unwrap();

        let outgoing = endpoint.prepare_message(json!({"op": "status"}));
        let value = serde_json::from_str(&outgoing.to_canonical()).unwrap();
        let validated = endpoint.validate_incoming(&value).unwrap();
        assert_eq!(validated.payload, json!({"op": "status"}));
        assert_eq!(validated.timestamp % 1_000, 0);
    }

    #[test]
    fn missing_field_is_rejected() {
        let endpoint = endpoint(&[]);
        let err = endpoint
            .validate_incoming(&json!({"protocol_version": PROTOCOL_VERSION}))
            .unwrap_err();
        assert_eq!(err.kind(), "protocol_error");
    }

    #[test]
    fn undeclared_capability_is_denied() {
        let endpoint = endpoint(&[]);
        let envelope = json!({
            "protocol_version": PROTOCOL_VERSION,
            "trace_id": "t-1",
            "timestamp": 1_000_000,
            "node_id": "n1",
            "capabilities": ["os:process"],
            "payload": {},
        });
        assert_eq!(
            endpoint.validate_incoming(&envelope).unwrap_err().kind(),
            "capability_error"
        );
    }

    #[test]
    fn locally_authorized_capability_passes_without_negotiation() {
        let endpoint = endpoint(&["os:process"]);
        let envelope = json!({
            "protocol_version": PROTOCOL_VERSION,
            "trace_id": "t-1",
            "timestamp": 1_000_000,
            "node_id": "n1",
            "capabilities": ["os:process"],
            "payload": {},
        });
        assert!(endpoint.validate_incoming(&envelope).is_ok());
    }
}
