//! Signed capability tokens.
//!
//! A token is an immutable tuple binding an agent to one capability and
//! scope for a bounded time, signed with HMAC-SHA256 over the canonical form
//! of all other fields. Verification is pure: issuer match, expiry against
//! the clock, constant-time signature check, then the revocation list.
//! Failures are explicit denials; nothing is retried.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::canonical::{canonical_json, hash_value, hmac_sign, hmac_verify, short_id};
use crate::clock::SharedClock;
use crate::config::SecretKey;
use crate::errors::CapabilityError;
use crate::governance::revocation::RevocationList;
use crate::PROTOCOL_VERSION;

/// Immutable signed capability token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityToken {
    pub token_id: String,
    pub agent_id: String,
    pub capability: String,
    pub scope: String,
    pub issued_at: String,
    pub expires_at: String,
    pub issuer_id: String,
    pub signature: String,
    pub protocol_version: String,
}

impl CapabilityToken {
    /// Canonical form of every field except the signature — the exact bytes
    /// the signature covers.
    fn unsigned_value(&self) -> Value {
        json!({
            "token_id": self.token_id,
            "agent_id": self.agent_id,
            "capability": self.capability,
            "scope": self.scope,
            "issued_at": self.issued_at,
            "expires_at": self.expires_at,
            "issuer_id": self.issuer_id,
            "protocol_version": self.protocol_version,
        })
    }

    pub fn to_canonical(&self) -> String {
        canonical_json(&self.unsigned_value())
    }

    /// Deterministic token hash over the canonical body.
    pub fn compute_hash(&self) -> String {
        hash_value(&self.unsigned_value())
    }

    /// Capability id and scope combined, e.g. `fs:read:/workspace/**`.
    /// Tokens issued without a scope grant the bare capability.
    pub fn effective_capability(&self) -> String {
        if self.scope.is_empty() {
            self.capability.clone()
        } else {
            format!("{}:{}", self.capability, self.scope)
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match DateTime::parse_from_rfc3339(&self.expires_at) {
            Ok(expires) => now >= expires.with_timezone(&Utc),
            // unparseable expiry fails closed
            Err(_) => true,
        }
    }
}

/// Issues signed capability tokens under one issuer identity.
pub struct TokenIssuer {
    issuer_id: String,
    secret: SecretKey,
    clock: SharedClock,
    issued: HashMap<String, CapabilityToken>,
}

impl std::fmt::Debug for TokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenIssuer")
            .field("issuer_id", &self.issuer_id)
            .field("issued", &self.issued.len())
            .finish()
    }
}

impl TokenIssuer {
    pub fn new(issuer_id: impl Into<String>, secret: SecretKey, clock: SharedClock) -> Self {
        Self {
            issuer_id: issuer_id.into(),
            secret,
            clock,
            issued: HashMap::new(),
        }
    }

    pub fn issuer_id(&self) -> &str {
        &self.issuer_id
    }

    /// Issue a signed, time-bounded token.
    pub fn issue(
        &mut self,
        agent_id: &str,
        capability: &str,
        scope: &str,
        ttl_seconds: i64,
    ) -> CapabilityToken {
        let now = self.clock.now();
        let issued_at = now.to_rfc3339();
        let expires_at = (now + Duration::seconds(ttl_seconds)).to_rfc3339();
        let token_id = short_id(&format!("{}:{}:{}", agent_id, capability, issued_at));

        let mut token = CapabilityToken {
            token_id: token_id.clone(),
            agent_id: agent_id.to_string(),
            capability: capability.to_string(),
            scope: scope.to_string(),
            issued_at,
            expires_at,
            issuer_id: self.issuer_id.clone(),
            signature: String::new(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        token.signature = hmac_sign(self.secret.as_bytes(), token.to_canonical().as_bytes());

        log::debug!(
            "[issuer {}] issued token {} for {} -> {}",
            self.issuer_id,
            token.token_id,
            agent_id,
            token.effective_capability()
        );
        self.issued.insert(token_id, token.clone());
        token
    }

    pub fn get_issued(&self, token_id: &str) -> Option<&CapabilityToken> {
        self.issued.get(token_id)
    }

    /// Build the matching verifier for this issuer's secret.
    pub fn verifier(&self) -> TokenVerifier {
        TokenVerifier::new(self.issuer_id.clone(), self.secret.clone(), self.clock.clone())
    }
}

/// Verifies capability tokens against one issuer identity and secret.
#[derive(Clone)]
pub struct TokenVerifier {
    issuer_id: String,
    secret: SecretKey,
    clock: SharedClock,
}

impl std::fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenVerifier")
            .field("issuer_id", &self.issuer_id)
            .finish()
    }
}

impl TokenVerifier {
    pub fn new(issuer_id: impl Into<String>, secret: SecretKey, clock: SharedClock) -> Self {
        Self {
            issuer_id: issuer_id.into(),
            secret,
            clock,
        }
    }

    /// Full verification: issuer, expiry, signature (constant time), then
    /// the revocation list. Pure given the clock and the list snapshot.
    pub fn verify(
        &self,
        token: &CapabilityToken,
        revocations: &RevocationList,
    ) -> Result<(), CapabilityError> {
        if token.issuer_id != self.issuer_id {
            return Err(CapabilityError::IssuerMismatch {
                token_id: token.token_id.clone(),
                issuer_id: token.issuer_id.clone(),
            });
        }

        if token.is_expired(self.clock.now()) {
            return Err(CapabilityError::Expired {
                token_id: token.token_id.clone(),
            });
        }

        if !hmac_verify(
            self.secret.as_bytes(),
            token.to_canonical().as_bytes(),
            &token.signature,
        ) {
            return Err(CapabilityError::SignatureMismatch {
                token_id: token.token_id.clone(),
            });
        }

        if let Some(reason) = revocations.reason(&token.token_id) {
            return Err(CapabilityError::Revoked {
                token_id: token.token_id.clone(),
                reason: reason.to_string(),
            });
        }

        Ok(())
    }
}
