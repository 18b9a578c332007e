//! Node security layer.
//!
//! Token and capability validation at the node boundary. Zero implicit
//! permissions: an empty token set is denied for any non-empty requirement,
//! and every presented token must verify and bind to the presenting agent.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use crate::errors::{CapabilityError, FabricResult};
use crate::governance::revocation::RevocationList;
use crate::governance::token::{CapabilityToken, TokenVerifier};
use crate::isolation::capability_matches;

/// Security checks performed before a request reaches planning.
#[derive(Debug, Clone)]
pub struct NodeSecurity {
    verifier: TokenVerifier,
    revocations: Arc<RwLock<RevocationList>>,
}

impl NodeSecurity {
    pub fn new(verifier: TokenVerifier, revocations: Arc<RwLock<RevocationList>>) -> Self {
        Self {
            verifier,
            revocations,
        }
    }

    pub fn revocations(&self) -> Arc<RwLock<RevocationList>> {
        self.revocations.clone()
    }

    /// Verify every presented token and its binding to the presenting agent.
    pub fn validate_tokens(&self, agent_id: &str, tokens: &[CapabilityToken]) -> FabricResult<()> {
        let revocations = self.revocations.read().expect("revocation lock poisoned");
        for token in tokens {
            if token.agent_id != agent_id {
                return Err(CapabilityError::AgentMismatch {
                    token_id: token.token_id.clone(),
                    bound_agent: token.agent_id.clone(),
                    presenting_agent: agent_id.to_string(),
                }
                .into());
            }
            self.verifier.verify(token, &revocations)?;
        }
        Ok(())
    }

    /// Every contract-required capability must be covered by some presented
    /// token. An empty token set is denied outright.
    pub fn check_required_capabilities(
        &self,
        required: &BTreeSet<String>,
        tokens: &[CapabilityToken],
    ) -> FabricResult<()> {
        if required.is_empty() {
            return Ok(());
        }
        if tokens.is_empty() {
            return Err(CapabilityError::NoCapabilities.into());
        }
        for capability in required {
            let covered = tokens.iter().any(|t| {
                capability_matches(&t.capability, capability)
                    || capability_matches(&t.effective_capability(), capability)
            });
            if !covered {
                return Err(CapabilityError::Missing {
                    capability: capability.clone(),
                }
                .into());
            }
        }
        Ok(())
    }
}
