//! Node configuration.
//!
//! Everything an operator supplies at bootstrap: node identity, quorum
//! threshold, default resource quotas, and where the HMAC signing secret
//! comes from. Secrets are never compiled in; they arrive via an environment
//! variable named in the config, or directly for tests.

use serde::{Deserialize, Serialize};

use crate::errors::{FabricError, FabricResult};
use crate::PROTOCOL_VERSION;

/// HMAC signing key material. Debug output is redacted.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(Vec<u8>);

impl SecretKey {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Load key bytes from the named environment variable.
    pub fn from_env(var: &str) -> FabricResult<Self> {
        let value = std::env::var(var)
            .map_err(|_| FabricError::Config(format!("secret env var {} is not set", var)))?;
        if value.is_empty() {
            return Err(FabricError::Config(format!(
                "secret env var {} is empty",
                var
            )));
        }
        Ok(Self(value.into_bytes()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(<redacted>)")
    }
}

/// Default sandbox resource quotas, overridable per request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuotaConfig {
    pub max_steps: u64,
    pub max_time_ms: u64,
    pub max_capability_calls: u64,
    pub cpu_seconds: u64,
    pub memory_mb: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_time_ms: 30_000,
            max_capability_calls: 100,
            cpu_seconds: 60,
            memory_mb: 512,
        }
    }
}

/// Bootstrap configuration for one execution node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    pub node_name: String,
    /// Environment variable holding the HMAC signing secret.
    pub secret_env: String,
    #[serde(default = "default_quorum")]
    pub quorum_threshold: usize,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default = "default_trust_level")]
    pub trust_level: u8,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
}

fn default_quorum() -> usize {
    2
}

fn default_trust_level() -> u8 {
    1
}

fn default_protocol_version() -> String {
    PROTOCOL_VERSION.to_string()
}

impl NodeConfig {
    pub fn from_toml_str(raw: &str) -> FabricResult<Self> {
        let config: NodeConfig =
            toml::from_str(raw).map_err(|e| FabricError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a config file. Failures are hard errors; there is no
    /// best-effort fallback.
    pub fn load(path: &std::path::Path) -> FabricResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FabricError::Config(format!("cannot read config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Resolve the signing secret from the environment variable named in the
    /// config.
    pub fn resolve_secret(&self) -> FabricResult<SecretKey> {
        SecretKey::from_env(&self.secret_env)
    }

    fn validate(&self) -> FabricResult<()> {
        if self.node_id.is_empty() {
            return Err(FabricError::Config("node_id must not be empty".into()));
        }
        if self.protocol_version != PROTOCOL_VERSION {
            return Err(FabricError::Config(format!(
                "unsupported protocol_version {} (this build speaks {})",
                self.protocol_version, PROTOCOL_VERSION
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let raw = r#"
            node_id = "n0"
            node_name = "primary"
            secret_env = "VERITOR_SECRET"
        "#;
        let config = NodeConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.quorum_threshold, 2);
        assert_eq!(config.quota.max_steps, 10);
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn rejects_unknown_protocol_version() {
        let raw = r#"
            node_id = "n0"
            node_name = "primary"
            secret_env = "VERITOR_SECRET"
            protocol_version = "0.9"
        "#;
        let err = NodeConfig::from_toml_str(raw).unwrap_err();
        assert_eq!(err.kind(), "config_error");
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = SecretKey::from_bytes(b"super-secret".to_vec());
        assert_eq!(format!("{:?}", secret), "SecretKey(<redacted>)");
    }
}
