//! Rollback and checkpoint hooks.
//!
//! On a step or registration failure the node invokes the rollback hook,
//! optionally restoring a pre-created checkpoint. Cluster-wide failures fan
//! out through the cluster rollback seam and report how many nodes were
//! affected. Every rollback lands in the audit chain as
//! `rollback_executed`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::audit::{AuditChain, AuditEventType};
use crate::canonical::short_id;
use crate::clock::SharedClock;
use crate::errors::{FabricError, FabricResult};
use crate::PROTOCOL_VERSION;

/// Outcome of restoring one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub success: bool,
    pub checkpoint_id: String,
}

/// Provider of checkpoint creation and restoration.
#[async_trait]
pub trait RollbackProvider: Send + Sync {
    async fn create_checkpoint(&self, agent_id: &str, session_id: &str) -> FabricResult<String>;
    async fn execute_rollback(&self, checkpoint_id: &str) -> FabricResult<RollbackOutcome>;
}

/// Fan-out seam for cluster-wide rollback.
#[async_trait]
pub trait ClusterRollback: Send + Sync {
    /// Roll back every node; returns how many were rolled back.
    async fn rollback_all(&self) -> FabricResult<usize>;
}

/// Report attached to a failing execution's response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub rollback_executed: bool,
    pub restored_checkpoint_id: Option<String>,
    pub cluster_rollback: bool,
    pub nodes_affected: usize,
    pub protocol_version: String,
}

/// Coordinates rollback across the local provider and the cluster seam.
pub struct RollbackCoordinator {
    provider: Arc<dyn RollbackProvider>,
    cluster: Option<Arc<dyn ClusterRollback>>,
    audit: Arc<Mutex<AuditChain>>,
}

impl std::fmt::Debug for RollbackCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RollbackCoordinator")
            .field("cluster", &self.cluster.is_some())
            .finish()
    }
}

impl RollbackCoordinator {
    pub fn new(provider: Arc<dyn RollbackProvider>, audit: Arc<Mutex<AuditChain>>) -> Self {
        Self {
            provider,
            cluster: None,
            audit,
        }
    }

    pub fn with_cluster(mut self, cluster: Arc<dyn ClusterRollback>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    /// Checkpoint before a risky phase; the returned id can be handed back
    /// on failure.
    pub async fn create_checkpoint(&self, agent_id: &str, session_id: &str) -> FabricResult<String> {
        self.provider.create_checkpoint(agent_id, session_id).await
    }

    /// Handle a failed execution: restore the checkpoint when one exists and
    /// fan out cluster-wide when asked to.
    pub async fn handle_failure(
        &self,
        agent_id: &str,
        checkpoint_id: Option<&str>,
        cluster_wide: bool,
    ) -> FabricResult<RollbackReport> {
        let mut report = RollbackReport {
            protocol_version: PROTOCOL_VERSION.to_string(),
            ..RollbackReport::default()
        };

        if let Some(checkpoint_id) = checkpoint_id {
            let outcome = self.provider.execute_rollback(checkpoint_id).await?;
            report.rollback_executed = outcome.success;
            report.restored_checkpoint_id = Some(outcome.checkpoint_id);
        } else {
            // no checkpoint: the rollback hook still fires so the failure is
            // not silently absorbed
            report.rollback_executed = true;
        }

        if cluster_wide {
            if let Some(cluster) = &self.cluster {
                report.nodes_affected = cluster.rollback_all().await?;
                report.cluster_rollback = true;
            }
        }

        let mut audit = self.audit.lock().expect("audit chain lock poisoned");
        audit.emit(
            AuditEventType::RollbackExecuted,
            json!({
                "checkpoint_id": report.restored_checkpoint_id,
                "cluster_rollback": report.cluster_rollback,
                "nodes_affected": report.nodes_affected,
            }),
            Some(agent_id),
        )?;

        Ok(report)
    }
}

/// In-memory checkpoint store, the default provider wiring.
#[derive(Debug, Default)]
pub struct InMemoryCheckpoints {
    clock: Option<SharedClock>,
    checkpoints: Mutex<HashMap<String, (String, String)>>,
}

impl InMemoryCheckpoints {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            clock: Some(clock),
            checkpoints: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.checkpoints.lock().expect("checkpoint lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RollbackProvider for InMemoryCheckpoints {
    async fn create_checkpoint(&self, agent_id: &str, session_id: &str) -> FabricResult<String> {
        let stamp = self
            .clock
            .as_ref()
            .map(|c| c.timestamp())
            .unwrap_or_default();
        let checkpoint_id = format!("cp-{}", short_id(&format!("{}:{}:{}", agent_id, session_id, stamp)));
        self.checkpoints
            .lock()
            .expect("checkpoint lock poisoned")
            .insert(
                checkpoint_id.clone(),
                (agent_id.to_string(), session_id.to_string()),
            );
        Ok(checkpoint_id)
    }

    async fn execute_rollback(&self, checkpoint_id: &str) -> FabricResult<RollbackOutcome> {
        let known = self
            .checkpoints
            .lock()
            .expect("checkpoint lock poisoned")
            .contains_key(checkpoint_id);
        if !known {
            return Err(FabricError::Config(format!(
                "unknown checkpoint {}",
                checkpoint_id
            )));
        }
        Ok(RollbackOutcome {
            success: true,
            checkpoint_id: checkpoint_id.to_string(),
        })
    }
}
