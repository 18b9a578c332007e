//! Execution quotas.
//!
//! Resource limits for one sandboxed execution: step count, wall time and
//! capability calls, plus the cpu/memory ceilings checked up front. Quotas
//! only decrease during an execution and reset when the sandbox starts a new
//! one.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::canonical::hash_value;
use crate::config::QuotaConfig;
use crate::errors::QuotaExceeded;

/// Limits an execution must stay within.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLimits {
    pub max_steps: u64,
    pub max_time_ms: u64,
    pub max_capability_calls: u64,
    pub cpu_seconds: u64,
    pub memory_mb: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        QuotaConfig::default().into()
    }
}

impl From<QuotaConfig> for QuotaLimits {
    fn from(config: QuotaConfig) -> Self {
        Self {
            max_steps: config.max_steps,
            max_time_ms: config.max_time_ms,
            max_capability_calls: config.max_capability_calls,
            cpu_seconds: config.cpu_seconds,
            memory_mb: config.memory_mb,
        }
    }
}

/// Mutable quota state for one execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaState {
    pub steps_used: u64,
    pub time_used_ms: u64,
    pub capability_calls_used: u64,
}

/// Tracks consumption against [`QuotaLimits`] during one execution.
#[derive(Debug, Clone)]
pub struct ExecutionQuota {
    limits: QuotaLimits,
    state: QuotaState,
    violations: Vec<String>,
}

impl ExecutionQuota {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits,
            state: QuotaState::default(),
            violations: Vec::new(),
        }
    }

    /// Reset consumption for a fresh execution.
    pub fn start(&mut self) {
        self.state = QuotaState::default();
        self.violations.clear();
    }

    pub fn limits(&self) -> &QuotaLimits {
        &self.limits
    }

    pub fn state(&self) -> &QuotaState {
        &self.state
    }

    /// Up-front admission check against the cpu/memory ceilings.
    pub fn admit(&self, cpu_seconds: u64, memory_mb: u64) -> Result<(), QuotaExceeded> {
        if cpu_seconds > self.limits.cpu_seconds {
            return Err(QuotaExceeded::Cpu {
                requested: cpu_seconds,
                available: self.limits.cpu_seconds,
            });
        }
        if memory_mb > self.limits.memory_mb {
            return Err(QuotaExceeded::Memory {
                requested_mb: memory_mb,
                available_mb: self.limits.memory_mb,
            });
        }
        Ok(())
    }

    pub fn record_step(&mut self) -> Result<(), QuotaExceeded> {
        self.state.steps_used += 1;
        if self.state.steps_used > self.limits.max_steps {
            self.violations.push("max_steps_exceeded".into());
            return Err(QuotaExceeded::Steps {
                used: self.state.steps_used,
                limit: self.limits.max_steps,
            });
        }
        Ok(())
    }

    pub fn record_capability_call(&mut self) -> Result<(), QuotaExceeded> {
        self.state.capability_calls_used += 1;
        if self.state.capability_calls_used > self.limits.max_capability_calls {
            self.violations.push("max_capability_calls_exceeded".into());
            return Err(QuotaExceeded::CapabilityCalls {
                used: self.state.capability_calls_used,
                limit: self.limits.max_capability_calls,
            });
        }
        Ok(())
    }

    /// Record elapsed wall time and check the budget.
    pub fn check_time(&mut self, elapsed_ms: u64) -> Result<(), QuotaExceeded> {
        self.state.time_used_ms = elapsed_ms;
        if elapsed_ms > self.limits.max_time_ms {
            self.violations.push("max_time_exceeded".into());
            return Err(QuotaExceeded::Time {
                elapsed_ms,
                limit_ms: self.limits.max_time_ms,
            });
        }
        Ok(())
    }

    pub fn remaining_steps(&self) -> u64 {
        self.limits.max_steps.saturating_sub(self.state.steps_used)
    }

    pub fn remaining_time_ms(&self) -> u64 {
        self.limits.max_time_ms.saturating_sub(self.state.time_used_ms)
    }

    pub fn remaining_capability_calls(&self) -> u64 {
        self.limits
            .max_capability_calls
            .saturating_sub(self.state.capability_calls_used)
    }

    pub fn violations(&self) -> &[String] {
        &self.violations
    }

    /// Deterministic hash of the quota state. Wall time is excluded: it
    /// varies across nodes and must never enter a replay-compared digest.
    pub fn state_hash(&self) -> String {
        let mut violations = self.violations.clone();
        violations.sort();
        hash_value(&json!({
            "steps_used": self.state.steps_used,
            "capability_calls_used": self.state.capability_calls_used,
            "violations": violations,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_limits() -> QuotaLimits {
        QuotaLimits {
            max_steps: 2,
            max_time_ms: 100,
            max_capability_calls: 3,
            cpu_seconds: 5,
            memory_mb: 64,
        }
    }

    #[test]
    fn steps_fail_beyond_limit() {
        let mut quota = ExecutionQuota::new(tight_limits());
        quota.start();
        quota.record_step().unwrap();
        quota.record_step().unwrap();
        let err = quota.record_step().unwrap_err();
        assert!(matches!(err, QuotaExceeded::Steps { used: 3, limit: 2 }));
        assert_eq!(quota.violations(), ["max_steps_exceeded"]);
    }

    #[test]
    fn start_resets_consumption() {
        let mut quota = ExecutionQuota::new(tight_limits());
        quota.start();
        quota.record_step().unwrap();
        quota.start();
        assert_eq!(quota.remaining_steps(), 2);
        assert!(quota.violations().is_empty());
    }

    #[test]
    fn admission_checks_cpu_and_memory() {
        let quota = ExecutionQuota::new(tight_limits());
        assert!(quota.admit(5, 64).is_ok());
        assert!(matches!(
            quota.admit(6, 64),
            Err(QuotaExceeded::Cpu { .. })
        ));
        assert!(matches!(
            quota.admit(1, 128),
            Err(QuotaExceeded::Memory { .. })
        ));
    }

    #[test]
    fn state_hash_ignores_wall_time() {
        let mut a = ExecutionQuota::new(tight_limits());
        let mut b = ExecutionQuota::new(tight_limits());
        a.start();
        b.start();
        a.record_step().unwrap();
        b.record_step().unwrap();
        a.check_time(10).unwrap();
        b.check_time(90).unwrap();
        assert_eq!(a.state_hash(), b.state_hash());
    }
}
