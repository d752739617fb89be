//! Engine configuration types for mdflow.
//!
//! `EngineConfig` represents the `config.toml` under the data directory.
//! Every field has a default, so an empty file (or no file) is valid.

use serde::{Deserialize, Serialize};

use crate::workflow::BackoffStrategy;

/// Engine-wide defaults. Per-step `errorHandling` overrides the retry fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Retries for steps that do not set `maxRetries`.
    #[serde(default)]
    pub max_retries: u32,

    /// Base retry delay for steps without `retryDelaySeconds`.
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,

    /// Upper bound for any computed backoff delay.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    #[serde(default)]
    pub default_backoff: BackoffStrategy,

    /// Per-attempt timeout for steps without their own `timeout`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_step_timeout_secs: Option<u64>,

    #[serde(default = "default_max_sub_workflow_depth")]
    pub max_sub_workflow_depth: u32,

    /// Concurrency for parallel steps without `maxConcurrent`.
    #[serde(default = "default_max_parallel_branches")]
    pub max_parallel_branches: usize,

    #[serde(default = "default_rollback_max_history")]
    pub rollback_max_history: usize,

    /// Run the compensation registry when a workflow fails.
    #[serde(default)]
    pub rollback_on_failure: bool,

    #[serde(default = "default_checkpoint_retention_days")]
    pub checkpoint_retention_days: u32,

    /// Absent means the breaker is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

fn default_retry_base_delay_ms() -> u64 {
    1_000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_max_sub_workflow_depth() -> u32 {
    5
}

fn default_max_parallel_branches() -> usize {
    8
}

fn default_rollback_max_history() -> usize {
    100
}

fn default_checkpoint_retention_days() -> u32 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            default_backoff: BackoffStrategy::Fixed,
            default_step_timeout_secs: None,
            max_sub_workflow_depth: default_max_sub_workflow_depth(),
            max_parallel_branches: default_max_parallel_branches(),
            rollback_max_history: default_rollback_max_history(),
            rollback_on_failure: false,
            checkpoint_retention_days: default_checkpoint_retention_days(),
            circuit_breaker: None,
        }
    }
}

/// Thresholds for the per-action circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Seconds an open circuit waits before allowing a trial call.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}
