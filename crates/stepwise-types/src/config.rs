//! Engine configuration types for Stepwise.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls worker
//! concurrency, sweep cadence, retry backoff and approval defaults.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.stepwise/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum concurrent `advance()` calls in the worker pool.
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Capacity of the worker queue of instance ids.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Seconds between timeout sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// TTL of a cross-process instance lease.
    #[serde(default = "default_lock_lease_secs")]
    pub lock_lease_secs: u64,

    /// Action handler timeout when a step declares none.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub approvals: ApprovalDefaults,

    /// Role name -> ordered approver identities.
    #[serde(default)]
    pub roles: HashMap<String, Vec<String>>,
}

fn default_worker_concurrency() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    256
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_lock_lease_secs() -> u64 {
    300
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_concurrency: default_worker_concurrency(),
            queue_capacity: default_queue_capacity(),
            sweep_interval_secs: default_sweep_interval_secs(),
            lock_lease_secs: default_lock_lease_secs(),
            default_step_timeout_secs: default_step_timeout_secs(),
            event_capacity: default_event_capacity(),
            retry: RetryConfig::default(),
            approvals: ApprovalDefaults::default(),
            roles: HashMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_secs(self.lock_lease_secs)
    }

    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }
}

/// Exponential backoff parameters for step retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Ceiling for a single retry delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    300_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

/// Defaults applied to approval steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDefaults {
    /// Deadline when an approval step declares no timeout.
    #[serde(default = "default_approval_timeout_secs")]
    pub default_timeout_secs: u64,
    /// Assignee once a step's escalation chain is exhausted.
    #[serde(default = "default_fallback_approver")]
    pub fallback_approver: String,
}

fn default_approval_timeout_secs() -> u64 {
    86_400
}

fn default_fallback_approver() -> String {
    "workflow-admin".to_string()
}

impl Default for ApprovalDefaults {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_approval_timeout_secs(),
            fallback_approver: default_fallback_approver(),
        }
    }
}
