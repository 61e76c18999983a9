//! Configuration types for Sagaflow.
//!
//! `SagaflowConfig` represents the top-level `config.toml` in the data
//! directory. Every field has a default, so an empty or missing file yields
//! a working engine.

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SagaflowConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub retry: RetryPolicyConfig,
    #[serde(default)]
    pub authorization: AuthorizationConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

/// Worker pool and per-step defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Number of concurrent workers pulling from the work queue.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Attempts allowed for action nodes that do not set `max_retries`.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
    /// Per-attempt timeout for action nodes that do not set `timeout_secs`.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,
    /// Broadcast channel capacity for engine events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Lifetime of an instance execution lease. A lease held by an engine
    /// that died is taken over by another engine after this long.
    #[serde(default = "default_lease_ttl_secs")]
    pub lease_ttl_secs: u64,
}

fn default_worker_count() -> usize {
    4
}

fn default_max_retries() -> u32 {
    3
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_event_capacity() -> usize {
    1024
}

fn default_lease_ttl_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            default_max_retries: default_max_retries(),
            step_timeout_secs: default_step_timeout_secs(),
            event_capacity: default_event_capacity(),
            lease_ttl_secs: default_lease_ttl_secs(),
        }
    }
}

/// Exponential backoff parameters for automatic retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    /// Delay before the first automatic retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on the backoff delay (before jitter).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter as a fraction of the delay, applied in both directions.
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    /// Delay before re-offering a retry whose instance was busy.
    #[serde(default = "default_busy_requeue_ms")]
    pub busy_requeue_ms: u64,
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter_ratio() -> f64 {
    0.2
}

fn default_busy_requeue_ms() -> u64 {
    50
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_ratio: default_jitter_ratio(),
            busy_requeue_ms: default_busy_requeue_ms(),
        }
    }
}

/// Permissions granted to the engine when invoking actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    /// Granted permission tags. `"*"` grants everything.
    #[serde(default = "default_granted")]
    pub granted: Vec<String>,
}

fn default_granted() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            granted: default_granted(),
        }
    }
}

/// REST API listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}
