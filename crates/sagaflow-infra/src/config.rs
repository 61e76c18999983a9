//! Configuration loader for Sagaflow.
//!
//! Reads `config.toml` from the data directory (`~/.sagaflow/` in production)
//! and deserializes it into [`SagaflowConfig`]. Falls back to defaults when
//! the file is missing or malformed.

use std::path::Path;

use sagaflow_types::config::SagaflowConfig;

/// Load configuration from `{data_dir}/config.toml`.
///
/// - Missing file: [`SagaflowConfig::default()`].
/// - Unreadable or unparsable file: logs a warning and returns the default.
/// - Otherwise the parsed config, with out-of-range values clamped.
pub async fn load_config(data_dir: &Path) -> SagaflowConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return SagaflowConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return SagaflowConfig::default();
        }
    };

    match toml::from_str::<SagaflowConfig>(&content) {
        Ok(config) => normalize(config),
        Err(err) => {
            tracing::warn!(
                "Failed to parse {}: {err}, using defaults",
                config_path.display()
            );
            SagaflowConfig::default()
        }
    }
}

/// Clamp values the engine cannot run with.
pub fn normalize(mut config: SagaflowConfig) -> SagaflowConfig {
    config.engine.worker_count = config.engine.worker_count.max(1);
    config.engine.default_max_retries = config.engine.default_max_retries.max(1);
    config.engine.step_timeout_secs = config.engine.step_timeout_secs.max(1);
    config.engine.event_capacity = config.engine.event_capacity.max(16);
    config.engine.lease_ttl_secs = config.engine.lease_ttl_secs.max(3);

    let retry = &mut config.retry;
    retry.max_delay_ms = retry.max_delay_ms.max(retry.base_delay_ms);
    if !retry.jitter_ratio.is_finite() {
        retry.jitter_ratio = 0.0;
    }
    retry.jitter_ratio = retry.jitter_ratio.clamp(0.0, 1.0);
    config
}
