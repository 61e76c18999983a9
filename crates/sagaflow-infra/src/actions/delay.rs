//! `core.delay`: sleeps for `millis` milliseconds, then succeeds.

use std::time::Duration;

use sagaflow_core::workflow::action::{
    ActionCategory, ActionDescriptor, ActionError, ActionHandler, ActionInvocation, ConfigField,
    ConfigSchema, FieldKind, codes,
};
use serde_json::{Value, json};

/// Longest sleep accepted; anything above is clamped.
const MAX_DELAY_MS: u64 = 60 * 60 * 1000;

pub struct DelayAction {
    descriptor: ActionDescriptor,
}

impl DelayAction {
    pub fn new() -> Self {
        Self {
            descriptor: ActionDescriptor {
                key: "core.delay".to_string(),
                name: "Delay".to_string(),
                category: ActionCategory::Operations,
                required_permission: "core.delay".to_string(),
                config_schema: ConfigSchema::new(vec![ConfigField::required(
                    "millis",
                    FieldKind::Integer,
                )])
                .strict(),
                compensable: false,
            },
        }
    }
}

impl Default for DelayAction {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionHandler for DelayAction {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, invocation: &ActionInvocation) -> Result<Value, ActionError> {
        let millis = invocation
            .configuration
            .get("millis")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                ActionError::fatal(
                    codes::INVALID_CONFIGURATION,
                    "'millis' must be a non-negative integer",
                )
            })?
            .min(MAX_DELAY_MS);

        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(json!({ invocation.step_id.as_str(): { "slept_ms": millis } }))
    }
}
