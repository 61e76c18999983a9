//! `core.fail`: always fails with the configured error.
//!
//! Configuration:
//! - `code` (default `ACTION_FAILED`)
//! - `message` (default "configured failure")
//! - `retryable` (default `true`)

use sagaflow_core::workflow::action::{
    ActionCategory, ActionDescriptor, ActionError, ActionHandler, ActionInvocation, ConfigField,
    ConfigSchema, FieldKind, codes,
};
use serde_json::Value;

pub struct FailAction {
    descriptor: ActionDescriptor,
}

impl FailAction {
    pub fn new() -> Self {
        Self {
            descriptor: ActionDescriptor {
                key: "core.fail".to_string(),
                name: "Fail".to_string(),
                category: ActionCategory::Operations,
                required_permission: "core.fail".to_string(),
                config_schema: ConfigSchema::new(vec![
                    ConfigField::optional("code", FieldKind::String),
                    ConfigField::optional("message", FieldKind::String),
                    ConfigField::optional("retryable", FieldKind::Boolean),
                ])
                .strict(),
                compensable: false,
            },
        }
    }
}

impl Default for FailAction {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionHandler for FailAction {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, invocation: &ActionInvocation) -> Result<Value, ActionError> {
        let config = &invocation.configuration;
        let code = config
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or(codes::ACTION_FAILED);
        let message = config
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("configured failure");
        let retryable = config
            .get("retryable")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        Err(ActionError {
            code: code.to_string(),
            message: message.to_string(),
            retryable,
        })
    }
}
