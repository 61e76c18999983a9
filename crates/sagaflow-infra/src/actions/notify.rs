//! `notify.log`: a notification sink that writes to the log.

use sagaflow_core::workflow::action::{
    ActionCategory, ActionDescriptor, ActionError, ActionHandler, ActionInvocation, ConfigField,
    ConfigSchema, FieldKind,
};
use serde_json::{Value, json};

pub struct LogNotifyAction {
    descriptor: ActionDescriptor,
}

impl LogNotifyAction {
    pub fn new() -> Self {
        Self {
            descriptor: ActionDescriptor {
                key: "notify.log".to_string(),
                name: "Log notification".to_string(),
                category: ActionCategory::Notification,
                required_permission: "notify.send".to_string(),
                config_schema: ConfigSchema::new(vec![
                    ConfigField::required("message", FieldKind::String),
                    ConfigField::optional("recipient", FieldKind::String),
                ]),
                compensable: false,
            },
        }
    }
}

impl Default for LogNotifyAction {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionHandler for LogNotifyAction {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, invocation: &ActionInvocation) -> Result<Value, ActionError> {
        let message = invocation
            .configuration
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let recipient = invocation
            .configuration
            .get("recipient")
            .and_then(Value::as_str)
            .unwrap_or("default");

        tracing::info!(
            instance_id = %invocation.instance_id,
            step_id = %invocation.step_id,
            recipient,
            message,
            "notification"
        );
        Ok(json!({ invocation.step_id.as_str(): { "notified": recipient } }))
    }
}
