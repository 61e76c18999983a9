//! `core.echo`: returns its resolved configuration as the step result.
//!
//! Object configurations are merged into the instance context key by key,
//! which makes `core.echo` the simplest way to seed values for later
//! decisions. It is compensable; undoing it only logs.

use sagaflow_core::workflow::action::{
    ActionCategory, ActionDescriptor, ActionError, ActionHandler, ActionInvocation,
    CompensationRequest, ConfigSchema,
};
use serde_json::Value;

pub struct EchoAction {
    descriptor: ActionDescriptor,
}

impl EchoAction {
    pub fn new() -> Self {
        Self {
            descriptor: ActionDescriptor {
                key: "core.echo".to_string(),
                name: "Echo".to_string(),
                category: ActionCategory::Operations,
                required_permission: "core.echo".to_string(),
                config_schema: ConfigSchema::default(),
                compensable: true,
            },
        }
    }
}

impl Default for EchoAction {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionHandler for EchoAction {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, invocation: &ActionInvocation) -> Result<Value, ActionError> {
        tracing::debug!(
            instance_id = %invocation.instance_id,
            step_id = %invocation.step_id,
            "echo"
        );
        Ok(invocation.configuration.clone())
    }

    async fn compensate(&self, request: &CompensationRequest) -> Result<(), ActionError> {
        tracing::info!(
            instance_id = %request.instance_id,
            step_id = %request.step_id,
            result = %request.result_data,
            "echo compensated"
        );
        Ok(())
    }
}
