//! Action handlers and the action registry.
//!
//! An action is an invocable capability (record a leave request, post a
//! journal entry, send a notification). The engine never implements
//! capabilities itself: it resolves an `action_key` to a registered handler,
//! invokes it with resolved configuration plus the instance context, and
//! calls its compensating operation when a saga unwinds.
//!
//! `ActionHandler` uses RPITIT and is therefore not object safe. The
//! registry stores handlers as [`BoxActionHandler`], following the same
//! blanket-impl pattern as the other boxed ports:
//! 1. Define an object-safe `ActionHandlerDyn` trait with boxed futures
//! 2. Blanket-impl `ActionHandlerDyn` for all `T: ActionHandler`
//! 3. `BoxActionHandler` wraps `Box<dyn ActionHandlerDyn>` and delegates

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use sagaflow_types::definition::WorkflowDefinition;
use sagaflow_types::step::ErrorDetails;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::context::is_template;
use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// Error codes
// ---------------------------------------------------------------------------

/// Machine-readable error codes recorded on step executions and instances.
pub mod codes {
    pub const ACTION_FAILED: &str = "ACTION_FAILED";
    pub const AUTHORIZATION_DENIED: &str = "AUTHORIZATION_DENIED";
    pub const COMPENSATION_FAILED: &str = "COMPENSATION_FAILED";
    pub const INTERRUPTED: &str = "INTERRUPTED";
    pub const INVALID_CONFIGURATION: &str = "INVALID_CONFIGURATION";
    pub const NO_MATCHING_BRANCH: &str = "NO_MATCHING_BRANCH";
    pub const RESULT_TOO_LARGE: &str = "RESULT_TOO_LARGE";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const UNKNOWN_ACTION: &str = "UNKNOWN_ACTION";
    pub const UNKNOWN_NODE: &str = "UNKNOWN_NODE";
}

/// Error returned by an action invocation or compensation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ActionError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

impl ActionError {
    /// A transient failure. The engine may re-attempt the step.
    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure. The step fails terminally.
    pub fn fatal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
        }
    }

    /// Generic retryable capability failure.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::retryable(codes::ACTION_FAILED, message)
    }
}

impl From<ActionError> for ErrorDetails {
    fn from(err: ActionError) -> Self {
        ErrorDetails {
            code: err.code,
            message: err.message,
            retryable: err.retryable,
        }
    }
}

// ---------------------------------------------------------------------------
// Descriptors and configuration schema
// ---------------------------------------------------------------------------

/// Business category an action belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionCategory {
    Hr,
    Finance,
    Operations,
    Notification,
    Custom,
}

/// Expected JSON kind of a configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        // Placeholders are resolved at invocation time, so any kind is possible.
        if value.as_str().is_some_and(is_template) {
            return true;
        }
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }
}

/// One field of an action's configuration schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    pub kind: FieldKind,
    #[serde(default)]
    pub required: bool,
}

impl ConfigField {
    pub fn required(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            required: false,
        }
    }
}

/// Configuration schema for an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSchema {
    pub fields: Vec<ConfigField>,
    /// Whether keys not listed in `fields` are accepted.
    #[serde(default = "default_allow_additional")]
    pub allow_additional: bool,
}

fn default_allow_additional() -> bool {
    true
}

impl Default for ConfigSchema {
    fn default() -> Self {
        Self {
            fields: Vec::new(),
            allow_additional: true,
        }
    }
}

impl ConfigSchema {
    pub fn new(fields: Vec<ConfigField>) -> Self {
        Self {
            fields,
            allow_additional: true,
        }
    }

    /// Reject configuration keys not listed in the schema.
    pub fn strict(mut self) -> Self {
        self.allow_additional = false;
        self
    }

    /// Validate a configuration object. `null` is treated as `{}`.
    pub fn validate(&self, configuration: &Value) -> Result<(), String> {
        let empty = serde_json::Map::new();
        let map = match configuration {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => return Err(format!("configuration must be an object, got {other}")),
        };

        for field in &self.fields {
            match map.get(&field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(format!("missing required field '{}'", field.name));
                }
                Some(value) if !value.is_null() && !field.kind.accepts(value) => {
                    return Err(format!(
                        "field '{}' must be of kind {:?}",
                        field.name, field.kind
                    ));
                }
                _ => {}
            }
        }

        if !self.allow_additional {
            if let Some(unknown) = map
                .keys()
                .find(|k| !self.fields.iter().any(|f| &f.name == *k))
            {
                return Err(format!("unknown field '{unknown}'"));
            }
        }
        Ok(())
    }
}

/// Static description of a registered action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    pub key: String,
    pub name: String,
    pub category: ActionCategory,
    /// Capability tag checked by the authorizer before every invocation.
    pub required_permission: String,
    pub config_schema: ConfigSchema,
    /// Whether the action has a compensating operation.
    pub compensable: bool,
}

// ---------------------------------------------------------------------------
// Invocation payloads
// ---------------------------------------------------------------------------

/// Input to one action attempt.
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    pub instance_id: Uuid,
    pub step_id: String,
    pub attempt: u32,
    /// Configuration with placeholders already resolved.
    pub configuration: Value,
    /// Snapshot of the instance context.
    pub context: Value,
}

/// Input to a compensating call.
#[derive(Debug, Clone)]
pub struct CompensationRequest {
    pub instance_id: Uuid,
    pub step_id: String,
    /// The result of the completed attempt being undone.
    pub result_data: Value,
    /// The node's configuration as declared (unresolved).
    pub configuration: Value,
}

// ---------------------------------------------------------------------------
// ActionHandler trait
// ---------------------------------------------------------------------------

/// An invocable capability.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait ActionHandler: Send + Sync {
    /// Static metadata (key, category, permission, schema).
    fn descriptor(&self) -> &ActionDescriptor;

    /// Run the capability. The returned value becomes the step's result.
    fn invoke(
        &self,
        invocation: &ActionInvocation,
    ) -> impl Future<Output = Result<Value, ActionError>> + Send;

    /// Undo the effect of a completed invocation.
    fn compensate(
        &self,
        request: &CompensationRequest,
    ) -> impl Future<Output = Result<(), ActionError>> + Send {
        let _ = request;
        async { Ok(()) }
    }
}

/// Object-safe version of [`ActionHandler`] with boxed futures.
pub trait ActionHandlerDyn: Send + Sync {
    fn descriptor(&self) -> &ActionDescriptor;

    fn invoke_boxed<'a>(
        &'a self,
        invocation: &'a ActionInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send + 'a>>;

    fn compensate_boxed<'a>(
        &'a self,
        request: &'a CompensationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>>;
}

/// Blanket implementation: any `ActionHandler` automatically implements `ActionHandlerDyn`.
impl<T: ActionHandler> ActionHandlerDyn for T {
    fn descriptor(&self) -> &ActionDescriptor {
        ActionHandler::descriptor(self)
    }

    fn invoke_boxed<'a>(
        &'a self,
        invocation: &'a ActionInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<Value, ActionError>> + Send + 'a>> {
        Box::pin(self.invoke(invocation))
    }

    fn compensate_boxed<'a>(
        &'a self,
        request: &'a CompensationRequest,
    ) -> Pin<Box<dyn Future<Output = Result<(), ActionError>> + Send + 'a>> {
        Box::pin(self.compensate(request))
    }
}

/// Type-erased action handler stored in the registry.
pub struct BoxActionHandler {
    inner: Box<dyn ActionHandlerDyn + Send + Sync>,
}

impl BoxActionHandler {
    pub fn new<T: ActionHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Box::new(handler),
        }
    }

    pub fn descriptor(&self) -> &ActionDescriptor {
        self.inner.descriptor()
    }

    pub fn supports_compensation(&self) -> bool {
        self.inner.descriptor().compensable
    }

    pub async fn invoke(&self, invocation: &ActionInvocation) -> Result<Value, ActionError> {
        self.inner.invoke_boxed(invocation).await
    }

    pub async fn compensate(&self, request: &CompensationRequest) -> Result<(), ActionError> {
        self.inner.compensate_boxed(request).await
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Errors from registry mutation.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("action '{0}' is already registered")]
    Duplicate(String),
}

/// Catalog of invocable actions keyed by `action_key`.
///
/// Built once at startup and shared immutably (`Arc<ActionRegistry>`).
#[derive(Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, BoxActionHandler>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under its descriptor key.
    pub fn register<T: ActionHandler + 'static>(&mut self, handler: T) -> Result<(), RegistryError> {
        let key = ActionHandler::descriptor(&handler).key.clone();
        if self.handlers.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        tracing::debug!(action_key = %key, "registered action");
        self.handlers.insert(key, BoxActionHandler::new(handler));
        Ok(())
    }

    pub fn get(&self, action_key: &str) -> Option<&BoxActionHandler> {
        self.handlers.get(action_key)
    }

    pub fn descriptor(&self, action_key: &str) -> Option<&ActionDescriptor> {
        self.handlers.get(action_key).map(|h| h.descriptor())
    }

    /// The permission tag required to invoke an action.
    pub fn required_permission(&self, action_key: &str) -> Option<&str> {
        self.descriptor(action_key)
            .map(|d| d.required_permission.as_str())
    }

    /// All descriptors, sorted by key.
    pub fn list(&self) -> Vec<&ActionDescriptor> {
        let mut descriptors: Vec<&ActionDescriptor> =
            self.handlers.values().map(|h| h.descriptor()).collect();
        descriptors.sort_by(|a, b| a.key.cmp(&b.key));
        descriptors
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Check every action node references a known action and that its
    /// configuration matches the action's schema.
    pub fn validate_definition(&self, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
        for (node, action) in def.action_nodes() {
            let descriptor = self.descriptor(&action.action_key).ok_or_else(|| {
                WorkflowError::UnknownAction(format!(
                    "node '{}' uses unregistered action '{}'",
                    node.id, action.action_key
                ))
            })?;
            descriptor
                .config_schema
                .validate(&action.configuration)
                .map_err(|message| WorkflowError::InvalidConfiguration {
                    node: node.id.clone(),
                    message,
                })?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
