//! Built-in actions shipped with the `sagaflow` binary.
//!
//! Business capabilities (HR, finance) are registered by embedders; these
//! cover the plumbing needed to run and test definitions stand-alone.

pub mod delay;
pub mod echo;
pub mod fail;
pub mod notify;

use sagaflow_core::workflow::action::{ActionRegistry, RegistryError};

pub use delay::DelayAction;
pub use echo::EchoAction;
pub use fail::FailAction;
pub use notify::LogNotifyAction;

/// Register every built-in action.
pub fn register_builtin_actions(registry: &mut ActionRegistry) -> Result<(), RegistryError> {
    registry.register(EchoAction::new())?;
    registry.register(DelayAction::new())?;
    registry.register(FailAction::new())?;
    registry.register(LogNotifyAction::new())?;
    Ok(())
}
