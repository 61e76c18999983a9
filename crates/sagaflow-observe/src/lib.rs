//! Observability setup for Sagaflow: structured logging with an optional
//! OpenTelemetry bridge.

pub mod tracing_setup;
