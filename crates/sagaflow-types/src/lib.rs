//! Shared domain types for Sagaflow.
//!
//! This crate contains the domain types used across the engine: workflow
//! definitions (nodes + edges), instances, step executions, retry requests,
//! engine events, configuration, and their associated error types.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod definition;
pub mod error;
pub mod event;
pub mod instance;
pub mod step;
