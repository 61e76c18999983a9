//! Infrastructure layer for Sagaflow.
//!
//! Implements the repository trait defined in `sagaflow-core` on SQLite,
//! loads `config.toml`, resolves the data directory, and ships the
//! built-in actions registered by the binary.

pub mod actions;
pub mod config;
pub mod filesystem;
pub mod sqlite;
