//! Saga execution engine and repository trait definitions for Sagaflow.
//!
//! This crate defines the "ports" (repository and action traits) that the
//! infrastructure layer implements, plus the engine itself: graph
//! compilation, orchestration, retry scheduling, and compensation. It
//! depends only on `sagaflow-types` -- never on `sagaflow-infra` or any
//! database/IO crate.

pub mod event;
pub mod repository;
pub mod workflow;
