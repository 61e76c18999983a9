//! Saga engine core: definitions, orchestration, retries, and compensation.
//!
//! - `definition` -- YAML/JSON parsing, structural validation, file loading
//! - `graph` -- compiled DAG (petgraph) with single-start/reachability/acyclicity checks
//! - `store` -- versioned definition store with compiled-graph cache
//! - `action` -- action handler trait, object-safe wrapper, and registry
//! - `authz` -- opaque permission check before each invocation
//! - `expression` -- JEXL evaluator for decision conditions
//! - `context` -- instance context merging and configuration templating
//! - `state` -- guarded instance status transitions
//! - `orchestrator` -- graph walker and per-instance single-writer execution
//! - `retry` -- backoff policy, work queue, and retry scheduler
//! - `compensation` -- reverse-order compensation coordinator
//! - `query` -- read-only execution projection plus manual retry enqueue
//! - `engine` -- worker pool and startup recovery

pub mod action;
pub mod authz;
pub mod compensation;
pub mod context;
pub mod definition;
pub mod engine;
pub mod expression;
pub mod graph;
pub mod orchestrator;
pub mod query;
pub mod retry;
pub mod state;
pub mod store;

#[cfg(test)]
mod scenarios;
#[cfg(test)]
pub(crate) mod testing;
