//! Workflow repository trait definition.
//!
//! Defines the storage interface for the three durable tables:
//! `workflow_definitions`, `workflow_instances`, and `step_executions`.
//! The infrastructure layer (sagaflow-infra) implements this trait with
//! SQLite persistence; `memory::InMemoryWorkflowRepository` backs tests.

use chrono::{DateTime, Utc};
use sagaflow_types::definition::WorkflowDefinition;
use sagaflow_types::error::RepositoryError;
use sagaflow_types::instance::{InstanceFilter, InstanceStatus, WorkflowInstance};
use sagaflow_types::step::{ErrorDetails, StepExecution};
use serde_json::Value;
use uuid::Uuid;

/// Repository trait for workflow persistence.
///
/// Instance status only changes through [`transition_instance`], a
/// compare-and-set on the stored status. Progress writes
/// ([`save_instance_progress`]) only land while the instance is `running`,
/// so a concurrent cancellation cannot be overwritten by an in-flight step.
/// The instance lease ([`acquire_instance_lease`]) gives one engine at a
/// time the right to execute an instance, across processes sharing a store.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
///
/// [`transition_instance`]: WorkflowRepository::transition_instance
/// [`save_instance_progress`]: WorkflowRepository::save_instance_progress
/// [`acquire_instance_lease`]: WorkflowRepository::acquire_instance_lease
pub trait WorkflowRepository: Send + Sync {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Insert or overwrite a definition keyed by `(id, version)`.
    ///
    /// An existing version is only overwritten while it is a draft: never
    /// activated and not pinned by any instance. Returns `false` and writes
    /// nothing otherwise. The check and the write are one atomic step.
    /// Saving with `is_active` set marks the version as activated.
    fn save_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Get a definition version, or the latest version when `version` is `None`.
    fn get_definition(
        &self,
        id: &Uuid,
        version: Option<u32>,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// The highest version that is currently active.
    fn latest_active_definition(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, RepositoryError>> + Send;

    /// List the latest version of every definition, ordered by name.
    fn list_definitions(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// List every version of a definition, oldest first.
    fn list_definition_versions(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowDefinition>, RepositoryError>> + Send;

    /// Flip the active flag on one version. `NotFound` if it does not exist.
    ///
    /// Activation is recorded permanently: a version that was ever active
    /// is no longer a draft, even after deactivation.
    fn set_definition_active(
        &self,
        id: &Uuid,
        version: u32,
        active: bool,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    /// Insert a new instance record.
    fn create_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get an instance by ID.
    fn get_instance(
        &self,
        id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowInstance>, RepositoryError>> + Send;

    /// List instances matching the filter, newest first.
    fn list_instances(
        &self,
        filter: &InstanceFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowInstance>, RepositoryError>> + Send;

    /// Compare-and-set the instance status from `from` to `to`.
    ///
    /// Records `error` when given and sets `completed_at` when `to` is a
    /// settled status. Returns `false` if the stored status was not `from`.
    fn transition_instance(
        &self,
        id: &Uuid,
        from: InstanceStatus,
        to: InstanceStatus,
        error: Option<&ErrorDetails>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Write context and current node, only while the instance is `running`.
    ///
    /// Returns `false` (and writes nothing) if the instance is in any other
    /// status.
    fn save_instance_progress(
        &self,
        id: &Uuid,
        context: &Value,
        current_node_id: Option<&str>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Take or renew the execution lease on an instance.
    ///
    /// Granted when no lease is held, the held lease expired before `now`,
    /// or `owner` already holds it; the lease then runs until `expires_at`.
    /// Returns `false` while another owner holds a live lease.
    fn acquire_instance_lease(
        &self,
        id: &Uuid,
        owner: &Uuid,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Drop the lease if `owner` still holds it.
    fn release_instance_lease(
        &self,
        id: &Uuid,
        owner: &Uuid,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Record an instance-level error without changing the status.
    fn set_instance_error(
        &self,
        id: &Uuid,
        error: &ErrorDetails,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Step executions
    // -----------------------------------------------------------------------

    /// Append a new attempt. `Conflict` if `(instance, step, attempt)` exists.
    fn create_step_execution(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Overwrite the mutable fields of an attempt (status, timings, counts,
    /// error, compensation flag, result).
    fn update_step_execution(
        &self,
        step: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// All attempts for an instance, ordered by `step_id` then `attempt_number`.
    fn list_step_executions(
        &self,
        instance_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<StepExecution>, RepositoryError>> + Send;

    /// The highest-numbered attempt for one step.
    fn latest_step_execution(
        &self,
        instance_id: &Uuid,
        step_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<StepExecution>, RepositoryError>> + Send;
}
