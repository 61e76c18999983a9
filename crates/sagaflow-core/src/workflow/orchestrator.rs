//! Orchestrator: walks an instance's graph one node at a time.
//!
//! Each instance has a single writer. `advance`, `drive`, `retry_step`, and
//! `compensate` first take a non-blocking in-process lock, then the durable
//! execution lease in the repository, so engines in different processes
//! sharing one store exclude each other too. A caller that gets neither
//! observes [`AdvanceOutcome::Busy`] and does nothing. The lease is renewed
//! while work runs and released when it ends; a lease left by a dead engine
//! expires after `lease_ttl`. `cancel` does not take the lock: it is a
//! compare-and-set on the stored status, and an in-flight attempt notices it
//! when it tries to record progress.
//!
//! Per action node the latest attempt decides what happens:
//! - none: run attempt 1
//! - `completed`: merge its result and move to the successor
//! - `failed`: wait for the queued retry, or fail the instance when no
//!   retry is allowed
//! - `running`/`pending`: only visible to a lease holder after the previous
//!   holder died or lost its lease; mark it failed with a retryable
//!   `INTERRUPTED` error and handle it like any other failure

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use sagaflow_types::config::EngineConfig;
use sagaflow_types::definition::{ActionNode, DecisionNode, Node, NodeKind};
use sagaflow_types::error::RepositoryError;
use sagaflow_types::event::EngineEvent;
use sagaflow_types::instance::{InstanceFilter, InstanceStatus, WorkflowInstance};
use sagaflow_types::step::{ErrorDetails, StepExecution, StepStatus};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::action::{ActionError, ActionInvocation, ActionRegistry, codes};
use super::authz::Authorizer;
use super::compensation::{CompensationCoordinator, CompensationError, CompensationReport};
use super::context::{MAX_CONTEXT_SIZE, merge_result, normalize_context, resolve_templates};
use super::definition::WorkflowError;
use super::expression::WorkflowEvaluator;
use super::graph::WorkflowGraph;
use super::retry::RetryScheduler;
use super::state::{StateError, transition};
use super::store::{DefinitionStore, StoreError};
use crate::event::bus::EventBus;
use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// Errors and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("workflow definition {0} not found")]
    DefinitionNotFound(Uuid),

    #[error("workflow definition {id} v{version} is not active")]
    DefinitionInactive { id: Uuid, version: u32 },

    #[error("instance {0} not found")]
    InstanceNotFound(Uuid),

    #[error("step '{step_id}' not found on instance {instance_id}")]
    StepNotFound { instance_id: Uuid, step_id: String },

    #[error("step '{step_id}' has used {retry_count} of {max_retries} attempts")]
    RetryLimitExceeded {
        step_id: String,
        retry_count: u32,
        max_retries: u32,
    },

    #[error("instance {0} is busy")]
    Busy(Uuid),

    #[error("execution lease on instance {0} was lost")]
    LeaseLost(Uuid),

    #[error("initial context is {size} bytes, limit is {max}")]
    ContextTooLarge { size: usize, max: usize },

    #[error(transparent)]
    Definition(#[from] WorkflowError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Compensation(#[from] CompensationError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => OrchestratorError::DefinitionNotFound(id),
            StoreError::Invalid(e) => OrchestratorError::Definition(e),
            StoreError::Repository(e) => OrchestratorError::Repository(e),
        }
    }
}

/// What a single `advance` (or the last step of a `drive`) did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// Another caller holds the instance lock; nothing was done.
    Busy,
    /// The instance is not running (cancelled, settled, or compensating).
    Inactive { status: InstanceStatus },
    /// Moved to the next node; call again to keep going.
    Continue,
    /// The current step failed and a retry is pending.
    AwaitingRetry { step_id: String, attempt: u32 },
    /// The instance reached a terminal status during this call.
    Settled { status: InstanceStatus },
}

/// Result of [`Orchestrator::retry_step`].
#[derive(Debug, Clone, PartialEq)]
pub enum RetryStepOutcome {
    Busy,
    /// The latest attempt already completed; no new attempt was made.
    AlreadyCompleted(StepExecution),
    /// A new attempt ran; the instance was then driven as far as possible.
    Executed(AdvanceOutcome),
}

/// Counts from startup recovery.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub advances: usize,
    pub retries: usize,
    pub resumed_pending: usize,
    pub stranded_compensating: usize,
}

/// Tunables taken from `[engine]` configuration.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    /// Maximum attempts for action nodes without `max_retries`.
    pub default_max_retries: u32,
    /// Attempt timeout for action nodes without `timeout_secs`.
    pub step_timeout: Duration,
    /// How long an execution lease lives without renewal.
    pub lease_ttl: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            default_max_retries: config.default_max_retries.max(1),
            step_timeout: Duration::from_secs(config.step_timeout_secs.max(1)),
            lease_ttl: Duration::from_secs(config.lease_ttl_secs.max(1)),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Per-instance lock
// ---------------------------------------------------------------------------

struct InstanceLock<'a> {
    locks: &'a DashMap<Uuid, Arc<Mutex<()>>>,
    instance_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for InstanceLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .remove_if(&self.instance_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator<R: WorkflowRepository> {
    repo: Arc<R>,
    registry: Arc<ActionRegistry>,
    authorizer: Arc<dyn Authorizer>,
    definitions: DefinitionStore<R>,
    scheduler: RetryScheduler,
    compensation: CompensationCoordinator<R>,
    events: EventBus,
    settings: OrchestratorSettings,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
    /// Lease owner identity of this orchestrator.
    owner_id: Uuid,
}

impl<R: WorkflowRepository> Orchestrator<R> {
    pub fn new(
        repo: Arc<R>,
        registry: Arc<ActionRegistry>,
        authorizer: Arc<dyn Authorizer>,
        scheduler: RetryScheduler,
        events: EventBus,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            definitions: DefinitionStore::new(Arc::clone(&repo), Arc::clone(&registry)),
            compensation: CompensationCoordinator::new(
                Arc::clone(&repo),
                Arc::clone(&registry),
                events.clone(),
            ),
            repo,
            registry,
            authorizer,
            scheduler,
            events,
            settings,
            locks: DashMap::new(),
            owner_id: Uuid::now_v7(),
        }
    }

    pub fn definitions(&self) -> &DefinitionStore<R> {
        &self.definitions
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn repository(&self) -> &Arc<R> {
        &self.repo
    }

    fn try_lock(&self, instance_id: Uuid) -> Option<InstanceLock<'_>> {
        let lock = Arc::clone(
            self.locks
                .entry(instance_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        match lock.try_lock_owned() {
            Ok(guard) => Some(InstanceLock {
                locks: &self.locks,
                instance_id,
                guard: Some(guard),
            }),
            Err(_) => {
                self.locks
                    .remove_if(&instance_id, |_, l| Arc::strong_count(l) == 1);
                None
            }
        }
    }

    /// Take or renew this orchestrator's lease on an instance.
    async fn acquire_lease(&self, instance_id: Uuid) -> Result<bool, OrchestratorError> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.settings.lease_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        match self
            .repo
            .acquire_instance_lease(&instance_id, &self.owner_id, now, now + ttl)
            .await
        {
            Ok(granted) => Ok(granted),
            Err(RepositoryError::NotFound) => Err(OrchestratorError::InstanceNotFound(instance_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Run `body` as the single writer of an instance.
    ///
    /// Returns `Ok(None)` without polling `body` when another task or
    /// another engine holds the instance.
    async fn exclusive<T>(
        &self,
        instance_id: Uuid,
        body: impl Future<Output = Result<T, OrchestratorError>>,
    ) -> Result<Option<T>, OrchestratorError> {
        let Some(_lock) = self.try_lock(instance_id) else {
            return Ok(None);
        };
        if !self.acquire_lease(instance_id).await? {
            tracing::debug!(instance_id = %instance_id, "instance leased by another engine");
            return Ok(None);
        }

        let result = self.renewing_lease(instance_id, body).await;

        if let Err(e) = self
            .repo
            .release_instance_lease(&instance_id, &self.owner_id)
            .await
        {
            tracing::warn!(instance_id = %instance_id, error = %e, "failed to release lease");
        }
        result.map(Some)
    }

    /// Drive `body` while renewing the lease every third of its lifetime.
    /// Abandons `body` if another engine took the lease over.
    async fn renewing_lease<T>(
        &self,
        instance_id: Uuid,
        body: impl Future<Output = Result<T, OrchestratorError>>,
    ) -> Result<T, OrchestratorError> {
        let period = (self.settings.lease_ttl / 3).max(Duration::from_millis(100));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut body = std::pin::pin!(body);
        loop {
            tokio::select! {
                result = &mut body => return result,
                _ = heartbeat.tick() => match self.acquire_lease(instance_id).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::error!(
                            instance_id = %instance_id,
                            "execution lease taken over, abandoning instance"
                        );
                        return Err(OrchestratorError::LeaseLost(instance_id));
                    }
                    Err(e) => {
                        tracing::warn!(instance_id = %instance_id, error = %e, "lease renewal failed");
                    }
                },
            }
        }
    }

    // -----------------------------------------------------------------------
    // Start / cancel / compensate
    // -----------------------------------------------------------------------

    /// Create an instance of the latest active definition version and queue it.
    pub async fn start(
        &self,
        definition_id: Uuid,
        initial_context: Value,
    ) -> Result<WorkflowInstance, OrchestratorError> {
        let Some(def) = self.definitions.latest_active(&definition_id).await? else {
            let latest = self.definitions.get(&definition_id, None).await?;
            return Err(OrchestratorError::DefinitionInactive {
                id: latest.id,
                version: latest.version,
            });
        };
        let graph = self.definitions.graph(&def)?;

        let context = normalize_context(initial_context);
        let size = serde_json::to_vec(&context).map(|v| v.len()).unwrap_or(0);
        if size > MAX_CONTEXT_SIZE {
            return Err(OrchestratorError::ContextTooLarge {
                size,
                max: MAX_CONTEXT_SIZE,
            });
        }

        let now = Utc::now();
        let instance = WorkflowInstance {
            id: Uuid::now_v7(),
            definition_id: def.id,
            definition_version: def.version,
            definition_name: def.name.clone(),
            status: InstanceStatus::Pending,
            context,
            current_node_id: Some(graph.start_id().to_string()),
            error: None,
            started_at: now,
            completed_at: None,
            updated_at: now,
        };
        self.repo.create_instance(&instance).await?;
        self.events.publish(EngineEvent::InstanceStatusChanged {
            instance_id: instance.id,
            from: None,
            to: InstanceStatus::Pending,
        });
        tracing::info!(
            instance_id = %instance.id,
            definition_id = %def.id,
            version = def.version,
            "workflow instance created"
        );

        transition(
            self.repo.as_ref(),
            &self.events,
            instance.id,
            InstanceStatus::Pending,
            InstanceStatus::Running,
            None,
        )
        .await?;
        self.repo
            .save_instance_progress(&instance.id, &instance.context, graph.successor(graph.start_id()))
            .await?;
        self.scheduler.schedule_advance(instance.id);

        self.load_instance(instance.id).await
    }

    /// Cancel a pending or running instance.
    ///
    /// Does not wait on the instance lock; an in-flight attempt finishes and
    /// is recorded, but its result is not merged.
    pub async fn cancel(&self, instance_id: Uuid) -> Result<WorkflowInstance, OrchestratorError> {
        loop {
            let instance = self.load_instance(instance_id).await?;
            if !instance.status.is_active() {
                return Err(StateError::InvalidTransition {
                    from: instance.status,
                    to: InstanceStatus::Cancelled,
                }
                .into());
            }
            let moved = transition(
                self.repo.as_ref(),
                &self.events,
                instance_id,
                instance.status,
                InstanceStatus::Cancelled,
                None,
            )
            .await?;
            if moved {
                return self.load_instance(instance_id).await;
            }
        }
    }

    /// Explicit compensation request for a failed, cancelled, or stranded
    /// compensating instance.
    pub async fn compensate(&self, instance_id: Uuid) -> Result<CompensationReport, OrchestratorError> {
        let body = async {
            self.compensation
                .compensate(instance_id)
                .await
                .map_err(OrchestratorError::from)
        };
        self.exclusive(instance_id, body)
            .await?
            .ok_or(OrchestratorError::Busy(instance_id))
    }

    // -----------------------------------------------------------------------
    // Advance / drive / retry
    // -----------------------------------------------------------------------

    /// Execute one graph step.
    pub async fn advance(&self, instance_id: Uuid) -> Result<AdvanceOutcome, OrchestratorError> {
        match self.exclusive(instance_id, self.advance_locked(instance_id)).await? {
            Some(outcome) => Ok(outcome),
            None => {
                tracing::debug!(instance_id = %instance_id, "advance skipped, instance busy");
                Ok(AdvanceOutcome::Busy)
            }
        }
    }

    /// Advance until the instance settles or waits on a retry.
    pub async fn drive(&self, instance_id: Uuid) -> Result<AdvanceOutcome, OrchestratorError> {
        match self.exclusive(instance_id, self.drive_locked(instance_id)).await? {
            Some(outcome) => Ok(outcome),
            None => {
                tracing::debug!(instance_id = %instance_id, "drive skipped, instance busy");
                Ok(AdvanceOutcome::Busy)
            }
        }
    }

    /// Run attempt `previous + 1` of a failed step, then keep driving.
    pub async fn retry_step(
        &self,
        instance_id: Uuid,
        step_id: &str,
    ) -> Result<RetryStepOutcome, OrchestratorError> {
        match self.exclusive(instance_id, self.retry_step_locked(instance_id, step_id)).await? {
            Some(outcome) => Ok(outcome),
            None => {
                tracing::debug!(instance_id = %instance_id, step_id, "retry skipped, instance busy");
                Ok(RetryStepOutcome::Busy)
            }
        }
    }

    async fn retry_step_locked(
        &self,
        instance_id: Uuid,
        step_id: &str,
    ) -> Result<RetryStepOutcome, OrchestratorError> {
        let instance = self.load_instance(instance_id).await?;
        let step_not_found = || OrchestratorError::StepNotFound {
            instance_id,
            step_id: step_id.to_string(),
        };
        let latest = self
            .repo
            .latest_step_execution(&instance_id, step_id)
            .await?
            .ok_or_else(step_not_found)?;

        if matches!(latest.status, StepStatus::Completed | StepStatus::Compensated) {
            return Ok(RetryStepOutcome::AlreadyCompleted(latest));
        }
        if latest.status == StepStatus::Failed && latest.retry_count >= latest.max_retries {
            return Err(OrchestratorError::RetryLimitExceeded {
                step_id: step_id.to_string(),
                retry_count: latest.retry_count,
                max_retries: latest.max_retries,
            });
        }
        if instance.status != InstanceStatus::Running {
            return Ok(RetryStepOutcome::Executed(AdvanceOutcome::Inactive {
                status: instance.status,
            }));
        }
        if instance.current_node_id.as_deref() != Some(step_id) {
            return Err(step_not_found());
        }
        if latest.status != StepStatus::Failed {
            // An attempt left running by a dead engine; advancing records it as interrupted.
            return Ok(RetryStepOutcome::Executed(self.drive_locked(instance_id).await?));
        }

        let def = self
            .definitions
            .get(&instance.definition_id, Some(instance.definition_version))
            .await?;
        let graph = self.definitions.graph(&def)?;
        let (node, action) = match graph.node(step_id) {
            Some(node) => match &node.kind {
                NodeKind::Action(action) => (node, action),
                _ => return Err(step_not_found()),
            },
            None => return Err(step_not_found()),
        };

        let outcome = self
            .run_attempt(
                &instance,
                &graph,
                node,
                action,
                latest.attempt_number + 1,
                latest.retry_count,
            )
            .await?;
        let outcome = match outcome {
            AdvanceOutcome::Continue => self.drive_locked(instance_id).await?,
            other => other,
        };
        Ok(RetryStepOutcome::Executed(outcome))
    }

    async fn drive_locked(&self, instance_id: Uuid) -> Result<AdvanceOutcome, OrchestratorError> {
        loop {
            match self.advance_locked(instance_id).await? {
                AdvanceOutcome::Continue => continue,
                other => return Ok(other),
            }
        }
    }

    async fn advance_locked(&self, instance_id: Uuid) -> Result<AdvanceOutcome, OrchestratorError> {
        let instance = self.load_instance(instance_id).await?;
        if instance.status != InstanceStatus::Running {
            return Ok(AdvanceOutcome::Inactive {
                status: instance.status,
            });
        }

        let def = self
            .definitions
            .get(&instance.definition_id, Some(instance.definition_version))
            .await?;
        let graph = self.definitions.graph(&def)?;
        let node_id = instance
            .current_node_id
            .clone()
            .unwrap_or_else(|| graph.start_id().to_string());

        let Some(node) = graph.node(&node_id) else {
            let details = ErrorDetails::new(
                codes::UNKNOWN_NODE,
                format!("current node '{node_id}' is not part of the definition"),
            );
            return self.fail_instance(instance_id, details).await;
        };

        match &node.kind {
            NodeKind::Start => self.move_to(&instance, &instance.context, graph.successor(&node.id)).await,
            NodeKind::End => {
                let moved = transition(
                    self.repo.as_ref(),
                    &self.events,
                    instance_id,
                    InstanceStatus::Running,
                    InstanceStatus::Completed,
                    None,
                )
                .await?;
                if moved {
                    Ok(AdvanceOutcome::Settled {
                        status: InstanceStatus::Completed,
                    })
                } else {
                    self.inactive(instance_id).await
                }
            }
            NodeKind::Decision(decision) => self.route_decision(&instance, node, decision).await,
            NodeKind::Action(action) => self.advance_action(&instance, &graph, node, action).await,
        }
    }

    async fn advance_action(
        &self,
        instance: &WorkflowInstance,
        graph: &WorkflowGraph,
        node: &Node,
        action: &ActionNode,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let Some(latest) = self.repo.latest_step_execution(&instance.id, &node.id).await? else {
            return self.run_attempt(instance, graph, node, action, 1, 0).await;
        };

        match latest.status {
            StepStatus::Completed | StepStatus::Compensated => {
                let mut context = instance.context.clone();
                if let Some(result) = &latest.result_data {
                    if let Err(e) = merge_result(&mut context, &node.id, result) {
                        let details = ErrorDetails::new(codes::RESULT_TOO_LARGE, e.to_string());
                        return self.fail_instance(instance.id, details).await;
                    }
                }
                self.move_to(instance, &context, graph.successor(&node.id)).await
            }
            StepStatus::Failed => {
                if retry_allowed(&latest) {
                    Ok(AdvanceOutcome::AwaitingRetry {
                        step_id: node.id.clone(),
                        attempt: latest.attempt_number,
                    })
                } else {
                    let details = latest
                        .error_details
                        .clone()
                        .unwrap_or_else(|| ErrorDetails::new(codes::ACTION_FAILED, "step failed"));
                    self.fail_instance(instance.id, step_error(&node.id, details)).await
                }
            }
            StepStatus::Running | StepStatus::Pending => {
                tracing::warn!(
                    instance_id = %instance.id,
                    step_id = %node.id,
                    attempt = latest.attempt_number,
                    "found unfinished attempt, marking interrupted"
                );
                let details = ErrorDetails {
                    code: codes::INTERRUPTED.to_string(),
                    message: "attempt was interrupted before it finished".to_string(),
                    retryable: true,
                };
                self.record_failure(instance.id, node, latest, details, 0).await
            }
        }
    }

    async fn run_attempt(
        &self,
        instance: &WorkflowInstance,
        graph: &WorkflowGraph,
        node: &Node,
        action: &ActionNode,
        attempt: u32,
        retry_count: u32,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let max_retries = action
            .max_retries
            .unwrap_or(self.settings.default_max_retries)
            .max(1);
        let mut execution = StepExecution::begin(
            instance.id,
            &node.id,
            node.display_name(),
            &action.action_key,
            attempt,
            retry_count,
            max_retries,
        );
        self.repo.create_step_execution(&execution).await?;
        self.events.publish(EngineEvent::StepStarted {
            instance_id: instance.id,
            step_id: node.id.clone(),
            attempt,
        });
        tracing::info!(
            instance_id = %instance.id,
            step_id = %node.id,
            action_key = %action.action_key,
            attempt,
            "step attempt started"
        );

        let started = tokio::time::Instant::now();
        let result = self.invoke(instance, node, action, attempt).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let value = match result {
            Ok(value) => value,
            Err(err) => {
                return self
                    .record_failure(instance.id, node, execution, err.into(), duration_ms)
                    .await;
            }
        };

        // A successful invocation is recorded completed even when its result
        // is too large to merge.
        let mut context = instance.context.clone();
        let merged = merge_result(&mut context, &node.id, &value);

        execution.complete(value, duration_ms);
        self.repo.update_step_execution(&execution).await?;
        self.events.publish(EngineEvent::StepCompleted {
            instance_id: instance.id,
            step_id: node.id.clone(),
            attempt,
            duration_ms,
        });
        tracing::info!(
            instance_id = %instance.id,
            step_id = %node.id,
            attempt,
            duration_ms,
            "step attempt completed"
        );

        if let Err(e) = merged {
            let details = ErrorDetails::new(codes::RESULT_TOO_LARGE, e.to_string());
            return self.fail_instance(instance.id, step_error(&node.id, details)).await;
        }
        self.move_to(instance, &context, graph.successor(&node.id)).await
    }

    /// Resolve, authorize, and invoke the node's action under its timeout.
    async fn invoke(
        &self,
        instance: &WorkflowInstance,
        node: &Node,
        action: &ActionNode,
        attempt: u32,
    ) -> Result<Value, ActionError> {
        let handler = self.registry.get(&action.action_key).ok_or_else(|| {
            ActionError::fatal(
                codes::UNKNOWN_ACTION,
                format!("action '{}' is not registered", action.action_key),
            )
        })?;

        let permission = action
            .required_permission
            .as_deref()
            .unwrap_or(handler.descriptor().required_permission.as_str());
        if !self.authorizer.is_allowed(permission, instance) {
            return Err(ActionError::fatal(
                codes::AUTHORIZATION_DENIED,
                format!("permission '{permission}' denied for action '{}'", action.action_key),
            ));
        }

        let configuration = resolve_templates(&action.configuration, &instance.context);
        handler
            .descriptor()
            .config_schema
            .validate(&configuration)
            .map_err(|message| ActionError::fatal(codes::INVALID_CONFIGURATION, message))?;

        let invocation = ActionInvocation {
            instance_id: instance.id,
            step_id: node.id.clone(),
            attempt,
            configuration,
            context: instance.context.clone(),
        };
        let timeout = action
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.settings.step_timeout);

        match tokio::time::timeout(timeout, handler.invoke(&invocation)).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::retryable(
                codes::TIMEOUT,
                format!("step exceeded {}s timeout", timeout.as_secs()),
            )),
        }
    }

    /// Mark an attempt failed, then schedule a retry or fail the instance.
    async fn record_failure(
        &self,
        instance_id: Uuid,
        node: &Node,
        mut execution: StepExecution,
        details: ErrorDetails,
        duration_ms: u64,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        execution.fail(details.clone(), duration_ms);
        self.repo.update_step_execution(&execution).await?;

        let will_retry = retry_allowed(&execution);
        self.events.publish(EngineEvent::StepFailed {
            instance_id,
            step_id: node.id.clone(),
            attempt: execution.attempt_number,
            code: details.code.clone(),
            will_retry,
        });
        tracing::warn!(
            instance_id = %instance_id,
            step_id = %node.id,
            attempt = execution.attempt_number,
            retry_count = execution.retry_count,
            max_retries = execution.max_retries,
            code = %details.code,
            error = %details.message,
            will_retry,
            "step attempt failed"
        );

        let current = self.load_instance(instance_id).await?;
        if current.status != InstanceStatus::Running {
            return Ok(AdvanceOutcome::Inactive {
                status: current.status,
            });
        }

        if will_retry {
            self.scheduler
                .enqueue_automatic(instance_id, &node.id, execution.retry_count);
            return Ok(AdvanceOutcome::AwaitingRetry {
                step_id: node.id.clone(),
                attempt: execution.attempt_number,
            });
        }

        self.fail_instance(instance_id, step_error(&node.id, details)).await
    }

    async fn route_decision(
        &self,
        instance: &WorkflowInstance,
        node: &Node,
        decision: &DecisionNode,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        match choose_branch(instance.id, &node.id, decision, &instance.context) {
            Some(target) => {
                tracing::debug!(
                    instance_id = %instance.id,
                    decision = %node.id,
                    target = %target,
                    "decision routed"
                );
                self.move_to(instance, &instance.context, Some(target.as_str())).await
            }
            None => {
                let details = ErrorDetails::new(
                    codes::NO_MATCHING_BRANCH,
                    format!("decision '{}' matched no branch and has no default", node.id),
                );
                self.fail_instance(instance.id, details).await
            }
        }
    }

    /// Persist context and the next node. Returns `Inactive` when the
    /// instance stopped running in the meantime (nothing is written then).
    async fn move_to(
        &self,
        instance: &WorkflowInstance,
        context: &Value,
        next: Option<&str>,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let written = self
            .repo
            .save_instance_progress(&instance.id, context, next)
            .await?;
        if written {
            Ok(AdvanceOutcome::Continue)
        } else {
            tracing::info!(
                instance_id = %instance.id,
                "instance no longer running, progress discarded"
            );
            self.inactive(instance.id).await
        }
    }

    /// `running -> failed`, then automatic compensation.
    async fn fail_instance(
        &self,
        instance_id: Uuid,
        details: ErrorDetails,
    ) -> Result<AdvanceOutcome, OrchestratorError> {
        let moved = transition(
            self.repo.as_ref(),
            &self.events,
            instance_id,
            InstanceStatus::Running,
            InstanceStatus::Failed,
            Some(&details),
        )
        .await?;
        if !moved {
            return self.inactive(instance_id).await;
        }
        tracing::warn!(
            instance_id = %instance_id,
            code = %details.code,
            error = %details.message,
            "instance failed"
        );

        match self.compensation.compensate(instance_id).await {
            Ok(report) => Ok(AdvanceOutcome::Settled {
                status: report.final_status,
            }),
            Err(e) => {
                tracing::error!(instance_id = %instance_id, error = %e, "automatic compensation failed");
                let status = self.load_instance(instance_id).await?.status;
                Ok(AdvanceOutcome::Settled { status })
            }
        }
    }

    async fn inactive(&self, instance_id: Uuid) -> Result<AdvanceOutcome, OrchestratorError> {
        let status = self.load_instance(instance_id).await?.status;
        Ok(AdvanceOutcome::Inactive { status })
    }

    async fn load_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, OrchestratorError> {
        self.repo
            .get_instance(&instance_id)
            .await?
            .ok_or(OrchestratorError::InstanceNotFound(instance_id))
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Rebuild the work queue from durable state after a restart.
    ///
    /// - `running` instances whose current step's latest attempt failed with
    ///   a retry allowed get an automatic retry
    /// - other `running` instances are queued for advance
    /// - `pending` instances are moved to `running` and queued
    /// - stranded `compensating` instances are reported, not touched
    pub async fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        let mut report = RecoveryReport::default();

        let running = self
            .repo
            .list_instances(&InstanceFilter {
                status: Some(InstanceStatus::Running),
                ..Default::default()
            })
            .await?;
        for instance in running {
            let latest = match &instance.current_node_id {
                Some(node_id) => self.repo.latest_step_execution(&instance.id, node_id).await?,
                None => None,
            };
            match latest {
                Some(exec) if exec.status == StepStatus::Failed && retry_allowed(&exec) => {
                    self.scheduler
                        .enqueue_automatic(instance.id, &exec.step_id, exec.retry_count);
                    report.retries += 1;
                }
                _ => {
                    self.scheduler.schedule_advance(instance.id);
                    report.advances += 1;
                }
            }
        }

        let pending = self
            .repo
            .list_instances(&InstanceFilter {
                status: Some(InstanceStatus::Pending),
                ..Default::default()
            })
            .await?;
        for instance in pending {
            let moved = transition(
                self.repo.as_ref(),
                &self.events,
                instance.id,
                InstanceStatus::Pending,
                InstanceStatus::Running,
                None,
            )
            .await?;
            if moved {
                self.scheduler.schedule_advance(instance.id);
                report.resumed_pending += 1;
            }
        }

        let compensating = self
            .repo
            .list_instances(&InstanceFilter {
                status: Some(InstanceStatus::Compensating),
                ..Default::default()
            })
            .await?;
        for instance in &compensating {
            tracing::warn!(
                instance_id = %instance.id,
                error = ?instance.error,
                "instance stranded in compensating, explicit compensation required"
            );
        }
        report.stranded_compensating = compensating.len();

        tracing::info!(
            advances = report.advances,
            retries = report.retries,
            resumed_pending = report.resumed_pending,
            stranded = report.stranded_compensating,
            "recovery complete"
        );
        Ok(report)
    }
}

/// Whether a failed attempt may be followed by another one.
fn retry_allowed(execution: &StepExecution) -> bool {
    execution.can_retry()
        && execution
            .error_details
            .as_ref()
            .is_some_and(|e| e.retryable)
}

/// Instance-level error derived from a step failure.
fn step_error(step_id: &str, details: ErrorDetails) -> ErrorDetails {
    ErrorDetails {
        code: details.code,
        message: format!("step '{}' failed: {}", step_id, details.message),
        retryable: false,
    }
}

/// First branch whose condition holds, else the default target.
///
/// The evaluator is built per call and never held across an await point.
fn choose_branch(
    instance_id: Uuid,
    node_id: &str,
    decision: &DecisionNode,
    context: &Value,
) -> Option<String> {
    let evaluator = WorkflowEvaluator::new();
    for branch in &decision.branches {
        match evaluator.evaluate_bool(&branch.condition, context) {
            Ok(true) => return Some(branch.target.clone()),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    instance_id = %instance_id,
                    decision = node_id,
                    condition = %branch.condition,
                    error = %e,
                    "condition failed to evaluate, treating as false"
                );
            }
        }
    }
    decision.default_target.clone()
}
