//! Test fixtures: scripted actions, definition builders, and an engine harness.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sagaflow_types::definition::{ActionNode, Edge, Node, NodeKind, WorkflowDefinition};
use sagaflow_types::event::EngineEvent;
use sagaflow_types::instance::{InstanceStatus, WorkflowInstance};
use sagaflow_types::step::StepExecution;
use serde_json::{Map, Value, json};
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::action::{
    ActionCategory, ActionDescriptor, ActionError, ActionHandler, ActionInvocation, ActionRegistry,
    CompensationRequest, ConfigSchema,
};
use super::authz::{AllowAll, Authorizer};
use super::engine::process_item;
use super::orchestrator::{Orchestrator, OrchestratorSettings};
use super::retry::{BackoffPolicy, RetryScheduler, WorkQueue};
use crate::event::bus::EventBus;
use crate::repository::memory::InMemoryWorkflowRepository;
use crate::repository::workflow::WorkflowRepository;

// ---------------------------------------------------------------------------
// ScriptedAction
// ---------------------------------------------------------------------------

/// One scripted invocation outcome.
#[derive(Debug, Clone)]
pub(crate) enum Scripted {
    /// Succeed with `{"<step_id>_attempt": <attempt>}`.
    Succeed,
    /// Succeed with this value.
    Return(Value),
    Fail(ActionError),
}

/// An action whose outcomes are scripted per invocation. Clones share
/// counters and script.
#[derive(Clone)]
pub(crate) struct ScriptedAction {
    descriptor: ActionDescriptor,
    script: Arc<Mutex<VecDeque<Scripted>>>,
    fallback: Scripted,
    invocations: Arc<AtomicU32>,
    compensations: Arc<AtomicU32>,
    compensation_error: Arc<Mutex<Option<ActionError>>>,
    configurations: Arc<Mutex<Vec<Value>>>,
    gate: Option<Arc<Notify>>,
    delay: Option<Duration>,
}

impl ScriptedAction {
    fn with_fallback(key: &str, fallback: Scripted) -> Self {
        Self {
            descriptor: ActionDescriptor {
                key: key.to_string(),
                name: key.to_string(),
                category: ActionCategory::Custom,
                required_permission: format!("{key}.invoke"),
                config_schema: ConfigSchema::default(),
                compensable: false,
            },
            script: Arc::new(Mutex::new(VecDeque::new())),
            fallback,
            invocations: Arc::new(AtomicU32::new(0)),
            compensations: Arc::new(AtomicU32::new(0)),
            compensation_error: Arc::new(Mutex::new(None)),
            configurations: Arc::new(Mutex::new(Vec::new())),
            gate: None,
            delay: None,
        }
    }

    pub(crate) fn succeeding(key: &str) -> Self {
        Self::with_fallback(key, Scripted::Succeed)
    }

    pub(crate) fn failing(key: &str, error: ActionError) -> Self {
        Self::with_fallback(key, Scripted::Fail(error))
    }

    /// Outcomes for the first invocations, before the fallback applies.
    pub(crate) fn script(self, outcomes: Vec<Scripted>) -> Self {
        self.script.lock().unwrap().extend(outcomes);
        self
    }

    pub(crate) fn compensable(mut self) -> Self {
        self.descriptor.compensable = true;
        self
    }

    pub(crate) fn permission(mut self, permission: &str) -> Self {
        self.descriptor.required_permission = permission.to_string();
        self
    }

    /// Block every invocation until the gate is notified.
    pub(crate) fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn fail_compensation(&self, error: Option<ActionError>) {
        *self.compensation_error.lock().unwrap() = error;
    }

    pub(crate) fn invocations(&self) -> u32 {
        self.invocations.load(Ordering::SeqCst)
    }

    pub(crate) fn compensations(&self) -> u32 {
        self.compensations.load(Ordering::SeqCst)
    }

    pub(crate) fn configurations(&self) -> Vec<Value> {
        self.configurations.lock().unwrap().clone()
    }
}

impl ActionHandler for ScriptedAction {
    fn descriptor(&self) -> &ActionDescriptor {
        &self.descriptor
    }

    async fn invoke(&self, invocation: &ActionInvocation) -> Result<Value, ActionError> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        self.configurations
            .lock()
            .unwrap()
            .push(invocation.configuration.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.script.lock().unwrap().pop_front();
        match next.unwrap_or_else(|| self.fallback.clone()) {
            Scripted::Succeed => {
                let mut result = Map::new();
                result.insert(
                    format!("{}_attempt", invocation.step_id),
                    json!(invocation.attempt),
                );
                Ok(Value::Object(result))
            }
            Scripted::Return(value) => Ok(value),
            Scripted::Fail(error) => Err(error),
        }
    }

    async fn compensate(&self, _request: &CompensationRequest) -> Result<(), ActionError> {
        let error = self.compensation_error.lock().unwrap().clone();
        if let Some(error) = error {
            return Err(error);
        }
        self.compensations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub(crate) fn registry_with(actions: Vec<ScriptedAction>) -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    for action in actions {
        registry.register(action).unwrap();
    }
    registry
}

// ---------------------------------------------------------------------------
// Definitions and instances
// ---------------------------------------------------------------------------

pub(crate) struct DefinitionBuilder {
    def: WorkflowDefinition,
}

impl DefinitionBuilder {
    /// `start -> steps... -> end`, each step `(node_id, action_key)`.
    pub(crate) fn linear(steps: &[(&str, &str)]) -> Self {
        let mut nodes = vec![node("start", NodeKind::Start)];
        let mut edges = Vec::new();
        let mut previous = "start".to_string();
        for (id, action_key) in steps {
            nodes.push(action_node(id, action_key));
            edges.push(Edge::new(previous.clone(), *id));
            previous = id.to_string();
        }
        nodes.push(node("end", NodeKind::End));
        edges.push(Edge::new(previous, "end"));
        Self::from_graph(nodes, edges)
    }

    pub(crate) fn from_graph(nodes: Vec<Node>, edges: Vec<Edge>) -> Self {
        let now = Utc::now();
        Self {
            def: WorkflowDefinition {
                id: Uuid::now_v7(),
                version: 1,
                name: "test-workflow".to_string(),
                category: "operations".to_string(),
                description: None,
                is_active: true,
                nodes,
                edges,
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub(crate) fn inactive(mut self) -> Self {
        self.def.is_active = false;
        self
    }

    fn action_mut(&mut self, step_id: &str) -> &mut ActionNode {
        self.def
            .nodes
            .iter_mut()
            .find_map(|n| match &mut n.kind {
                NodeKind::Action(action) if n.id == step_id => Some(action),
                _ => None,
            })
            .expect("unknown action node")
    }

    pub(crate) fn max_retries(mut self, step_id: &str, max_retries: u32) -> Self {
        self.action_mut(step_id).max_retries = Some(max_retries);
        self
    }

    pub(crate) fn timeout_secs(mut self, step_id: &str, secs: u64) -> Self {
        self.action_mut(step_id).timeout_secs = Some(secs);
        self
    }

    pub(crate) fn configuration(mut self, step_id: &str, configuration: Value) -> Self {
        self.action_mut(step_id).configuration = configuration;
        self
    }

    pub(crate) fn build(self) -> WorkflowDefinition {
        self.def
    }
}

pub(crate) fn node(id: &str, kind: NodeKind) -> Node {
    Node {
        id: id.to_string(),
        name: String::new(),
        kind,
        position: None,
    }
}

pub(crate) fn action_node(id: &str, action_key: &str) -> Node {
    node(
        id,
        NodeKind::Action(ActionNode {
            action_key: action_key.to_string(),
            configuration: json!({}),
            required_permission: None,
            max_retries: None,
            timeout_secs: None,
        }),
    )
}

pub(crate) fn pending_instance() -> WorkflowInstance {
    let now = Utc::now();
    WorkflowInstance {
        id: Uuid::now_v7(),
        definition_id: Uuid::now_v7(),
        definition_version: 1,
        definition_name: "test-workflow".to_string(),
        status: InstanceStatus::Pending,
        context: json!({}),
        current_node_id: None,
        error: None,
        started_at: now,
        completed_at: None,
        updated_at: now,
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub(crate) const BUSY_REQUEUE: Duration = Duration::from_millis(50);
pub(crate) const LEASE_TTL: Duration = Duration::from_secs(30);

pub(crate) struct Harness {
    pub repo: Arc<InMemoryWorkflowRepository>,
    pub orchestrator: Arc<Orchestrator<InMemoryWorkflowRepository>>,
    pub queue: Arc<WorkQueue>,
    pub events: broadcast::Receiver<EngineEvent>,
}

impl Harness {
    pub(crate) fn new(actions: Vec<ScriptedAction>) -> Self {
        Self::with_authorizer(actions, Arc::new(AllowAll))
    }

    pub(crate) fn with_authorizer(actions: Vec<ScriptedAction>, authorizer: Arc<dyn Authorizer>) -> Self {
        Self::with_repo(Arc::new(InMemoryWorkflowRepository::new()), actions, authorizer)
    }

    pub(crate) fn with_repo(
        repo: Arc<InMemoryWorkflowRepository>,
        actions: Vec<ScriptedAction>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Self {
        let bus = EventBus::new(1024);
        let events = bus.subscribe();
        let queue = Arc::new(WorkQueue::new());
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            jitter_ratio: 0.2,
        };
        let scheduler = RetryScheduler::new(Arc::clone(&queue), policy, bus.clone());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&repo),
            Arc::new(registry_with(actions)),
            authorizer,
            scheduler,
            bus,
            OrchestratorSettings {
                default_max_retries: 3,
                step_timeout: Duration::from_secs(30),
                lease_ttl: LEASE_TTL,
            },
        ));
        Self {
            repo,
            orchestrator,
            queue,
            events,
        }
    }

    pub(crate) async fn deploy(&self, def: WorkflowDefinition) -> WorkflowDefinition {
        self.orchestrator.definitions().save(def).await.unwrap()
    }

    pub(crate) async fn start(&self, def: &WorkflowDefinition, context: Value) -> Uuid {
        self.orchestrator.start(def.id, context).await.unwrap().id
    }

    /// Process queue items (advancing paused time as needed) until empty.
    pub(crate) async fn run_until_idle(&self) {
        let cancel = CancellationToken::new();
        while !self.queue.is_empty() {
            let Some(item) = self.queue.next(&cancel).await else {
                break;
            };
            process_item(&self.orchestrator, item, BUSY_REQUEUE).await;
        }
    }

    pub(crate) async fn instance(&self, id: Uuid) -> WorkflowInstance {
        self.repo.get_instance(&id).await.unwrap().unwrap()
    }

    pub(crate) async fn steps(&self, id: Uuid) -> Vec<StepExecution> {
        self.repo.list_step_executions(&id).await.unwrap()
    }

    pub(crate) async fn steps_for(&self, id: Uuid, step_id: &str) -> Vec<StepExecution> {
        self.steps(id)
            .await
            .into_iter()
            .filter(|s| s.step_id == step_id)
            .collect()
    }

    /// Drain buffered events.
    pub(crate) fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }
}

/// Ledger checks that hold for every instance at every point in time.
pub(crate) fn assert_ledger_invariants(steps: &[StepExecution]) {
    let mut by_step: std::collections::BTreeMap<&str, Vec<u32>> = Default::default();
    for step in steps {
        assert!(
            step.retry_count <= step.max_retries,
            "step '{}' attempt {}: retry_count {} > max_retries {}",
            step.step_id,
            step.attempt_number,
            step.retry_count,
            step.max_retries
        );
        assert_eq!(
            step.error_details.is_some(),
            step.status == sagaflow_types::step::StepStatus::Failed,
            "error_details only on failed attempts"
        );
        by_step
            .entry(step.step_id.as_str())
            .or_default()
            .push(step.attempt_number);
    }
    for (step_id, mut attempts) in by_step {
        attempts.sort_unstable();
        let expected: Vec<u32> = (1..=attempts.len() as u32).collect();
        assert_eq!(attempts, expected, "attempts of '{step_id}' must be 1..n without gaps");
    }
}
