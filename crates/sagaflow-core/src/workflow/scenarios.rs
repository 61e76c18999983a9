//! End-to-end engine scenarios against the in-memory repository.

use std::sync::Arc;
use std::time::Duration;

use sagaflow_types::definition::{DecisionBranch, DecisionNode, Edge, NodeKind};
use sagaflow_types::event::EngineEvent;
use sagaflow_types::instance::InstanceStatus;
use sagaflow_types::step::{RetrySource, StepExecution, StepStatus};
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use super::action::{ActionError, codes};
use super::authz::{AllowAll, PermissionSet};
use super::context::MAX_RESULT_SIZE;
use super::engine::{WorkflowEngine, process_item};
use super::orchestrator::{AdvanceOutcome, OrchestratorError, RetryStepOutcome};
use super::query::{ExecutionQuery, RetryError, RetryOutcome};
use super::testing::{
    BUSY_REQUEUE, DefinitionBuilder, Harness, Scripted, ScriptedAction, action_node,
    assert_ledger_invariants, node, pending_instance,
};
use crate::repository::memory::InMemoryWorkflowRepository;
use crate::repository::workflow::WorkflowRepository;

fn transient() -> ActionError {
    ActionError::failed("upstream unavailable")
}

fn status_trace(events: &[EngineEvent], id: Uuid) -> Vec<(Option<InstanceStatus>, InstanceStatus)> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::InstanceStatusChanged {
                instance_id,
                from,
                to,
            } if *instance_id == id => Some((*from, *to)),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_until_success() {
    let reserve = ScriptedAction::succeeding("test.reserve");
    let flaky = ScriptedAction::succeeding("test.flaky")
        .script(vec![Scripted::Fail(transient()), Scripted::Fail(transient())]);
    let ship = ScriptedAction::succeeding("test.ship");
    let mut h = Harness::new(vec![reserve.clone(), flaky.clone(), ship.clone()]);
    let def = h
        .deploy(
            DefinitionBuilder::linear(&[
                ("reserve", "test.reserve"),
                ("charge", "test.flaky"),
                ("ship", "test.ship"),
            ])
            .max_retries("charge", 3)
            .build(),
        )
        .await;

    let id = h.start(&def, json!({"amount": 10})).await;
    h.run_until_idle().await;

    let instance = h.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Completed);
    assert!(instance.completed_at.is_some());
    assert_eq!(instance.context["reserve_attempt"], 1);
    assert_eq!(instance.context["charge_attempt"], 3);
    assert_eq!(instance.context["ship_attempt"], 1);
    assert_eq!(instance.context["amount"], 10);

    // retries of the middle step leave its neighbours alone
    for (step_id, action) in [("reserve", &reserve), ("ship", &ship)] {
        let attempts = h.steps_for(id, step_id).await;
        assert_eq!(attempts.len(), 1, "{step_id} must run exactly once");
        assert_eq!(attempts[0].status, StepStatus::Completed);
        assert_eq!(action.invocations(), 1);
    }

    let charged = h.steps_for(id, "charge").await;
    assert_eq!(
        charged.iter().map(|s| s.attempt_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(
        charged.iter().map(|s| s.status).collect::<Vec<_>>(),
        vec![StepStatus::Failed, StepStatus::Failed, StepStatus::Completed]
    );
    assert_eq!(
        charged.iter().map(|s| s.retry_count).collect::<Vec<_>>(),
        vec![1, 2, 2]
    );
    assert_eq!(flaky.invocations(), 3);
    assert_ledger_invariants(&h.steps(id).await);

    let events = h.drain_events();
    assert_eq!(
        status_trace(&events, id),
        vec![
            (None, InstanceStatus::Pending),
            (Some(InstanceStatus::Pending), InstanceStatus::Running),
            (Some(InstanceStatus::Running), InstanceStatus::Completed),
        ]
    );
    let scheduled = events
        .iter()
        .filter(|e| matches!(e, EngineEvent::RetryScheduled { source: RetrySource::Automatic, .. }))
        .count();
    assert_eq!(scheduled, 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_and_compensate_completed_steps() {
    let reserve = ScriptedAction::succeeding("test.reserve").compensable();
    let charge = ScriptedAction::failing("test.charge", transient());
    let ship = ScriptedAction::succeeding("test.ship");
    let mut h = Harness::new(vec![reserve.clone(), charge.clone(), ship.clone()]);
    let def = h
        .deploy(
            DefinitionBuilder::linear(&[
                ("reserve", "test.reserve"),
                ("charge", "test.charge"),
                ("ship", "test.ship"),
            ])
            .max_retries("charge", 2)
            .build(),
        )
        .await;

    let id = h.start(&def, json!({})).await;
    h.run_until_idle().await;

    let instance = h.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Compensated);
    let error = instance.error.expect("failure recorded");
    assert_eq!(error.code, codes::ACTION_FAILED);
    assert!(error.message.contains("charge"));

    assert_eq!(charge.invocations(), 2);
    assert_eq!(reserve.compensations(), 1);
    assert_eq!(ship.invocations(), 0);
    assert!(h.steps_for(id, "ship").await.is_empty());

    let reserved = h.steps_for(id, "reserve").await;
    assert_eq!(reserved.len(), 1);
    assert_eq!(reserved[0].status, StepStatus::Compensated);
    assert!(reserved[0].compensation_executed);

    let charged = h.steps_for(id, "charge").await;
    assert_eq!(charged.len(), 2);
    assert_eq!(charged[1].retry_count, 2);
    assert!(!charged[1].can_retry());
    assert_ledger_invariants(&h.steps(id).await);

    let events = h.drain_events();
    assert_eq!(
        status_trace(&events, id),
        vec![
            (None, InstanceStatus::Pending),
            (Some(InstanceStatus::Pending), InstanceStatus::Running),
            (Some(InstanceStatus::Running), InstanceStatus::Failed),
            (Some(InstanceStatus::Failed), InstanceStatus::Compensating),
            (Some(InstanceStatus::Compensating), InstanceStatus::Compensated),
        ]
    );
    let last_failure = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::StepFailed { attempt, will_retry, .. } => Some((*attempt, *will_retry)),
            _ => None,
        })
        .last();
    assert_eq!(last_failure, Some((2, false)));
}

#[tokio::test(start_paused = true)]
async fn fatal_error_skips_retries() {
    let charge = ScriptedAction::failing("test.charge", ActionError::fatal("CARD_DECLINED", "declined"));
    let h = Harness::new(vec![charge.clone()]);
    let def = h
        .deploy(
            DefinitionBuilder::linear(&[("charge", "test.charge")])
                .max_retries("charge", 5)
                .build(),
        )
        .await;

    let id = h.start(&def, json!({})).await;
    h.run_until_idle().await;

    let instance = h.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.error.unwrap().code, "CARD_DECLINED");
    assert_eq!(charge.invocations(), 1);
    assert!(h.queue.is_empty());
}

#[tokio::test(start_paused = true)]
async fn oversized_result_is_kept_for_compensation() {
    let blob = "x".repeat(MAX_RESULT_SIZE + 1);
    let reserve = ScriptedAction::succeeding("test.reserve")
        .compensable()
        .script(vec![Scripted::Return(json!({"blob": blob}))]);
    let ship = ScriptedAction::succeeding("test.ship");
    let h = Harness::new(vec![reserve.clone(), ship.clone()]);
    let def = h
        .deploy(DefinitionBuilder::linear(&[("reserve", "test.reserve"), ("ship", "test.ship")]).build())
        .await;

    let id = h.start(&def, json!({})).await;
    h.run_until_idle().await;

    let instance = h.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Compensated);
    assert_eq!(instance.error.unwrap().code, codes::RESULT_TOO_LARGE);
    assert!(instance.context.get("blob").is_none());

    let reserved = h.steps_for(id, "reserve").await;
    assert_eq!(reserved.len(), 1);
    assert_eq!(reserved[0].status, StepStatus::Compensated);
    assert!(reserved[0].result_data.is_some());
    assert_eq!(reserve.compensations(), 1);
    assert_eq!(ship.invocations(), 0);
    assert_ledger_invariants(&h.steps(id).await);
}

#[tokio::test(start_paused = true)]
async fn timeout_counts_as_retryable_failure() {
    let slow = ScriptedAction::succeeding("test.slow").delayed(Duration::from_secs(10));
    let h = Harness::new(vec![slow.clone()]);
    let def = h
        .deploy(
            DefinitionBuilder::linear(&[("lookup", "test.slow")])
                .max_retries("lookup", 2)
                .timeout_secs("lookup", 1)
                .build(),
        )
        .await;

    let id = h.start(&def, json!({})).await;
    h.run_until_idle().await;

    let steps = h.steps(id).await;
    assert_eq!(steps.len(), 2);
    for step in &steps {
        let error = step.error_details.as_ref().unwrap();
        assert_eq!(error.code, codes::TIMEOUT);
        assert!(error.retryable);
    }
    assert_eq!(h.instance(id).await.status, InstanceStatus::Failed);
    assert_ledger_invariants(&steps);
}

// ---------------------------------------------------------------------------
// Decisions and configuration
// ---------------------------------------------------------------------------

fn approval_definition(default_target: Option<&str>) -> DefinitionBuilder {
    let nodes = vec![
        node("start", NodeKind::Start),
        node(
            "route",
            NodeKind::Decision(DecisionNode {
                branches: vec![DecisionBranch {
                    condition: "amount > 1000".to_string(),
                    target: "escalate".to_string(),
                }],
                default_target: default_target.map(str::to_string),
            }),
        ),
        action_node("escalate", "test.escalate"),
        action_node("approve", "test.approve"),
        node("end", NodeKind::End),
    ];
    let mut edges = vec![
        Edge::new("start", "route"),
        Edge::new("route", "escalate"),
        Edge::new("escalate", "end"),
        Edge::new("approve", "end"),
    ];
    match default_target {
        Some(target) => edges.push(Edge::new("route", target)),
        // keep `approve` reachable without a default
        None => {
            edges.retain(|e| e.source != "start");
            edges.push(Edge::new("start", "approve"));
            edges.retain(|e| e.source != "approve");
            edges.push(Edge::new("approve", "route"));
        }
    }
    DefinitionBuilder::from_graph(nodes, edges)
}

#[tokio::test(start_paused = true)]
async fn decision_routes_first_match_then_default() {
    let escalate = ScriptedAction::succeeding("test.escalate");
    let approve = ScriptedAction::succeeding("test.approve");
    let h = Harness::new(vec![escalate.clone(), approve.clone()]);
    let def = h.deploy(approval_definition(Some("approve")).build()).await;

    let big = h.start(&def, json!({"amount": 5000})).await;
    let small = h.start(&def, json!({"amount": 50})).await;
    h.run_until_idle().await;

    assert_eq!(h.instance(big).await.status, InstanceStatus::Completed);
    assert_eq!(h.instance(small).await.status, InstanceStatus::Completed);
    assert_eq!(h.steps_for(big, "escalate").await.len(), 1);
    assert!(h.steps_for(big, "approve").await.is_empty());
    assert_eq!(h.steps_for(small, "approve").await.len(), 1);
    assert!(h.steps_for(small, "escalate").await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn decision_without_match_or_default_fails_instance() {
    let escalate = ScriptedAction::succeeding("test.escalate");
    let approve = ScriptedAction::succeeding("test.approve").compensable();
    let h = Harness::new(vec![escalate.clone(), approve.clone()]);
    let def = h.deploy(approval_definition(None).build()).await;

    let id = h.start(&def, json!({"amount": 10})).await;
    h.run_until_idle().await;

    let instance = h.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Compensated);
    assert_eq!(instance.error.unwrap().code, codes::NO_MATCHING_BRANCH);
    assert!(h.steps_for(id, "escalate").await.is_empty());
    assert_eq!(approve.compensations(), 1);
}

#[tokio::test(start_paused = true)]
async fn decision_as_first_node_without_match_records_no_steps() {
    let escalate = ScriptedAction::succeeding("test.escalate");
    let nodes = vec![
        node("start", NodeKind::Start),
        node(
            "route",
            NodeKind::Decision(DecisionNode {
                branches: vec![DecisionBranch {
                    condition: "amount > 1000".to_string(),
                    target: "escalate".to_string(),
                }],
                default_target: None,
            }),
        ),
        action_node("escalate", "test.escalate"),
        node("end", NodeKind::End),
    ];
    let edges = vec![
        Edge::new("start", "route"),
        Edge::new("route", "escalate"),
        Edge::new("escalate", "end"),
    ];
    let h = Harness::new(vec![escalate.clone()]);
    let def = h.deploy(DefinitionBuilder::from_graph(nodes, edges).build()).await;

    let id = h.start(&def, json!({"amount": 1})).await;
    h.run_until_idle().await;

    let instance = h.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.error.unwrap().code, codes::NO_MATCHING_BRANCH);
    assert!(h.steps(id).await.is_empty());
    assert_eq!(escalate.invocations(), 0);
}

#[tokio::test(start_paused = true)]
async fn configuration_templates_resolve_from_context() {
    let notify = ScriptedAction::succeeding("test.notify");
    let h = Harness::new(vec![notify.clone()]);
    let def = h
        .deploy(
            DefinitionBuilder::linear(&[("notify", "test.notify")])
                .configuration(
                    "notify",
                    json!({"to": "{{ employee.email }}", "subject": "Leave for {{ days }} days"}),
                )
                .build(),
        )
        .await;

    let id = h
        .start(&def, json!({"employee": {"email": "a@example.com"}, "days": 3}))
        .await;
    h.run_until_idle().await;

    assert_eq!(h.instance(id).await.status, InstanceStatus::Completed);
    assert_eq!(
        notify.configurations(),
        vec![json!({"to": "a@example.com", "subject": "Leave for 3 days"})]
    );
}

#[tokio::test(start_paused = true)]
async fn later_steps_see_merged_results() {
    let lookup = ScriptedAction::succeeding("test.lookup")
        .script(vec![Scripted::Return(json!({"manager": "m-7"}))]);
    let notify = ScriptedAction::succeeding("test.notify");
    let h = Harness::new(vec![lookup, notify.clone()]);
    let def = h
        .deploy(
            DefinitionBuilder::linear(&[("lookup", "test.lookup"), ("notify", "test.notify")])
                .configuration("notify", json!({"to": "{{ manager }}"}))
                .build(),
        )
        .await;

    let id = h.start(&def, json!({})).await;
    h.run_until_idle().await;

    let instance = h.instance(id).await;
    assert_eq!(instance.context["manager"], "m-7");
    assert_eq!(notify.configurations(), vec![json!({"to": "m-7"})]);
}

// ---------------------------------------------------------------------------
// Authorization
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn denied_permission_fails_without_invoking() {
    let payout = ScriptedAction::succeeding("test.payout").permission("finance.payout");
    let h = Harness::with_authorizer(
        vec![payout.clone()],
        Arc::new(PermissionSet::new(["hr.*"])),
    );
    let def = h
        .deploy(DefinitionBuilder::linear(&[("payout", "test.payout")]).build())
        .await;

    let id = h.start(&def, json!({})).await;
    h.run_until_idle().await;

    assert_eq!(payout.invocations(), 0);
    let instance = h.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Failed);
    assert_eq!(instance.error.unwrap().code, codes::AUTHORIZATION_DENIED);

    let steps = h.steps(id).await;
    assert_eq!(steps.len(), 1);
    let error = steps[0].error_details.as_ref().unwrap();
    assert_eq!(error.code, codes::AUTHORIZATION_DENIED);
    assert!(!error.retryable);
}

#[tokio::test(start_paused = true)]
async fn granted_prefix_permission_allows_invocation() {
    let payout = ScriptedAction::succeeding("test.payout").permission("finance.payout");
    let h = Harness::with_authorizer(
        vec![payout.clone()],
        Arc::new(PermissionSet::new(["finance.*"])),
    );
    let def = h
        .deploy(DefinitionBuilder::linear(&[("payout", "test.payout")]).build())
        .await;

    let id = h.start(&def, json!({})).await;
    h.run_until_idle().await;

    assert_eq!(payout.invocations(), 1);
    assert_eq!(h.instance(id).await.status, InstanceStatus::Completed);
}

// ---------------------------------------------------------------------------
// Manual retry
// ---------------------------------------------------------------------------

fn query(h: &Harness) -> ExecutionQuery<crate::repository::memory::InMemoryWorkflowRepository> {
    ExecutionQuery::new(Arc::clone(&h.repo), h.orchestrator.scheduler().clone())
}

#[tokio::test(start_paused = true)]
async fn retry_of_completed_step_is_a_no_op() {
    let approve = ScriptedAction::succeeding("test.approve");
    let h = Harness::new(vec![approve.clone()]);
    let def = h
        .deploy(DefinitionBuilder::linear(&[("approve", "test.approve")]).build())
        .await;
    let id = h.start(&def, json!({})).await;
    h.run_until_idle().await;
    assert_eq!(h.instance(id).await.status, InstanceStatus::Completed);

    let outcome = query(&h).request_retry(id, "approve").await.unwrap();
    match outcome {
        RetryOutcome::AlreadyCompleted { execution } => {
            assert_eq!(execution.attempt_number, 1);
            assert_eq!(execution.status, StepStatus::Completed);
        }
        other => panic!("expected AlreadyCompleted, got {other:?}"),
    }
    assert!(h.queue.is_empty());

    let direct = h.orchestrator.retry_step(id, "approve").await.unwrap();
    assert!(matches!(direct, RetryStepOutcome::AlreadyCompleted(_)));

    assert_eq!(h.steps(id).await.len(), 1);
    assert_eq!(approve.invocations(), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_retry_replaces_pending_automatic_retry() {
    let flaky = ScriptedAction::succeeding("test.flaky").script(vec![Scripted::Fail(transient())]);
    let h = Harness::new(vec![flaky.clone()]);
    let def = h
        .deploy(
            DefinitionBuilder::linear(&[("charge", "test.flaky")])
                .max_retries("charge", 3)
                .build(),
        )
        .await;
    let id = h.start(&def, json!({})).await;

    let item = h.queue.try_next().expect("advance queued on start");
    process_item(&h.orchestrator, item, BUSY_REQUEUE).await;
    let pending = h.queue.pending_retries();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].source, RetrySource::Automatic);

    let outcome = query(&h).request_retry(id, "charge").await.unwrap();
    let RetryOutcome::Accepted { request } = outcome else {
        panic!("expected Accepted");
    };
    assert_eq!(request.source, RetrySource::Manual);
    assert_eq!(request.eligible_at, request.requested_at);

    let pending = h.queue.pending_retries();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].source, RetrySource::Manual);

    h.run_until_idle().await;
    assert_eq!(h.instance(id).await.status, InstanceStatus::Completed);
    assert_eq!(flaky.invocations(), 2);
    assert_ledger_invariants(&h.steps(id).await);
}

#[tokio::test(start_paused = true)]
async fn retry_request_rejections() {
    let flaky = ScriptedAction::failing("test.flaky", transient());
    let h = Harness::new(vec![flaky.clone()]);
    let def = h
        .deploy(
            DefinitionBuilder::linear(&[("charge", "test.flaky")])
                .max_retries("charge", 3)
                .build(),
        )
        .await;
    let q = query(&h);

    let err = q.request_retry(Uuid::now_v7(), "charge").await.unwrap_err();
    assert!(matches!(err, RetryError::InstanceNotFound(_)));

    let id = h.start(&def, json!({})).await;
    let err = q.request_retry(id, "charge").await.unwrap_err();
    assert!(matches!(err, RetryError::StepNotFound { .. }));

    let item = h.queue.try_next().unwrap();
    process_item(&h.orchestrator, item, BUSY_REQUEUE).await;
    h.orchestrator.cancel(id).await.unwrap();
    let err = q.request_retry(id, "charge").await.unwrap_err();
    assert!(matches!(
        err,
        RetryError::InstanceNotRetryable {
            status: InstanceStatus::Cancelled,
            ..
        }
    ));

    // an exhausted step reports the limit before the instance status
    let exhausted = h.start(&def, json!({})).await;
    h.run_until_idle().await;
    assert_eq!(h.instance(exhausted).await.status, InstanceStatus::Failed);
    let err = q.request_retry(exhausted, "charge").await.unwrap_err();
    assert!(matches!(
        err,
        RetryError::RetryLimitExceeded {
            retry_count: 3,
            max_retries: 3,
            ..
        }
    ));
}

#[tokio::test(start_paused = true)]
async fn retry_step_rejects_exhausted_and_unknown_steps() {
    let h = Harness::new(vec![ScriptedAction::failing("test.flaky", transient())]);
    let def = h
        .deploy(
            DefinitionBuilder::linear(&[("charge", "test.flaky")])
                .max_retries("charge", 1)
                .build(),
        )
        .await;
    let id = h.start(&def, json!({})).await;

    let err = h.orchestrator.retry_step(id, "charge").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::StepNotFound { .. }));

    h.run_until_idle().await;
    assert_eq!(h.instance(id).await.status, InstanceStatus::Failed);

    // same answer as the retry request path for an exhausted step
    let err = h.orchestrator.retry_step(id, "charge").await.unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::RetryLimitExceeded {
            retry_count: 1,
            max_retries: 1,
            ..
        }
    ));
    let err = query(&h).request_retry(id, "charge").await.unwrap_err();
    assert!(matches!(err, RetryError::RetryLimitExceeded { .. }));
    assert_eq!(h.steps(id).await.len(), 1);
}

// ---------------------------------------------------------------------------
// Concurrency and cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_advances_execute_the_step_once() {
    let gate = Arc::new(Notify::new());
    let slow = ScriptedAction::succeeding("test.gated").gated(Arc::clone(&gate));
    let h = Harness::new(vec![slow.clone()]);
    let def = h
        .deploy(DefinitionBuilder::linear(&[("work", "test.gated")]).build())
        .await;
    let id = h.start(&def, json!({})).await;

    let (first, second) = tokio::join!(h.orchestrator.advance(id), async {
        let outcome = h.orchestrator.advance(id).await;
        gate.notify_one();
        outcome
    });

    let outcomes = [first.unwrap(), second.unwrap()];
    assert_eq!(
        outcomes.iter().filter(|o| **o == AdvanceOutcome::Busy).count(),
        1
    );
    assert!(outcomes.contains(&AdvanceOutcome::Continue));
    assert_eq!(slow.invocations(), 1);
    assert_eq!(h.steps(id).await.len(), 1);

    h.run_until_idle().await;
    assert_eq!(h.instance(id).await.status, InstanceStatus::Completed);
    assert_eq!(h.steps(id).await.len(), 1);
}

#[tokio::test]
async fn cancel_during_attempt_discards_result() {
    let gate = Arc::new(Notify::new());
    let work = ScriptedAction::succeeding("test.gated").gated(Arc::clone(&gate));
    let next = ScriptedAction::succeeding("test.next");
    let h = Harness::new(vec![work.clone(), next.clone()]);
    let def = h
        .deploy(DefinitionBuilder::linear(&[("work", "test.gated"), ("next", "test.next")]).build())
        .await;
    let id = h.start(&def, json!({})).await;

    let orchestrator = Arc::clone(&h.orchestrator);
    let running = tokio::spawn(async move { orchestrator.drive(id).await });
    while work.invocations() == 0 {
        tokio::task::yield_now().await;
    }

    let cancelled = h.orchestrator.cancel(id).await.unwrap();
    assert_eq!(cancelled.status, InstanceStatus::Cancelled);
    gate.notify_one();

    let outcome = running.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        AdvanceOutcome::Inactive {
            status: InstanceStatus::Cancelled
        }
    );

    let instance = h.instance(id).await;
    assert!(instance.context.get("work_attempt").is_none());
    assert_eq!(instance.current_node_id.as_deref(), Some("work"));
    let steps = h.steps(id).await;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert_eq!(next.invocations(), 0);

    let err = h.orchestrator.cancel(id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::State(_)));
}

#[tokio::test]
async fn busy_drive_is_requeued() {
    let gate = Arc::new(Notify::new());
    let work = ScriptedAction::succeeding("test.gated").gated(Arc::clone(&gate));
    let h = Harness::new(vec![work.clone()]);
    let def = h
        .deploy(DefinitionBuilder::linear(&[("work", "test.gated")]).build())
        .await;
    let id = h.start(&def, json!({})).await;
    let queued = h.queue.try_next().unwrap();

    let orchestrator = Arc::clone(&h.orchestrator);
    let running = tokio::spawn(async move { orchestrator.drive(id).await });
    while work.invocations() == 0 {
        tokio::task::yield_now().await;
    }

    process_item(&h.orchestrator, queued, BUSY_REQUEUE).await;
    assert_eq!(h.queue.len(), 1);

    gate.notify_one();
    running.await.unwrap().unwrap();
    h.run_until_idle().await;
    assert_eq!(h.instance(id).await.status, InstanceStatus::Completed);
    assert_eq!(work.invocations(), 1);
}

#[tokio::test(start_paused = true)]
async fn second_engine_on_shared_store_does_not_rerun_in_flight_step() {
    let repo = Arc::new(InMemoryWorkflowRepository::new());
    let slow = ScriptedAction::succeeding("test.slow").delayed(Duration::from_secs(45));
    let serving = Harness::with_repo(Arc::clone(&repo), vec![slow.clone()], Arc::new(AllowAll));
    let other = Harness::with_repo(Arc::clone(&repo), vec![slow.clone()], Arc::new(AllowAll));
    let def = serving
        .deploy(DefinitionBuilder::linear(&[("work", "test.slow")]).build())
        .await;
    let id = serving.start(&def, json!({})).await;

    let orchestrator = Arc::clone(&serving.orchestrator);
    let running = tokio::spawn(async move { orchestrator.drive(id).await });
    while slow.invocations() == 0 {
        tokio::task::yield_now().await;
    }

    // the other engine sees a running attempt but cannot take the instance
    let report = other.orchestrator.recover().await.unwrap();
    assert_eq!(report.advances, 1);
    assert_eq!(other.orchestrator.drive(id).await.unwrap(), AdvanceOutcome::Busy);
    other.run_until_idle().await;

    assert_eq!(
        running.await.unwrap().unwrap(),
        AdvanceOutcome::Settled {
            status: InstanceStatus::Completed
        }
    );
    assert_eq!(slow.invocations(), 1);
    let steps = other.steps(id).await;
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].status, StepStatus::Completed);
    assert!(steps[0].error_details.is_none());
    assert_eq!(other.instance(id).await.status, InstanceStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn expired_lease_is_taken_over_and_live_lease_is_respected() {
    let work = ScriptedAction::succeeding("test.work");
    let h = Harness::new(vec![work.clone()]);
    let def = h
        .deploy(DefinitionBuilder::linear(&[("work", "test.work")]).build())
        .await;
    let now = chrono::Utc::now();

    // an engine died mid-attempt; its lease has run out
    let mut abandoned = pending_instance();
    abandoned.definition_id = def.id;
    abandoned.definition_version = def.version;
    abandoned.status = InstanceStatus::Running;
    abandoned.current_node_id = Some("work".to_string());
    h.repo.create_instance(&abandoned).await.unwrap();
    h.repo
        .create_step_execution(&StepExecution::begin(abandoned.id, "work", "work", "test.work", 1, 0, 3))
        .await
        .unwrap();
    let dead = Uuid::now_v7();
    h.repo
        .acquire_instance_lease(&abandoned.id, &dead, now - chrono::Duration::seconds(90), now - chrono::Duration::seconds(60))
        .await
        .unwrap();

    // another engine is alive and working on this one
    let mut leased = abandoned.clone();
    leased.id = Uuid::now_v7();
    h.repo.create_instance(&leased).await.unwrap();
    let alive = Uuid::now_v7();
    h.repo
        .acquire_instance_lease(&leased.id, &alive, now, now + chrono::Duration::hours(1))
        .await
        .unwrap();

    assert_eq!(h.orchestrator.drive(leased.id).await.unwrap(), AdvanceOutcome::Busy);
    assert!(h.steps(leased.id).await.is_empty());

    h.orchestrator.drive(abandoned.id).await.unwrap();
    h.run_until_idle().await;
    assert_eq!(h.instance(abandoned.id).await.status, InstanceStatus::Completed);
    let steps = h.steps(abandoned.id).await;
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].error_details.as_ref().unwrap().code, codes::INTERRUPTED);
    assert_eq!(steps[1].status, StepStatus::Completed);
    assert_ledger_invariants(&steps);
}

// ---------------------------------------------------------------------------
// Compensation and recovery
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failed_compensation_strands_instance_until_resumed() {
    let reserve = ScriptedAction::succeeding("test.reserve").compensable();
    reserve.fail_compensation(Some(ActionError::failed("inventory service down")));
    let charge = ScriptedAction::failing("test.charge", ActionError::fatal("CARD_DECLINED", "declined"));
    let h = Harness::new(vec![reserve.clone(), charge]);
    let def = h
        .deploy(
            DefinitionBuilder::linear(&[("reserve", "test.reserve"), ("charge", "test.charge")]).build(),
        )
        .await;

    let id = h.start(&def, json!({})).await;
    h.run_until_idle().await;

    let instance = h.instance(id).await;
    assert_eq!(instance.status, InstanceStatus::Compensating);
    assert_eq!(instance.error.unwrap().code, codes::COMPENSATION_FAILED);

    let report = h.orchestrator.recover().await.unwrap();
    assert_eq!(report.stranded_compensating, 1);
    assert!(h.queue.is_empty());

    reserve.fail_compensation(None);
    let report = h.orchestrator.compensate(id).await.unwrap();
    assert_eq!(report.compensated_steps, vec!["reserve"]);
    assert_eq!(report.final_status, InstanceStatus::Compensated);
    assert_eq!(reserve.compensations(), 1);

    // nothing left to undo
    let err = h.orchestrator.compensate(id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Compensation(_)));
}

#[tokio::test(start_paused = true)]
async fn cancelled_instance_can_be_compensated_on_request() {
    let gate = Arc::new(Notify::new());
    let reserve = ScriptedAction::succeeding("test.reserve").compensable();
    let hold = ScriptedAction::succeeding("test.hold").gated(Arc::clone(&gate));
    let h = Harness::new(vec![reserve.clone(), hold.clone()]);
    let def = h
        .deploy(DefinitionBuilder::linear(&[("reserve", "test.reserve"), ("hold", "test.hold")]).build())
        .await;
    let id = h.start(&def, json!({})).await;

    let orchestrator = Arc::clone(&h.orchestrator);
    let running = tokio::spawn(async move { orchestrator.drive(id).await });
    while hold.invocations() == 0 {
        tokio::task::yield_now().await;
    }
    h.orchestrator.cancel(id).await.unwrap();
    gate.notify_one();
    running.await.unwrap().unwrap();

    let report = h.orchestrator.compensate(id).await.unwrap();
    assert_eq!(report.compensated_steps, vec!["reserve"]);
    assert_eq!(h.instance(id).await.status, InstanceStatus::Compensated);
    // the held step completed after cancellation but is not compensable
    assert_eq!(h.steps_for(id, "hold").await[0].status, StepStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn interrupted_attempt_is_recovered_and_retried() {
    let work = ScriptedAction::succeeding("test.work");
    let h = Harness::new(vec![work.clone()]);
    let def = h
        .deploy(DefinitionBuilder::linear(&[("work", "test.work")]).build())
        .await;

    // state left behind by a crash mid-attempt
    let mut instance = pending_instance();
    instance.definition_id = def.id;
    instance.definition_version = def.version;
    instance.status = InstanceStatus::Running;
    instance.current_node_id = Some("work".to_string());
    h.repo.create_instance(&instance).await.unwrap();
    let orphan = StepExecution::begin(instance.id, "work", "work", "test.work", 1, 0, 3);
    h.repo.create_step_execution(&orphan).await.unwrap();

    let mut pending = pending_instance();
    pending.definition_id = def.id;
    pending.definition_version = def.version;
    pending.current_node_id = Some("start".to_string());
    h.repo.create_instance(&pending).await.unwrap();

    let report = h.orchestrator.recover().await.unwrap();
    assert_eq!(report.advances, 1);
    assert_eq!(report.resumed_pending, 1);
    h.run_until_idle().await;

    assert_eq!(h.instance(instance.id).await.status, InstanceStatus::Completed);
    assert_eq!(h.instance(pending.id).await.status, InstanceStatus::Completed);

    let steps = h.steps(instance.id).await;
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].error_details.as_ref().unwrap().code, codes::INTERRUPTED);
    assert_eq!(steps[1].status, StepStatus::Completed);
    assert_ledger_invariants(&steps);
}

#[tokio::test(start_paused = true)]
async fn recovery_requeues_failed_step_awaiting_retry() {
    let flaky = ScriptedAction::succeeding("test.flaky").script(vec![Scripted::Fail(transient())]);
    let repo = Arc::new(InMemoryWorkflowRepository::new());
    let h = Harness::with_repo(
        Arc::clone(&repo),
        vec![flaky.clone()],
        Arc::new(AllowAll),
    );
    let def = h
        .deploy(DefinitionBuilder::linear(&[("charge", "test.flaky")]).build())
        .await;
    let id = h.start(&def, json!({})).await;
    let item = h.queue.try_next().unwrap();
    process_item(&h.orchestrator, item, BUSY_REQUEUE).await;
    drop(h);

    // restart: same durable state, fresh queue
    let restarted = Harness::with_repo(repo, vec![flaky.clone()], Arc::new(AllowAll));
    let report = restarted.orchestrator.recover().await.unwrap();
    assert_eq!(report.retries, 1);
    assert_eq!(report.advances, 0);
    restarted.run_until_idle().await;

    assert_eq!(restarted.instance(id).await.status, InstanceStatus::Completed);
    assert_eq!(flaky.invocations(), 2);
}

// ---------------------------------------------------------------------------
// Engine lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn engine_workers_drive_instances_to_completion() {
    let a = ScriptedAction::succeeding("test.a");
    let b = ScriptedAction::succeeding("test.b").script(vec![Scripted::Fail(transient())]);
    let h = Harness::new(vec![a, b]);
    let def = h
        .deploy(DefinitionBuilder::linear(&[("a", "test.a"), ("b", "test.b")]).build())
        .await;

    let engine = WorkflowEngine::new(Arc::clone(&h.orchestrator), 2, BUSY_REQUEUE);
    engine.start().await.unwrap();
    let ids = [
        h.start(&def, json!({})).await,
        h.start(&def, json!({})).await,
        h.start(&def, json!({})).await,
    ];

    for id in ids {
        let mut settled = false;
        for _ in 0..200 {
            if h.instance(id).await.status.is_settled() {
                settled = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(settled, "instance {id} did not settle");
        assert_eq!(h.instance(id).await.status, InstanceStatus::Completed);
    }

    engine.shutdown().await;
    assert!(!engine.is_running());
}

#[tokio::test]
async fn start_rejects_inactive_definition() {
    let h = Harness::new(vec![ScriptedAction::succeeding("test.a")]);
    let def = h
        .deploy(DefinitionBuilder::linear(&[("a", "test.a")]).inactive().build())
        .await;

    let err = h.orchestrator.start(def.id, json!({})).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::DefinitionInactive { .. }));
    let err = h.orchestrator.start(Uuid::now_v7(), json!({})).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::DefinitionNotFound(_)));
}

#[tokio::test]
async fn inactive_edit_does_not_stop_new_starts() {
    let h = Harness::new(vec![ScriptedAction::succeeding("test.a")]);
    let v1 = h
        .deploy(DefinitionBuilder::linear(&[("a", "test.a")]).build())
        .await;
    h.start(&v1, json!({})).await;

    let mut edit = v1.clone();
    edit.is_active = false;
    edit.description = Some("draft".to_string());
    let v2 = h.deploy(edit).await;
    assert_eq!(v2.version, 2);

    let instance = h.orchestrator.start(v1.id, json!({})).await.unwrap();
    assert_eq!(instance.definition_version, 1);

    h.orchestrator.definitions().activate(&v1.id, Some(2)).await.unwrap();
    let instance = h.orchestrator.start(v1.id, json!({})).await.unwrap();
    assert_eq!(instance.definition_version, 2);
}

#[tokio::test]
async fn start_normalizes_non_object_context() {
    let h = Harness::new(vec![ScriptedAction::succeeding("test.a")]);
    let def = h
        .deploy(DefinitionBuilder::linear(&[("a", "test.a")]).build())
        .await;

    let instance = h.orchestrator.start(def.id, json!(42)).await.unwrap();
    assert_eq!(instance.status, InstanceStatus::Running);
    assert_eq!(instance.context, json!({"input": 42}));
    assert_eq!(instance.current_node_id.as_deref(), Some("a"));
}
