//! Worker pool driving instances from the shared work queue.
//!
//! `start` first rebuilds the queue from durable state (see
//! [`Orchestrator::recover`]) and then spawns `worker_count` workers. Each
//! worker pulls due items and hands them to [`process_item`]. `shutdown`
//! cancels the workers and waits for in-flight items to finish.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::orchestrator::{AdvanceOutcome, Orchestrator, OrchestratorError, RecoveryReport, RetryStepOutcome};
use super::retry::{WorkItem, WorkQueue};
use crate::repository::workflow::WorkflowRepository;

pub struct WorkflowEngine<R: WorkflowRepository + 'static> {
    orchestrator: Arc<Orchestrator<R>>,
    queue: Arc<WorkQueue>,
    worker_count: usize,
    busy_requeue: Duration,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<R: WorkflowRepository + 'static> WorkflowEngine<R> {
    pub fn new(
        orchestrator: Arc<Orchestrator<R>>,
        worker_count: usize,
        busy_requeue: Duration,
    ) -> Self {
        let queue = Arc::clone(orchestrator.scheduler().queue());
        Self {
            orchestrator,
            queue,
            worker_count: worker_count.max(1),
            busy_requeue,
            cancel: CancellationToken::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator<R>> {
        &self.orchestrator
    }

    /// Recover durable state and spawn the workers.
    pub async fn start(&self) -> Result<RecoveryReport, OrchestratorError> {
        let report = self.orchestrator.recover().await?;

        let mut handles = Vec::with_capacity(self.worker_count);
        for worker in 0..self.worker_count {
            let orchestrator = Arc::clone(&self.orchestrator);
            let queue = Arc::clone(&self.queue);
            let cancel = self.cancel.clone();
            let busy_requeue = self.busy_requeue;
            handles.push(tokio::spawn(async move {
                tracing::debug!(worker, "workflow worker started");
                while let Some(item) = queue.next(&cancel).await {
                    process_item(&orchestrator, item, busy_requeue).await;
                }
                tracing::debug!(worker, "workflow worker stopped");
            }));
        }

        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(handles);
        tracing::info!(workers = self.worker_count, "workflow engine started");
        Ok(report)
    }

    /// Stop pulling new work and wait for running items to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "workflow worker panicked");
            }
        }
        tracing::info!("workflow engine stopped");
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

/// Handle one queue item.
///
/// Items for a busy instance are put back after `busy_requeue`; the lock
/// holder may stop at a point this item was meant to move past.
pub async fn process_item<R: WorkflowRepository>(
    orchestrator: &Orchestrator<R>,
    item: WorkItem,
    busy_requeue: Duration,
) {
    let instance_id = item.instance_id();
    match &item {
        WorkItem::Advance { .. } => match orchestrator.drive(instance_id).await {
            Ok(AdvanceOutcome::Busy) => {
                orchestrator.scheduler().requeue(item.clone(), busy_requeue);
            }
            Ok(outcome) => {
                tracing::debug!(instance_id = %instance_id, ?outcome, "advance finished");
            }
            Err(e) => {
                tracing::error!(instance_id = %instance_id, error = %e, "advance failed");
            }
        },
        WorkItem::Retry(request) => {
            match orchestrator.retry_step(instance_id, &request.step_id).await {
                Ok(RetryStepOutcome::Busy) => {
                    orchestrator.scheduler().requeue(item.clone(), busy_requeue);
                }
                Ok(RetryStepOutcome::AlreadyCompleted(execution)) => {
                    tracing::debug!(
                        instance_id = %instance_id,
                        step_id = %request.step_id,
                        attempt = execution.attempt_number,
                        "retry skipped, step already completed"
                    );
                }
                Ok(RetryStepOutcome::Executed(outcome)) => {
                    tracing::debug!(
                        instance_id = %instance_id,
                        step_id = %request.step_id,
                        ?outcome,
                        "retry finished"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        instance_id = %instance_id,
                        step_id = %request.step_id,
                        error = %e,
                        "retry rejected"
                    );
                }
            }
        }
    }
}
