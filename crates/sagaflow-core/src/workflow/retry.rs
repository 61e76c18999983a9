//! Retry subsystem: backoff policy, the engine work queue, and the scheduler.
//!
//! The queue is ephemeral. After a restart it is rebuilt from
//! `step_executions` by [`super::orchestrator::Orchestrator::recover`].

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use sagaflow_types::config::RetryPolicyConfig;
use sagaflow_types::event::EngineEvent;
use sagaflow_types::step::{RetryRequest, RetrySource};
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;

// ---------------------------------------------------------------------------
// BackoffPolicy
// ---------------------------------------------------------------------------

/// Exponential backoff with uniform jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the delay used as jitter amplitude, clamped to `0.0..=1.0`.
    pub jitter_ratio: f64,
}

impl BackoffPolicy {
    pub fn from_config(config: &RetryPolicyConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_ratio: config.jitter_ratio.clamp(0.0, 1.0),
        }
    }

    /// `min(base * 2^(retry_count - 1), max)`, without jitter.
    pub fn base_delay_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Backoff delay with jitter applied, never negative.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let base = self.base_delay_for(retry_count).as_secs_f64();
        let spread = base * self.jitter_ratio;
        let offset = (rand::random::<f64>() * 2.0 - 1.0) * spread;
        Duration::from_secs_f64((base + offset).max(0.0))
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&RetryPolicyConfig::default())
    }
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

/// A unit of work for the engine's worker pool.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    /// Drive an instance forward from its current node.
    Advance { instance_id: Uuid },
    /// Re-attempt a failed step.
    Retry(RetryRequest),
}

impl WorkItem {
    pub fn instance_id(&self) -> Uuid {
        match self {
            WorkItem::Advance { instance_id } => *instance_id,
            WorkItem::Retry(request) => request.instance_id,
        }
    }
}

struct Scheduled {
    due: Instant,
    seq: u64,
    item: WorkItem,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // Reversed so the max-heap pops the earliest item first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Delay-aware multi-consumer work queue.
///
/// Items become visible to [`next`](Self::next) once their delay elapses;
/// equal due times are served in push order.
#[derive(Default)]
pub struct WorkQueue {
    heap: Mutex<BinaryHeap<Scheduled>>,
    seq: AtomicU64,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn heap(&self) -> MutexGuard<'_, BinaryHeap<Scheduled>> {
        self.heap.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedule an item after `delay`.
    ///
    /// A retry for a step that already has one queued replaces it, so a
    /// manual request promotes a pending automatic retry instead of doubling it.
    pub fn push(&self, item: WorkItem, delay: Duration) {
        let due = Instant::now() + delay;
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        {
            let mut heap = self.heap();
            if let WorkItem::Retry(request) = &item {
                heap.retain(|s| match &s.item {
                    WorkItem::Retry(queued) => {
                        queued.instance_id != request.instance_id || queued.step_id != request.step_id
                    }
                    WorkItem::Advance { .. } => true,
                });
            }
            heap.push(Scheduled { due, seq, item });
        }
        self.notify.notify_one();
    }

    /// Wait for the next due item. Returns `None` once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait_until = {
                let mut heap = self.heap();
                match heap.peek() {
                    Some(top) if top.due <= Instant::now() => {
                        return heap.pop().map(|s| s.item);
                    }
                    Some(top) => Some(top.due),
                    None => None,
                }
            };

            let deadline = async {
                match wait_until {
                    Some(due) => tokio::time::sleep_until(due).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = &mut notified => {}
                _ = deadline => {}
            }
        }
    }

    /// Pop the next item if one is already due, without waiting.
    pub fn try_next(&self) -> Option<WorkItem> {
        let mut heap = self.heap();
        match heap.peek() {
            Some(top) if top.due <= Instant::now() => heap.pop().map(|s| s.item),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.heap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap().is_empty()
    }

    /// Queued retry requests, earliest first.
    pub fn pending_retries(&self) -> Vec<RetryRequest> {
        let heap = self.heap();
        let mut scheduled: Vec<&Scheduled> = heap.iter().collect();
        scheduled.sort_by(|a, b| b.cmp(a));
        scheduled
            .into_iter()
            .filter_map(|s| match &s.item {
                WorkItem::Retry(request) => Some(request.clone()),
                WorkItem::Advance { .. } => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// RetryScheduler
// ---------------------------------------------------------------------------

/// Enqueues advance items and retry requests with the configured backoff.
#[derive(Clone)]
pub struct RetryScheduler {
    queue: Arc<WorkQueue>,
    policy: BackoffPolicy,
    events: EventBus,
}

impl RetryScheduler {
    pub fn new(queue: Arc<WorkQueue>, policy: BackoffPolicy, events: EventBus) -> Self {
        Self {
            queue,
            policy,
            events,
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Schedule an automatic retry after the backoff for `retry_count`.
    pub fn enqueue_automatic(&self, instance_id: Uuid, step_id: &str, retry_count: u32) -> RetryRequest {
        let delay = self.policy.delay_for(retry_count);
        self.enqueue(instance_id, step_id, RetrySource::Automatic, delay)
    }

    /// Schedule a manual retry with no delay.
    ///
    /// Eligibility (limit, step, instance status) is checked by the caller,
    /// see [`super::query::ExecutionQuery::request_retry`].
    pub fn enqueue_manual(&self, instance_id: Uuid, step_id: &str) -> RetryRequest {
        self.enqueue(instance_id, step_id, RetrySource::Manual, Duration::ZERO)
    }

    /// Schedule an advance of the instance.
    pub fn schedule_advance(&self, instance_id: Uuid) {
        self.queue
            .push(WorkItem::Advance { instance_id }, Duration::ZERO);
    }

    /// Put an item back after `delay` (used when the instance was busy).
    pub fn requeue(&self, item: WorkItem, delay: Duration) {
        self.queue.push(item, delay);
    }

    fn enqueue(&self, instance_id: Uuid, step_id: &str, source: RetrySource, delay: Duration) -> RetryRequest {
        let requested_at = Utc::now();
        let eligible_at = requested_at
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let request = RetryRequest {
            instance_id,
            step_id: step_id.to_string(),
            requested_at,
            eligible_at,
            source,
        };
        tracing::info!(
            instance_id = %instance_id,
            step_id,
            source = ?source,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
        self.queue.push(WorkItem::Retry(request.clone()), delay);
        self.events.publish(EngineEvent::RetryScheduled {
            instance_id,
            step_id: step_id.to_string(),
            source,
            eligible_at,
        });
        request
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
