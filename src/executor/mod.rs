//! Retry-driven execution.
//!
//! [`execute_with_retry`] is the single place that decides between retrying
//! and giving up: every failure is a [`TaskError`], either `Transient`
//! (backoff and try again while the [`RetryPolicy`] allows) or `Permanent`
//! (stop now). [`TaskExecutor`] dispatches queued [`Action`]s to registered
//! handlers over a bounded pool; [`QueueWorker`] drives store tasks through
//! the router and sanitizer.

pub mod actions;
pub mod worker;

pub use actions::{
    enqueue_registry, extract_actions, Action, ActionHandler, ActionQueue, ActionType,
    EnqueueTaskHandler, HandlerRegistry, RegistryError,
};
pub use worker::{settle_failure, DrainReport, Outcome, QueueWorker, WorkerConfig};

use futures::stream::{self, StreamExt};
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::LlmError;
use crate::router::RouterError;
use crate::store::StoreError;

/// Retryable HTTP statuses quoted as whole numbers in an error message.
static TRANSIENT_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:429|50[0234])\b").unwrap());

// ─────────────────────────────────────────────────────────────────────────────
// Retry policy
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(attempt-1)` capped at `max`, optionally with up to 25%
    /// random jitter added.
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(d) => *d,
            Backoff::Exponential { base, max, jitter } => {
                let exp = attempt.saturating_sub(1).min(16);
                let raw = base.saturating_mul(1u32 << exp).min(*max);
                if *jitter && !raw.is_zero() {
                    let extra = rand::thread_rng().gen_range(0..=raw.as_millis() as u64 / 4);
                    (raw + Duration::from_millis(extra)).min(*max)
                } else {
                    raw
                }
            }
        }
    }
}

/// How many times to run a unit of work and how long to wait in between.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first. `None` retries transient
    /// failures until success or cancellation.
    pub max_attempts: Option<u32>,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            backoff: Backoff::Exponential {
                base: Duration::from_secs(2),
                max: Duration::from_secs(60),
                jitter: true,
            },
        }
    }
}

impl RetryPolicy {
    pub fn bounded(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
            backoff,
        }
    }

    pub fn unbounded(backoff: Backoff) -> Self {
        Self {
            max_attempts: None,
            backoff,
        }
    }

    /// Whether another attempt may follow `attempts_made`.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error classification
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// Quota, rate limit, timeout or contention. Worth another attempt.
    #[error("{message}")]
    Transient {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Auth, malformed request, missing handler. Retrying cannot help.
    #[error("{message}")]
    Permanent { message: String },
}

impl TaskError {
    pub fn transient(message: impl Into<String>) -> Self {
        TaskError::Transient {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        TaskError::Permanent {
            message: message.into(),
        }
    }

    /// Classify an unstructured error message.
    ///
    /// Only for sources that carry no error kind; anything not recognisably
    /// transient is permanent.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        let transient = [
            "quota",
            "rate limit",
            "ratelimit",
            "too many requests",
            "timeout",
            "timed out",
            "temporarily",
        ]
        .iter()
        .any(|needle| lower.contains(needle))
            || TRANSIENT_STATUS.is_match(&lower);
        if transient {
            TaskError::transient(message)
        } else {
            TaskError::permanent(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::Transient { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            TaskError::Transient { message, .. } | TaskError::Permanent { message } => message,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TaskError::Transient { retry_after, .. } => *retry_after,
            TaskError::Permanent { .. } => None,
        }
    }
}

impl From<LlmError> for TaskError {
    fn from(err: LlmError) -> Self {
        if err.is_transient() {
            TaskError::Transient {
                retry_after: err.retry_after,
                message: err.to_string(),
            }
        } else {
            TaskError::permanent(err.to_string())
        }
    }
}

impl From<RouterError> for TaskError {
    fn from(err: RouterError) -> Self {
        if err.is_permanent() {
            TaskError::permanent(err.to_string())
        } else {
            TaskError::transient(err.to_string())
        }
    }
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Contention { .. } => TaskError::transient(err.to_string()),
            other => TaskError::permanent(other.to_string()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Execution
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub action_id: String,
    pub success: bool,
    pub result_data: Option<serde_json::Value>,
    pub execution_time: Duration,
    pub error: Option<String>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails permanently, exhausts `policy`, or
/// `cancel` fires during a backoff wait. Never returns an error: every
/// outcome is a [`TaskResult`].
pub async fn execute_with_retry<F, Fut>(
    id: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> TaskResult
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<serde_json::Value, TaskError>>,
{
    let start = Instant::now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let error = match op().await {
            Ok(data) => {
                if attempts > 1 {
                    tracing::info!(action_id = id, attempts, "Succeeded after retries");
                }
                return TaskResult {
                    action_id: id.to_string(),
                    success: true,
                    result_data: Some(data),
                    execution_time: start.elapsed(),
                    error: None,
                    attempts,
                };
            }
            Err(e) => e,
        };

        if !error.is_transient() || !policy.allows_another(attempts) {
            tracing::warn!(
                action_id = id,
                attempts,
                transient = error.is_transient(),
                "Giving up: {}",
                error
            );
            return failed(id, start, attempts, error.message().to_string());
        }

        let delay = error
            .retry_after()
            .unwrap_or_else(|| policy.backoff.delay(attempts));
        tracing::info!(
            action_id = id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, backing off: {}",
            error
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                return failed(id, start, attempts, format!("cancelled during backoff after: {}", error));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

fn failed(id: &str, start: Instant, attempts: u32, error: String) -> TaskResult {
    TaskResult {
        action_id: id.to_string(),
        success: false,
        result_data: None,
        execution_time: start.elapsed(),
        error: Some(error),
        attempts,
    }
}

#[derive(Debug, Default)]
pub struct ExecutorStats {
    executed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub executed: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl ExecutorStats {
    fn record(&self, success: bool) {
        self.executed.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            executed: self.executed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Dispatches queued actions to their handlers.
pub struct TaskExecutor {
    registry: HandlerRegistry,
    queue: Arc<ActionQueue>,
    policy: RetryPolicy,
    max_workers: usize,
    stats: ExecutorStats,
    cancel: CancellationToken,
}

impl TaskExecutor {
    pub fn new(
        registry: HandlerRegistry,
        policy: RetryPolicy,
        max_workers: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            queue: Arc::new(ActionQueue::new()),
            policy,
            max_workers: max_workers.max(1),
            stats: ExecutorStats::default(),
            cancel,
        }
    }

    pub fn queue(&self) -> &Arc<ActionQueue> {
        &self.queue
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Run one action through its handler with the executor's policy.
    pub async fn execute(&self, action: &Action) -> TaskResult {
        let result = match self.registry.get(action.action_type) {
            Some(handler) => {
                execute_with_retry(&action.id, &self.policy, &self.cancel, || {
                    handler.handle(action)
                })
                .await
            }
            None => {
                tracing::warn!(
                    action_id = %action.id,
                    action_type = %action.action_type,
                    "No handler registered"
                );
                TaskResult {
                    action_id: action.id.clone(),
                    success: false,
                    result_data: None,
                    execution_time: Duration::ZERO,
                    error: Some(format!("No handler registered for {}", action.action_type)),
                    attempts: 0,
                }
            }
        };
        self.stats.record(result.success);
        result
    }

    /// Drain the action queue across at most `max_workers` concurrent
    /// handlers. Results come back in completion order.
    pub async fn execute_all_pending(&self) -> Vec<TaskResult> {
        let pending = self.queue.drain();
        if pending.is_empty() {
            return Vec::new();
        }
        tracing::info!(
            actions = pending.len(),
            workers = self.max_workers,
            "Executing pending actions"
        );

        let results: Vec<TaskResult> = stream::iter(pending)
            .map(|action| async move { self.execute(&action).await })
            .buffer_unordered(self.max_workers)
            .collect()
            .await;

        let succeeded = results.iter().filter(|r| r.success).count();
        tracing::info!(
            succeeded,
            failed = results.len() - succeeded,
            "Action batch finished"
        );
        results
    }
}
