//! Queue worker: claims tasks and runs them through router and sanitizer.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{extract_actions, TaskError, TaskExecutor};
use crate::router::ProviderRouter;
use crate::sanitizer::Sanitizer;
use crate::store::{ClaimFilter, JobStore, StoreError, Task, TaskStatus, TaskType};
use crate::util::now_string;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Tasks claimed per cycle.
    pub max_tasks: usize,
    /// Tasks processed concurrently within a cycle.
    pub concurrency: usize,
    /// Attempts after which a transient failure becomes terminal.
    pub max_attempts: u32,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_tasks: 5,
            concurrency: 2,
            max_attempts: 3,
            poll_interval: Duration::from_secs(10),
        }
    }
}

/// What happened to one claimed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Completed,
    Flagged,
    Requeued,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub claimed: usize,
    pub completed: usize,
    pub flagged: usize,
    pub requeued: usize,
    pub failed: usize,
    /// Tasks whose outcome could not be written.
    pub errors: usize,
    pub actions_run: usize,
}

impl DrainReport {
    pub fn tally(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Completed => self.completed += 1,
            Outcome::Flagged => self.flagged += 1,
            Outcome::Requeued => self.requeued += 1,
            Outcome::Failed => self.failed += 1,
        }
    }
}

/// Requeue a transient failure or fail the task for good.
///
/// A task fails when the error is permanent or when this attempt was its
/// last one. The stored error is prefixed with the failure time.
pub async fn settle_failure(
    store: &dyn JobStore,
    task: &Task,
    error: &TaskError,
    max_attempts: u32,
) -> Result<Outcome, StoreError> {
    let message = format!("{} {}", now_string(), error.message());
    let last_attempt = task.attempts + 1 >= max_attempts.max(1);

    if !error.is_transient() || last_attempt {
        tracing::warn!(
            task_id = task.id,
            attempts = task.attempts + 1,
            transient = error.is_transient(),
            "Task failed: {}",
            error
        );
        store
            .update_result(task.id, TaskStatus::Failed, None, Some(&message))
            .await?;
        Ok(Outcome::Failed)
    } else {
        tracing::info!(
            task_id = task.id,
            attempts = task.attempts + 1,
            "Task requeued after transient failure: {}",
            error
        );
        store.requeue(task.id, Some(&message)).await?;
        Ok(Outcome::Requeued)
    }
}

pub struct QueueWorker {
    store: Arc<dyn JobStore>,
    router: Arc<ProviderRouter>,
    sanitizer: Arc<Sanitizer>,
    executor: Arc<TaskExecutor>,
    config: WorkerConfig,
}

impl QueueWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        router: Arc<ProviderRouter>,
        sanitizer: Arc<Sanitizer>,
        executor: Arc<TaskExecutor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            router,
            sanitizer,
            executor,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Produce the final status and response for a claimed task.
    async fn run_task(&self, task: &Task) -> Result<(TaskStatus, String), TaskError> {
        if task.task_type == TaskType::Insights {
            return self.run_insights(task).await;
        }

        let routed = self
            .router
            .generate(&task.prompt, task.provider_hint.as_deref())
            .await?;
        tracing::info!(
            task_id = task.id,
            provider = %routed.provider,
            model = %routed.model,
            quality = routed.quality.score,
            elapsed_ms = routed.generation_time.as_millis() as u64,
            "Generation accepted"
        );

        let validation = self
            .sanitizer
            .validate(self.store.as_ref(), task.id, &task.prompt, &routed.text)
            .await?;
        Ok((validation.status, validation.outcome.text))
    }

    /// Queue the action lines of the task's source text.
    async fn run_insights(&self, task: &Task) -> Result<(TaskStatus, String), TaskError> {
        let source = if task.prompt.trim().is_empty() {
            tokio::fs::read_to_string(&task.document_path)
                .await
                .map_err(|e| {
                    TaskError::permanent(format!("Cannot read {}: {}", task.document_path, e))
                })?
        } else {
            task.prompt.clone()
        };

        let ids = extract_actions(&source, Some(task.id), self.executor.queue());
        tracing::info!(task_id = task.id, actions = ids.len(), "Insights extracted");
        Ok((
            TaskStatus::Completed,
            format!("insights: {} action(s) [{}]", ids.len(), ids.join(", ")),
        ))
    }

    /// Run one claimed task to a recorded outcome.
    pub async fn process(&self, task: &Task) -> Result<Outcome, StoreError> {
        match self.run_task(task).await {
            Ok((status, text)) => {
                self.store
                    .update_result(task.id, status, Some(&text), None)
                    .await?;
                Ok(if status == TaskStatus::Flagged {
                    Outcome::Flagged
                } else {
                    Outcome::Completed
                })
            }
            Err(error) => {
                settle_failure(self.store.as_ref(), task, &error, self.config.max_attempts).await
            }
        }
    }

    /// Claim up to `max_tasks` and process them, then run any actions
    /// they produced. Claimed work is finished even if `cancel` fires.
    pub async fn drain_once(
        &self,
        max_tasks: usize,
        cancel: &CancellationToken,
    ) -> Result<DrainReport, StoreError> {
        let mut report = DrainReport::default();
        if cancel.is_cancelled() {
            return Ok(report);
        }

        let tasks = self.store.claim(max_tasks, &ClaimFilter::any()).await?;
        report.claimed = tasks.len();
        if !tasks.is_empty() {
            tracing::info!(claimed = tasks.len(), "Claimed tasks");
        }

        let outcomes: Vec<(i64, Result<Outcome, StoreError>)> = stream::iter(tasks)
            .map(|task| async move {
                let outcome = self.process(&task).await;
                (task.id, outcome)
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (task_id, outcome) in outcomes {
            match outcome {
                Ok(o) => report.tally(o),
                Err(e) => {
                    tracing::warn!(task_id, "Failed to record task outcome: {}", e);
                    report.errors += 1;
                }
            }
        }

        if !cancel.is_cancelled() {
            report.actions_run = self.executor.execute_all_pending().await.len();
        }
        Ok(report)
    }

    /// Release provider resources.
    pub async fn shutdown(&self) {
        self.router.unload_all().await;
    }

    /// Poll until cancelled, then unload the providers.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            max_tasks = self.config.max_tasks,
            concurrency = self.config.concurrency,
            poll_s = self.config.poll_interval.as_secs(),
            "Queue worker started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.drain_once(self.config.max_tasks, &cancel).await {
                Ok(report) if report.claimed > 0 => {
                    tracing::info!(
                        completed = report.completed,
                        flagged = report.flagged,
                        requeued = report.requeued,
                        failed = report.failed,
                        "Cycle finished"
                    );
                }
                Ok(_) => tracing::debug!("No pending tasks"),
                Err(e) => tracing::warn!("Worker cycle failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.shutdown().await;
        tracing::info!("Queue worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{HandlerRegistry, RetryPolicy};
    use crate::llm::testing::ScriptedProvider;
    use crate::llm::{LlmError, RetryConfig};
    use crate::router::{sample_digest, RouterConfig};
    use crate::sanitizer::SanitizerConfig;
    use crate::store::{NewTask, SqliteJobStore, TaskType};
    use tempfile::TempDir;

    struct Harness {
        dir: TempDir,
        store: Arc<SqliteJobStore>,
        worker: QueueWorker,
    }

    async fn harness(script: Vec<Result<String, LlmError>>, max_attempts: u32) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteJobStore::open(dir.path().join("t.db")).await.unwrap());
        let router = ProviderRouter::new(RouterConfig {
            primary: "primary".to_string(),
            priority: vec!["primary".to_string()],
            primary_retry: RetryConfig::single_attempt(),
            ..RouterConfig::default()
        })
        .with_provider(Arc::new(ScriptedProvider::new("primary", script)));
        let executor = TaskExecutor::new(
            HandlerRegistry::new(),
            RetryPolicy::default(),
            2,
            CancellationToken::new(),
        );
        let worker = QueueWorker::new(
            store.clone(),
            Arc::new(router),
            Arc::new(Sanitizer::new(SanitizerConfig::default())),
            Arc::new(executor),
            WorkerConfig {
                max_attempts,
                ..WorkerConfig::default()
            },
        );
        Harness {
            dir,
            store,
            worker,
        }
    }

    fn rate_limited() -> Result<String, LlmError> {
        Err(LlmError::rate_limited("quota".to_string(), None))
    }

    #[tokio::test]
    async fn clean_generation_completes_the_task() {
        let h = harness(vec![Ok(sample_digest())], 3).await;
        let id = h.store.add(NewTask::generate("doc.md", "Write it.")).await.unwrap();

        let report = h.worker.drain_once(5, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(report.completed, 1);

        let task = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.response.unwrap().contains("Key Takeaways"));
        assert_eq!(h.store.sanitizer_audits(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn contradicting_canonical_value_flags_the_task() {
        // The digest quotes gold at $2,345.50.
        let h = harness(vec![Ok(sample_digest())], 3).await;
        let prompt = "Write it.\nCANONICAL VALUES\n* GOLD: $4300\n";
        let id = h.store.add(NewTask::generate("doc.md", prompt)).await.unwrap();

        let report = h.worker.drain_once(5, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.flagged, 1);

        let task = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Flagged);
        assert!(task.response.unwrap().contains("$4300"));
        assert!(h.store.sanitizer_total(id).await.unwrap() >= 1);
    }

    #[tokio::test]
    async fn transient_failures_requeue_until_max_attempts_then_fail() {
        let h = harness(vec![rate_limited(), rate_limited(), rate_limited()], 3).await;
        let id = h.store.add(NewTask::generate("doc.md", "Write it.")).await.unwrap();
        let cancel = CancellationToken::new();

        for expected_attempts in 1..=2 {
            let report = h.worker.drain_once(5, &cancel).await.unwrap();
            assert_eq!(report.requeued, 1);
            let task = h.store.get(id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Pending);
            assert_eq!(task.attempts, expected_attempts);
        }

        let report = h.worker.drain_once(5, &cancel).await.unwrap();
        assert_eq!(report.failed, 1);
        let task = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("All providers failed"));
    }

    #[tokio::test]
    async fn permanent_failure_fails_on_first_attempt() {
        let h = harness(vec![Err(LlmError::client_error(401, "bad key".to_string()))], 3).await;
        let id = h.store.add(NewTask::generate("doc.md", "Write it.")).await.unwrap();

        let report = h.worker.drain_once(5, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed, 1);
        let task = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 0);
    }

    #[tokio::test]
    async fn insights_tasks_read_the_document_and_queue_actions() {
        let h = harness(vec![], 3).await;
        let doc = h.dir.path().join("insights.md");
        std::fs::write(&doc, "# Notes\n- Monitor GOLD: break above 2050\nSome market notes\n").unwrap();
        let id = h
            .store
            .add(NewTask::new(doc.to_string_lossy(), "", TaskType::Insights))
            .await
            .unwrap();

        let task = h.store.claim(1, &ClaimFilter::any()).await.unwrap().remove(0);
        assert_eq!(h.worker.process(&task).await.unwrap(), Outcome::Completed);

        let task = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.response.unwrap().starts_with("insights:"));
        assert_eq!(h.worker.executor.queue().len(), 1);
    }

    #[tokio::test]
    async fn missing_insights_document_is_permanent() {
        let h = harness(vec![], 3).await;
        let id = h
            .store
            .add(NewTask::new("/nonexistent/report.md", "", TaskType::Insights))
            .await
            .unwrap();
        let report = h.worker.drain_once(5, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(h.store.get(id).await.unwrap().unwrap().error.unwrap().contains("Cannot read"));
    }

    #[tokio::test]
    async fn cancelled_worker_claims_nothing() {
        let h = harness(vec![Ok(sample_digest())], 3).await;
        h.store.add(NewTask::generate("doc.md", "Write it.")).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = h.worker.drain_once(5, &cancel).await.unwrap();
        assert_eq!(report, DrainReport::default());
        h.worker.run(cancel).await;
        assert_eq!(h.store.queue_length().await.unwrap(), 1);
    }
}
