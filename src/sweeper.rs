//! Retirement sweeper for stuck in-flight tasks.
//!
//! A task is stale when it has sat in `started` longer than the threshold,
//! usually because its worker died. Each stale task is either reset to
//! `pending` (attempts + 1) or failed for good, in one store transaction
//! that also writes the audit row. After the sweep the executor gets one
//! bounded drain and any pending publish retries are triggered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::executor::{DrainReport, QueueWorker};
use crate::store::{JobStore, RetireOutcome, RetireRequest, StoreError, Task};
use crate::util::{format_ts, now_string};

const ACTOR: &str = "system";

/// Something the sweeper can kick after repairing state.
#[async_trait]
pub trait DrainTarget: Send + Sync {
    async fn drain(
        &self,
        max_tasks: usize,
        cancel: &CancellationToken,
    ) -> Result<DrainReport, StoreError>;
}

#[async_trait]
impl DrainTarget for QueueWorker {
    async fn drain(
        &self,
        max_tasks: usize,
        cancel: &CancellationToken,
    ) -> Result<DrainReport, StoreError> {
        self.drain_once(max_tasks, cancel).await
    }
}

/// Retries failed downstream publishes. Implemented outside this crate.
#[async_trait]
pub trait RetryPublisher: Send + Sync {
    /// Returns how many publishes were retried.
    async fn retry_pending(&self) -> anyhow::Result<usize>;
}

/// Why a task was pulled out of `started`.
#[derive(Debug, Clone)]
pub struct StaleTaskError {
    pub task_id: i64,
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub stale_after: Duration,
}

impl std::fmt::Display for StaleTaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let since = self
            .started_at
            .map(format_ts)
            .unwrap_or_else(|| "unknown".to_string());
        write!(
            f,
            "stuck in started since {} (> {}s) after {} attempts - auto-failed by sweeper",
            since,
            self.stale_after.as_secs(),
            self.attempts
        )
    }
}

impl std::error::Error for StaleTaskError {}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub stale_after: Duration,
    pub max_attempts: u32,
    /// Report only. Implies no drain and no publish retry.
    pub dry_run: bool,
    pub skip_drain: bool,
    pub skip_retry: bool,
    pub drain_max_tasks: usize,
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(3600),
            max_attempts: 5,
            dry_run: false,
            skip_drain: false,
            skip_retry: false,
            drain_max_tasks: 100,
            interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub stale: Vec<i64>,
    pub reset: Vec<i64>,
    pub failed: Vec<i64>,
    /// Finished or reclaimed between detection and repair.
    pub skipped: Vec<i64>,
    pub errors: usize,
    pub drain: Option<DrainReport>,
    pub publishes_retried: Option<usize>,
}

pub struct RetirementSweeper {
    store: Arc<dyn JobStore>,
    config: SweeperConfig,
    drain: Option<Arc<dyn DrainTarget>>,
    publisher: Option<Arc<dyn RetryPublisher>>,
}

impl RetirementSweeper {
    pub fn new(store: Arc<dyn JobStore>, config: SweeperConfig) -> Self {
        Self {
            store,
            config,
            drain: None,
            publisher: None,
        }
    }

    pub fn with_drain(mut self, drain: Arc<dyn DrainTarget>) -> Self {
        self.drain = Some(drain);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn RetryPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let stale = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        now - stale
    }

    async fn retire(&self, task: &Task, cutoff: DateTime<Utc>) -> Result<RetireOutcome, StoreError> {
        let reason = StaleTaskError {
            task_id: task.id,
            attempts: task.attempts,
            started_at: task.started_at_utc(),
            stale_after: self.config.stale_after,
        };
        let request = RetireRequest {
            id: task.id,
            cutoff,
            max_attempts: self.config.max_attempts,
            actor: ACTOR.to_string(),
            terminal_error: format!("{} {}", now_string(), reason),
        };
        self.store.retire_stale(&request).await
    }

    /// One sweep: repair stale tasks, then drain and retry publishes.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<SweepReport, StoreError> {
        let cutoff = self.cutoff(Utc::now());
        let stale = self.store.find_stale(cutoff).await?;
        tracing::info!(
            stale = stale.len(),
            dry_run = self.config.dry_run,
            cutoff = %format_ts(cutoff),
            "Sweep started"
        );

        let mut report = SweepReport {
            stale: stale.iter().map(|t| t.id).collect(),
            ..SweepReport::default()
        };

        if self.config.dry_run {
            for task in &stale {
                let action = if task.attempts >= self.config.max_attempts {
                    "fail"
                } else {
                    "reset"
                };
                tracing::info!(
                    task_id = task.id,
                    attempts = task.attempts,
                    started_at = task.started_at.as_deref().unwrap_or(""),
                    "Would {} stale task",
                    action
                );
            }
            return Ok(report);
        }

        for task in &stale {
            match self.retire(task, cutoff).await {
                Ok(RetireOutcome::Reset { attempts }) => {
                    tracing::info!(task_id = task.id, attempts, "Stale task reset to pending");
                    report.reset.push(task.id);
                }
                Ok(RetireOutcome::Failed) => {
                    tracing::warn!(task_id = task.id, attempts = task.attempts, "Stale task failed");
                    report.failed.push(task.id);
                }
                Ok(RetireOutcome::Skipped) => {
                    tracing::debug!(task_id = task.id, "Stale task moved on before repair");
                    report.skipped.push(task.id);
                }
                Err(e) => {
                    tracing::warn!(task_id = task.id, "Failed to retire stale task: {}", e);
                    report.errors += 1;
                }
            }
        }

        if !self.config.skip_drain {
            if let Some(drain) = &self.drain {
                match drain.drain(self.config.drain_max_tasks, cancel).await {
                    Ok(r) => report.drain = Some(r),
                    Err(e) => tracing::warn!("Post-sweep drain failed: {}", e),
                }
            }
        }

        if !self.config.skip_retry {
            if let Some(publisher) = &self.publisher {
                match publisher.retry_pending().await {
                    Ok(n) => report.publishes_retried = Some(n),
                    Err(e) => tracing::warn!("Publish retry failed: {:#}", e),
                }
            }
        }

        tracing::info!(
            reset = report.reset.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            errors = report.errors,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Sweep every `interval` until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if let Err(e) = self.run_once(&cancel).await {
                tracing::warn!("Sweep failed: {}", e);
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        tracing::info!("Sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ClaimFilter, NewTask, SqliteJobStore, TaskStatus};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingDrain {
        calls: AtomicUsize,
        max_seen: AtomicUsize,
    }

    #[async_trait]
    impl DrainTarget for CountingDrain {
        async fn drain(
            &self,
            max_tasks: usize,
            _cancel: &CancellationToken,
        ) -> Result<DrainReport, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.max_seen.store(max_tasks, Ordering::SeqCst);
            Ok(DrainReport::default())
        }
    }

    #[derive(Default)]
    struct CountingPublisher {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RetryPublisher for CountingPublisher {
        async fn retry_pending(&self) -> anyhow::Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(2)
        }
    }

    /// A claimed task whose `started_at` is `hours` in the past.
    async fn stuck_task(store: &SqliteJobStore, hours: i64, attempts: u32) -> i64 {
        let id = store.add(NewTask::generate("doc", "p")).await.unwrap();
        store.claim(1, &ClaimFilter::any()).await.unwrap();
        let started = format_ts(Utc::now() - chrono::Duration::hours(hours));
        store
            .run("test_backdate", move |conn| {
                conn.execute(
                    "UPDATE llm_tasks SET started_at = ?1, attempts = ?2 WHERE id = ?3",
                    rusqlite::params![started, attempts, id],
                )?;
                Ok(())
            })
            .await
            .unwrap();
        id
    }

    async fn open() -> (TempDir, Arc<SqliteJobStore>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteJobStore::open(dir.path().join("t.db")).await.unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn stale_task_is_reset_and_fresh_task_left_alone() {
        let (_dir, store) = open().await;
        let stale = stuck_task(&store, 2, 0).await;
        let fresh = stuck_task(&store, 0, 0).await;

        let sweeper = RetirementSweeper::new(store.clone(), SweeperConfig::default());
        let report = sweeper.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.reset, vec![stale]);

        let task = store.get(stale).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempts, 1);
        assert_eq!(store.get(fresh).await.unwrap().unwrap().status, TaskStatus::Started);
    }

    #[tokio::test]
    async fn stale_task_at_max_attempts_is_failed_with_error() {
        let (_dir, store) = open().await;
        let id = stuck_task(&store, 2, 5).await;

        let sweeper = RetirementSweeper::new(store.clone(), SweeperConfig::default());
        let report = sweeper.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.failed, vec![id]);

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.unwrap().contains("auto-failed by sweeper"));
        let audit = store.list_bot_audit(5).await.unwrap();
        assert_eq!(audit[0].action, "sweeper_fail_task");
        assert_eq!(audit[0].actor, "system");
    }

    #[tokio::test]
    async fn dry_run_reports_without_mutating_or_draining() {
        let (_dir, store) = open().await;
        let id = stuck_task(&store, 2, 0).await;
        let drain = Arc::new(CountingDrain::default());

        let sweeper = RetirementSweeper::new(
            store.clone(),
            SweeperConfig {
                dry_run: true,
                ..SweeperConfig::default()
            },
        )
        .with_drain(drain.clone());
        let report = sweeper.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.stale, vec![id]);
        assert!(report.reset.is_empty());
        assert_eq!(store.get(id).await.unwrap().unwrap().status, TaskStatus::Started);
        assert_eq!(drain.calls.load(Ordering::SeqCst), 0);
        assert!(store.list_bot_audit(5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn drain_and_publish_follow_the_sweep_unless_skipped() {
        let (_dir, store) = open().await;
        let drain = Arc::new(CountingDrain::default());
        let publisher = Arc::new(CountingPublisher::default());

        let sweeper = RetirementSweeper::new(store.clone(), SweeperConfig::default())
            .with_drain(drain.clone())
            .with_publisher(publisher.clone());
        let report = sweeper.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(drain.calls.load(Ordering::SeqCst), 1);
        assert_eq!(drain.max_seen.load(Ordering::SeqCst), 100);
        assert_eq!(report.publishes_retried, Some(2));

        let sweeper = RetirementSweeper::new(
            store.clone(),
            SweeperConfig {
                skip_drain: true,
                skip_retry: true,
                ..SweeperConfig::default()
            },
        )
        .with_drain(drain.clone())
        .with_publisher(publisher.clone());
        sweeper.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(drain.calls.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reset_task_is_completed_by_the_post_sweep_drain() {
        use crate::executor::{HandlerRegistry, RetryPolicy, TaskExecutor, WorkerConfig};
        use crate::llm::testing::ScriptedProvider;
        use crate::llm::RetryConfig;
        use crate::router::{sample_digest, ProviderRouter, RouterConfig};
        use crate::sanitizer::{Sanitizer, SanitizerConfig};

        let (_dir, store) = open().await;
        let id = stuck_task(&store, 2, 0).await;

        let router = ProviderRouter::new(RouterConfig {
            primary: "primary".to_string(),
            priority: vec!["primary".to_string()],
            primary_retry: RetryConfig::single_attempt(),
            ..RouterConfig::default()
        })
        .with_provider(Arc::new(ScriptedProvider::new(
            "primary",
            vec![Ok(sample_digest())],
        )));
        let cancel = CancellationToken::new();
        let worker = QueueWorker::new(
            store.clone(),
            Arc::new(router),
            Arc::new(Sanitizer::new(SanitizerConfig::default())),
            Arc::new(TaskExecutor::new(
                HandlerRegistry::new(),
                RetryPolicy::default(),
                2,
                cancel.clone(),
            )),
            WorkerConfig::default(),
        );

        let sweeper =
            RetirementSweeper::new(store.clone(), SweeperConfig::default()).with_drain(Arc::new(worker));
        let report = sweeper.run_once(&cancel).await.unwrap();
        assert_eq!(report.reset, vec![id]);
        let drain = report.drain.unwrap();
        assert_eq!(drain.claimed, 1);
        assert_eq!(drain.completed, 1);

        let task = store.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempts, 1);
    }

    #[test]
    fn stale_error_names_the_start_time() {
        let err = StaleTaskError {
            task_id: 1,
            attempts: 5,
            started_at: None,
            stale_after: Duration::from_secs(3600),
        };
        assert_eq!(
            err.to_string(),
            "stuck in started since unknown (> 3600s) after 5 attempts - auto-failed by sweeper"
        );
    }
}
