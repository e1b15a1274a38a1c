//! Durable task queue storage.
//!
//! A [`JobStore`] is the single ownership arbiter shared by every poller
//! (queue worker, offload scheduler, retirement sweeper). The only backend
//! is SQLite, see [`SqliteJobStore`].

mod sqlite;

pub use sqlite::SqliteJobStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::util::parse_ts;

/// Task lifecycle status.
///
/// `pending -> started -> {completed, pending (requeue), failed, flagged}`;
/// `flagged -> completed` (approve) or `flagged -> pending` (re-enqueue).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Started,
    Completed,
    Failed,
    /// Terminal-pending-review: needs an operator before it counts as done.
    Flagged,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Started => "started",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Flagged => "flagged",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "started" => Some(TaskStatus::Started),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            "flagged" => Some(TaskStatus::Flagged),
            _ => None,
        }
    }

    /// Statuses a worker may record through `update_result`.
    pub fn is_outcome(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Flagged
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    #[default]
    Normal,
    Fast,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Normal => "normal",
            Priority::Fast => "fast",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "fast" => Priority::Fast,
            _ => Priority::Normal,
        }
    }
}

/// Kind of work a task asks for. Unknown kinds survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TaskType {
    Generate,
    Insights,
    Other(String),
}

impl TaskType {
    pub fn as_str(&self) -> &str {
        match self {
            TaskType::Generate => "generate",
            TaskType::Insights => "insights",
            TaskType::Other(s) => s.as_str(),
        }
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "generate" => TaskType::Generate,
            "insights" => TaskType::Insights,
            _ => TaskType::Other(s),
        }
    }
}

impl From<TaskType> for String {
    fn from(t: TaskType) -> Self {
        t.as_str().to_string()
    }
}

/// A task as produced by an external producer.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub document_path: String,
    pub prompt: String,
    pub task_type: TaskType,
    pub priority: Priority,
    pub provider_hint: Option<String>,
}

impl NewTask {
    pub fn new(
        document_path: impl Into<String>,
        prompt: impl Into<String>,
        task_type: TaskType,
    ) -> Self {
        Self {
            document_path: document_path.into(),
            prompt: prompt.into(),
            task_type,
            priority: Priority::Normal,
            provider_hint: None,
        }
    }

    pub fn generate(document_path: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self::new(document_path, prompt, TaskType::Generate)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_provider_hint(mut self, provider: impl Into<String>) -> Self {
        self.provider_hint = Some(provider.into());
        self
    }
}

/// A queued unit of LLM-generation work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    /// Caller-owned artifact reference; stable for the artifact's lifetime.
    pub document_path: String,
    pub prompt: String,
    pub task_type: TaskType,
    pub priority: Priority,
    pub status: TaskStatus,
    pub attempts: u32,
    pub created_at: String,
    pub started_at: Option<String>,
    pub last_attempt_at: Option<String>,
    pub completed_at: Option<String>,
    pub response: Option<String>,
    pub error: Option<String>,
    pub provider_hint: Option<String>,
}

impl Task {
    pub fn started_at_utc(&self) -> Option<DateTime<Utc>> {
        self.started_at.as_deref().and_then(parse_ts)
    }
}

/// Lane selection for `claim`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Lane {
    #[default]
    Any,
    /// `priority = fast` or a prompt shorter than `max_prompt_chars`.
    FastOrShort { max_prompt_chars: usize },
}

/// Eligibility predicate applied to pending rows during `claim`.
#[derive(Debug, Clone, Default)]
pub struct ClaimFilter {
    pub task_type: Option<TaskType>,
    pub lane: Lane,
}

impl ClaimFilter {
    pub fn any() -> Self {
        Self::default()
    }

    /// Short or fast `generate` tasks, the offload scheduler's subset.
    pub fn offload(max_prompt_chars: usize) -> Self {
        Self {
            task_type: Some(TaskType::Generate),
            lane: Lane::FastOrShort { max_prompt_chars },
        }
    }
}

/// One sanitizer pass over one attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizerAudit {
    pub id: i64,
    pub task_id: i64,
    pub corrections: u32,
    pub notes: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUsage {
    pub model_path: String,
    pub name: String,
    pub size_gb: f64,
    pub last_used: String,
    pub usage_count: u64,
}

impl ModelUsage {
    pub fn last_used_utc(&self) -> Option<DateTime<Utc>> {
        parse_ts(&self.last_used)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotAudit {
    pub id: i64,
    pub actor: String,
    pub action: String,
    pub details: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: u64,
    pub started: u64,
    pub completed: u64,
    pub failed: u64,
    pub flagged: u64,
}

impl StatusCounts {
    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Started => self.started,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
            TaskStatus::Flagged => self.flagged,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.started + self.completed + self.failed + self.flagged
    }
}

/// Input to the sweeper's single-transaction repair of one stale task.
#[derive(Debug, Clone)]
pub struct RetireRequest {
    pub id: i64,
    /// Only tasks started at or before this instant are touched.
    pub cutoff: DateTime<Utc>,
    pub max_attempts: u32,
    pub actor: String,
    /// Written to `error` when the task is failed.
    pub terminal_error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireOutcome {
    /// Back to pending with the new attempt count.
    Reset { attempts: u32 },
    Failed,
    /// Finished or reclaimed by someone else in the meantime.
    Skipped,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store contention: {operation} still locked after {attempts} attempts")]
    Contention {
        operation: &'static str,
        attempts: u32,
    },

    #[error("task {0} not found")]
    NotFound(i64),

    #[error("task {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task join error: {0}")]
    Join(String),
}

/// Durable queue operations.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a pending task and return its id.
    async fn add(&self, task: NewTask) -> Result<i64, StoreError>;

    /// Atomically mark up to `limit` eligible pending tasks `started` and
    /// return them. No two callers ever receive the same id.
    async fn claim(&self, limit: usize, filter: &ClaimFilter) -> Result<Vec<Task>, StoreError>;

    /// Record an attempt outcome (`completed`, `failed` or `flagged`).
    ///
    /// Returns `false` when the task already has `status` (no-op).
    async fn update_result(
        &self,
        id: i64,
        status: TaskStatus,
        response: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// `started -> pending`, attempts + 1, started_at cleared.
    async fn requeue(&self, id: i64, error: Option<&str>) -> Result<(), StoreError>;

    async fn get(&self, id: i64) -> Result<Option<Task>, StoreError>;

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError>;

    /// Number of pending tasks.
    async fn queue_length(&self) -> Result<u64, StoreError>;

    async fn record_sanitizer_audit(
        &self,
        task_id: i64,
        corrections: u32,
        notes: &str,
    ) -> Result<i64, StoreError>;

    /// Cumulative corrections across every audit row of a task.
    async fn sanitizer_total(&self, task_id: i64) -> Result<u64, StoreError>;

    async fn sanitizer_audits(&self, task_id: i64) -> Result<Vec<SanitizerAudit>, StoreError>;

    /// Corrections recorded at or after `since`, across all tasks.
    async fn recent_sanitizer_total(&self, since: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Upsert after a successful local generation.
    async fn record_model_usage(
        &self,
        model_path: &str,
        name: &str,
        size_gb: f64,
    ) -> Result<(), StoreError>;

    async fn list_model_usage(&self) -> Result<Vec<ModelUsage>, StoreError>;

    async fn record_bot_audit(
        &self,
        actor: &str,
        action: &str,
        details: &str,
    ) -> Result<i64, StoreError>;

    /// Most recent first.
    async fn list_bot_audit(&self, limit: usize) -> Result<Vec<BotAudit>, StoreError>;

    /// Started tasks whose `started_at` is at or before `cutoff`.
    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError>;

    /// Reset or fail one stale task and write its audit row in one transaction.
    async fn retire_stale(&self, request: &RetireRequest) -> Result<RetireOutcome, StoreError>;

    /// `flagged -> completed`, audited.
    async fn approve(&self, id: i64, actor: &str) -> Result<(), StoreError>;

    /// Copy a flagged or failed task into a new pending task, audited.
    async fn rerun(&self, id: i64, actor: &str) -> Result<i64, StoreError>;

    /// `flagged -> pending` on the same id, audited.
    async fn reenqueue(&self, id: i64, actor: &str) -> Result<(), StoreError>;

    /// Administrative attempts reset, audited. Not allowed while started.
    async fn reset_attempts(&self, id: i64, actor: &str) -> Result<(), StoreError>;
}
