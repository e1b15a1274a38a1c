//! SQLite-backed job store.
//!
//! Several processes may open the same database file. Claims run inside a
//! `BEGIN IMMEDIATE` transaction, so the database write lock is the
//! arbiter between pollers; the in-process mutex only serializes callers
//! sharing one connection.

use super::{
    BotAudit, ClaimFilter, JobStore, Lane, ModelUsage, NewTask, Priority, RetireOutcome,
    RetireRequest, SanitizerAudit, StatusCounts, StoreError, Task, TaskStatus, TaskType,
};
use crate::util::{format_ts, now_string};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS llm_tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    document_path TEXT NOT NULL,
    prompt TEXT NOT NULL,
    task_type TEXT NOT NULL DEFAULT 'generate',
    priority TEXT NOT NULL DEFAULT 'normal',
    status TEXT NOT NULL DEFAULT 'pending',
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    started_at TEXT,
    last_attempt_at TEXT,
    completed_at TEXT,
    response TEXT,
    error TEXT,
    provider_hint TEXT
);

CREATE INDEX IF NOT EXISTS idx_llm_tasks_status ON llm_tasks(status, id);
CREATE INDEX IF NOT EXISTS idx_llm_tasks_started ON llm_tasks(status, started_at);

CREATE TABLE IF NOT EXISTS llm_sanitizer_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_id INTEGER NOT NULL,
    corrections INTEGER NOT NULL,
    notes TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    FOREIGN KEY (task_id) REFERENCES llm_tasks(id)
);

CREATE INDEX IF NOT EXISTS idx_sanitizer_task ON llm_sanitizer_audit(task_id);
CREATE INDEX IF NOT EXISTS idx_sanitizer_created ON llm_sanitizer_audit(created_at);

CREATE TRIGGER IF NOT EXISTS llm_sanitizer_audit_no_update
BEFORE UPDATE ON llm_sanitizer_audit
BEGIN
    SELECT RAISE(ABORT, 'llm_sanitizer_audit is append-only');
END;

CREATE TRIGGER IF NOT EXISTS llm_sanitizer_audit_no_delete
BEFORE DELETE ON llm_sanitizer_audit
BEGIN
    SELECT RAISE(ABORT, 'llm_sanitizer_audit is append-only');
END;

CREATE TABLE IF NOT EXISTS model_usage (
    model_path TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    size_gb REAL NOT NULL DEFAULT 0,
    last_used TEXT NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS bot_audit (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    actor TEXT NOT NULL,
    action TEXT NOT NULL,
    details TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS bot_audit_no_update
BEFORE UPDATE ON bot_audit
BEGIN
    SELECT RAISE(ABORT, 'bot_audit is append-only');
END;
"#;

const TASK_COLUMNS: &str = "id, document_path, prompt, task_type, priority, status, attempts, \
     created_at, started_at, last_attempt_at, completed_at, response, error, provider_hint";

/// Attempts made against a busy database before giving up.
const BUSY_ATTEMPTS: u32 = 3;
const BUSY_DELAY: Duration = Duration::from_millis(500);
/// SQLite-level wait applied to every statement before it reports busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl SqliteJobStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let db_path = path.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)?;
            conn.busy_timeout(BUSY_TIMEOUT)?;
            with_busy_retry("open", || {
                conn.execute_batch(SCHEMA)?;
                Self::run_migrations(&conn)
            })?;
            Ok::<_, StoreError>(conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))??;

        tracing::debug!(path = %path.display(), "Opened job store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add columns that older databases were created without.
    fn run_migrations(conn: &Connection) -> Result<(), StoreError> {
        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info('llm_tasks')")?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<_, _>>()?;

        for (column, ddl) in [
            (
                "last_attempt_at",
                "ALTER TABLE llm_tasks ADD COLUMN last_attempt_at TEXT",
            ),
            (
                "provider_hint",
                "ALTER TABLE llm_tasks ADD COLUMN provider_hint TEXT",
            ),
            (
                "priority",
                "ALTER TABLE llm_tasks ADD COLUMN priority TEXT NOT NULL DEFAULT 'normal'",
            ),
        ] {
            if !columns.iter().any(|c| c == column) {
                tracing::info!(column, "Migrating llm_tasks");
                conn.execute(ddl, [])?;
            }
        }
        Ok(())
    }

    /// Run `op` on the blocking pool with the connection locked, retrying
    /// on a busy database.
    pub(crate) async fn run<T, F>(&self, operation: &'static str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: Fn(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            with_busy_retry(operation, || op(&mut *conn))
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn is_busy(err: &StoreError) -> bool {
    match err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _)) => {
            matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        }
        _ => false,
    }
}

fn with_busy_retry<T>(
    operation: &'static str,
    mut op: impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    with_busy_retry_delay(operation, BUSY_DELAY, &mut op)
}

fn with_busy_retry_delay<T>(
    operation: &'static str,
    delay: Duration,
    op: &mut impl FnMut() -> Result<T, StoreError>,
) -> Result<T, StoreError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op() {
            Err(err) if is_busy(&err) => {
                if attempt >= BUSY_ATTEMPTS {
                    tracing::warn!(operation, attempt, "Database still busy, giving up");
                    return Err(StoreError::Contention {
                        operation,
                        attempts: attempt,
                    });
                }
                tracing::debug!(operation, attempt, "Database busy, retrying");
                std::thread::sleep(delay);
            }
            other => return other,
        }
    }
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let task_type: String = row.get(3)?;
    let priority: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(Task {
        id: row.get(0)?,
        document_path: row.get(1)?,
        prompt: row.get(2)?,
        task_type: TaskType::from(task_type),
        priority: Priority::parse(&priority),
        status: TaskStatus::parse(&status).unwrap_or(TaskStatus::Pending),
        attempts: row.get(6)?,
        created_at: row.get(7)?,
        started_at: row.get(8)?,
        last_attempt_at: row.get(9)?,
        completed_at: row.get(10)?,
        response: row.get(11)?,
        error: row.get(12)?,
        provider_hint: row.get(13)?,
    })
}

fn load_task(conn: &Connection, id: i64) -> Result<Option<Task>, StoreError> {
    let sql = format!("SELECT {} FROM llm_tasks WHERE id = ?1", TASK_COLUMNS);
    Ok(conn.query_row(&sql, params![id], row_to_task).optional()?)
}

fn current_status(conn: &Connection, id: i64) -> Result<TaskStatus, StoreError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM llm_tasks WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    status
        .as_deref()
        .and_then(TaskStatus::parse)
        .ok_or(StoreError::NotFound(id))
}

fn insert_bot_audit(
    conn: &Connection,
    actor: &str,
    action: &str,
    details: &str,
) -> Result<i64, StoreError> {
    conn.execute(
        "INSERT INTO bot_audit (actor, action, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![actor, action, details, now_string()],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Extra WHERE terms (and their bound values) for a claim filter.
fn claim_conditions(filter: &ClaimFilter) -> (String, Vec<Value>) {
    let mut sql = String::new();
    let mut values = Vec::new();
    if let Some(task_type) = &filter.task_type {
        sql.push_str(" AND task_type = ?");
        values.push(Value::Text(task_type.as_str().to_string()));
    }
    if let Lane::FastOrShort { max_prompt_chars } = filter.lane {
        sql.push_str(" AND (priority = 'fast' OR length(prompt) < ?)");
        values.push(Value::Integer(max_prompt_chars as i64));
    }
    (sql, values)
}

fn count(conn: &Connection, sql: &str, values: &[Value]) -> Result<u64, StoreError> {
    let n: i64 = conn.query_row(sql, params_from_iter(values.iter()), |row| row.get(0))?;
    Ok(n.max(0) as u64)
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn add(&self, task: NewTask) -> Result<i64, StoreError> {
        self.run("add", move |conn| {
            conn.execute(
                "INSERT INTO llm_tasks (document_path, prompt, task_type, priority, status, \
                 attempts, created_at, provider_hint) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6)",
                params![
                    task.document_path,
                    task.prompt,
                    task.task_type.as_str(),
                    task.priority.as_str(),
                    now_string(),
                    task.provider_hint,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn claim(&self, limit: usize, filter: &ClaimFilter) -> Result<Vec<Task>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let (conditions, mut values) = claim_conditions(filter);
        values.push(Value::Integer(limit as i64));
        let select = format!(
            "SELECT id FROM llm_tasks WHERE status = 'pending'{} ORDER BY id LIMIT ?",
            conditions
        );

        self.run("claim", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let ids: Vec<i64> = {
                let mut stmt = tx.prepare(&select)?;
                let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get(0))?;
                rows.collect::<Result<_, _>>()?
            };

            let now = now_string();
            let mut tasks = Vec::with_capacity(ids.len());
            for id in ids {
                let changed = tx.execute(
                    "UPDATE llm_tasks SET status = 'started', started_at = ?1, last_attempt_at = ?1 \
                     WHERE id = ?2 AND status = 'pending'",
                    params![now, id],
                )?;
                if changed == 1 {
                    if let Some(task) = load_task(&tx, id)? {
                        tasks.push(task);
                    }
                }
            }
            tx.commit()?;
            Ok(tasks)
        })
        .await
    }

    async fn update_result(
        &self,
        id: i64,
        status: TaskStatus,
        response: Option<&str>,
        error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let response = response.map(str::to_string);
        let error = error.map(str::to_string);
        self.run("update_result", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let from = current_status(&tx, id)?;
            if from == status {
                return Ok(false);
            }
            if !status.is_outcome() || from != TaskStatus::Started {
                return Err(StoreError::InvalidTransition {
                    id,
                    from,
                    to: status,
                });
            }
            tx.execute(
                "UPDATE llm_tasks SET status = ?1, response = COALESCE(?2, response), \
                 error = ?3, completed_at = ?4 WHERE id = ?5",
                params![status.as_str(), response, error, now_string(), id],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn requeue(&self, id: i64, error: Option<&str>) -> Result<(), StoreError> {
        let error = error.map(str::to_string);
        self.run("requeue", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let from = current_status(&tx, id)?;
            if from != TaskStatus::Started {
                return Err(StoreError::InvalidTransition {
                    id,
                    from,
                    to: TaskStatus::Pending,
                });
            }
            tx.execute(
                "UPDATE llm_tasks SET status = 'pending', attempts = attempts + 1, \
                 started_at = NULL, error = COALESCE(?1, error) WHERE id = ?2",
                params![error, id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<Task>, StoreError> {
        self.run("get", move |conn| load_task(conn, id)).await
    }

    async fn counts_by_status(&self) -> Result<StatusCounts, StoreError> {
        self.run("counts_by_status", |conn| {
            let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM llm_tasks GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            let mut counts = StatusCounts::default();
            for row in rows {
                let (status, n) = row?;
                let n = n.max(0) as u64;
                match TaskStatus::parse(&status) {
                    Some(TaskStatus::Pending) => counts.pending += n,
                    Some(TaskStatus::Started) => counts.started += n,
                    Some(TaskStatus::Completed) => counts.completed += n,
                    Some(TaskStatus::Failed) => counts.failed += n,
                    Some(TaskStatus::Flagged) => counts.flagged += n,
                    None => tracing::warn!(status = %status, "Unknown task status in store"),
                }
            }
            Ok(counts)
        })
        .await
    }

    async fn queue_length(&self) -> Result<u64, StoreError> {
        self.run("queue_length", |conn| {
            count(
                conn,
                "SELECT COUNT(*) FROM llm_tasks WHERE status = 'pending'",
                &[],
            )
        })
        .await
    }

    async fn record_sanitizer_audit(
        &self,
        task_id: i64,
        corrections: u32,
        notes: &str,
    ) -> Result<i64, StoreError> {
        let notes = notes.to_string();
        self.run("record_sanitizer_audit", move |conn| {
            conn.execute(
                "INSERT INTO llm_sanitizer_audit (task_id, corrections, notes, created_at) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![task_id, corrections, notes, now_string()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn sanitizer_total(&self, task_id: i64) -> Result<u64, StoreError> {
        self.run("sanitizer_total", move |conn| {
            count(
                conn,
                "SELECT COALESCE(SUM(corrections), 0) FROM llm_sanitizer_audit WHERE task_id = ?",
                &[Value::Integer(task_id)],
            )
        })
        .await
    }

    async fn sanitizer_audits(&self, task_id: i64) -> Result<Vec<SanitizerAudit>, StoreError> {
        self.run("sanitizer_audits", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, corrections, notes, created_at FROM llm_sanitizer_audit \
                 WHERE task_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![task_id], |row| {
                Ok(SanitizerAudit {
                    id: row.get(0)?,
                    task_id: row.get(1)?,
                    corrections: row.get(2)?,
                    notes: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
        .await
    }

    async fn recent_sanitizer_total(&self, since: DateTime<Utc>) -> Result<u64, StoreError> {
        let since = format_ts(since);
        self.run("recent_sanitizer_total", move |conn| {
            count(
                conn,
                "SELECT COALESCE(SUM(corrections), 0) FROM llm_sanitizer_audit WHERE created_at >= ?",
                &[Value::Text(since.clone())],
            )
        })
        .await
    }

    async fn record_model_usage(
        &self,
        model_path: &str,
        name: &str,
        size_gb: f64,
    ) -> Result<(), StoreError> {
        let model_path = model_path.to_string();
        let name = name.to_string();
        self.run("record_model_usage", move |conn| {
            conn.execute(
                "INSERT INTO model_usage (model_path, name, size_gb, last_used, usage_count) \
                 VALUES (?1, ?2, ?3, ?4, 1) \
                 ON CONFLICT(model_path) DO UPDATE SET name = excluded.name, \
                 size_gb = excluded.size_gb, last_used = excluded.last_used, \
                 usage_count = usage_count + 1",
                params![model_path, name, size_gb, now_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_model_usage(&self) -> Result<Vec<ModelUsage>, StoreError> {
        self.run("list_model_usage", |conn| {
            let mut stmt = conn.prepare(
                "SELECT model_path, name, size_gb, last_used, usage_count FROM model_usage \
                 ORDER BY last_used DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ModelUsage {
                    model_path: row.get(0)?,
                    name: row.get(1)?,
                    size_gb: row.get(2)?,
                    last_used: row.get(3)?,
                    usage_count: row.get::<_, i64>(4)?.max(0) as u64,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
        .await
    }

    async fn record_bot_audit(
        &self,
        actor: &str,
        action: &str,
        details: &str,
    ) -> Result<i64, StoreError> {
        let (actor, action, details) = (actor.to_string(), action.to_string(), details.to_string());
        self.run("record_bot_audit", move |conn| {
            insert_bot_audit(conn, &actor, &action, &details)
        })
        .await
    }

    async fn list_bot_audit(&self, limit: usize) -> Result<Vec<BotAudit>, StoreError> {
        self.run("list_bot_audit", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, actor, action, details, created_at FROM bot_audit \
                 ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |row| {
                Ok(BotAudit {
                    id: row.get(0)?,
                    actor: row.get(1)?,
                    action: row.get(2)?,
                    details: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
        .await
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>, StoreError> {
        let cutoff = format_ts(cutoff);
        let sql = format!(
            "SELECT {} FROM llm_tasks WHERE status = 'started' AND started_at IS NOT NULL \
             AND started_at <= ?1 ORDER BY started_at",
            TASK_COLUMNS
        );
        self.run("find_stale", move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![cutoff], row_to_task)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
        .await
    }

    async fn retire_stale(&self, request: &RetireRequest) -> Result<RetireOutcome, StoreError> {
        let request = request.clone();
        self.run("retire_stale", move |conn| {
            let cutoff = format_ts(request.cutoff);
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let row: Option<(String, u32, Option<String>)> = tx
                .query_row(
                    "SELECT status, attempts, started_at FROM llm_tasks WHERE id = ?1",
                    params![request.id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((status, attempts, started_at)) = row else {
                return Err(StoreError::NotFound(request.id));
            };
            let still_stale = status == TaskStatus::Started.as_str()
                && started_at.as_deref().is_some_and(|s| s <= cutoff.as_str());
            if !still_stale {
                return Ok(RetireOutcome::Skipped);
            }

            let now = now_string();
            let outcome = if attempts >= request.max_attempts {
                tx.execute(
                    "UPDATE llm_tasks SET status = 'failed', error = ?1, completed_at = ?2 \
                     WHERE id = ?3",
                    params![request.terminal_error, now, request.id],
                )?;
                insert_bot_audit(
                    &tx,
                    &request.actor,
                    "sweeper_fail_task",
                    &format!("task={} attempts={}", request.id, attempts),
                )?;
                RetireOutcome::Failed
            } else {
                tx.execute(
                    "UPDATE llm_tasks SET status = 'pending', attempts = attempts + 1, \
                     started_at = NULL, last_attempt_at = ?1 WHERE id = ?2",
                    params![now, request.id],
                )?;
                insert_bot_audit(
                    &tx,
                    &request.actor,
                    "sweeper_reset_task",
                    &format!("task={} attempts={}", request.id, attempts + 1),
                )?;
                RetireOutcome::Reset {
                    attempts: attempts + 1,
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn approve(&self, id: i64, actor: &str) -> Result<(), StoreError> {
        let actor = actor.to_string();
        self.run("approve", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let from = current_status(&tx, id)?;
            if from != TaskStatus::Flagged {
                return Err(StoreError::InvalidTransition {
                    id,
                    from,
                    to: TaskStatus::Completed,
                });
            }
            tx.execute(
                "UPDATE llm_tasks SET status = 'completed', completed_at = ?1 WHERE id = ?2",
                params![now_string(), id],
            )?;
            insert_bot_audit(&tx, &actor, "approve", &format!("task={}", id))?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn rerun(&self, id: i64, actor: &str) -> Result<i64, StoreError> {
        let actor = actor.to_string();
        self.run("rerun", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let task = load_task(&tx, id)?.ok_or(StoreError::NotFound(id))?;
            if !matches!(task.status, TaskStatus::Flagged | TaskStatus::Failed) {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: task.status,
                    to: TaskStatus::Pending,
                });
            }
            tx.execute(
                "INSERT INTO llm_tasks (document_path, prompt, task_type, priority, status, \
                 attempts, created_at, provider_hint) VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, ?6)",
                params![
                    task.document_path,
                    task.prompt,
                    task.task_type.as_str(),
                    task.priority.as_str(),
                    now_string(),
                    task.provider_hint,
                ],
            )?;
            let new_id = tx.last_insert_rowid();
            insert_bot_audit(
                &tx,
                &actor,
                "rerun",
                &format!("task={} new_task={}", id, new_id),
            )?;
            tx.commit()?;
            Ok(new_id)
        })
        .await
    }

    async fn reenqueue(&self, id: i64, actor: &str) -> Result<(), StoreError> {
        let actor = actor.to_string();
        self.run("reenqueue", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let from = current_status(&tx, id)?;
            if from != TaskStatus::Flagged {
                return Err(StoreError::InvalidTransition {
                    id,
                    from,
                    to: TaskStatus::Pending,
                });
            }
            tx.execute(
                "UPDATE llm_tasks SET status = 'pending', started_at = NULL, completed_at = NULL \
                 WHERE id = ?1",
                params![id],
            )?;
            insert_bot_audit(&tx, &actor, "reenqueue", &format!("task={}", id))?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn reset_attempts(&self, id: i64, actor: &str) -> Result<(), StoreError> {
        let actor = actor.to_string();
        self.run("reset_attempts", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let task = load_task(&tx, id)?.ok_or(StoreError::NotFound(id))?;
            if task.status == TaskStatus::Started {
                return Err(StoreError::InvalidTransition {
                    id,
                    from: task.status,
                    to: task.status,
                });
            }
            tx.execute(
                "UPDATE llm_tasks SET attempts = 0 WHERE id = ?1",
                params![id],
            )?;
            insert_bot_audit(
                &tx,
                &actor,
                "reset_attempts",
                &format!("task={} previous_attempts={}", id, task.attempts),
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }
}
