//! Local-model offload for short and fast tasks.
//!
//! The scheduler polls the shared store for `generate` tasks that are
//! marked fast or have short prompts, runs them on a locally hosted model,
//! and records model usage for the retention sweep.

pub mod retention;
pub mod runtime;

pub use retention::{plan_retention, run_retention, RetentionConfig, RetentionPlan, RetentionReport};
pub use runtime::{LlamaServerConfig, LlamaServerRuntime, LocalRuntime, ModelHandle};

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::executor::{settle_failure, DrainReport, Outcome, TaskError};
use crate::llm::{GenerationConfig, LlmError, LlmErrorKind, LlmResponse};
use crate::sanitizer::Sanitizer;
use crate::store::{ClaimFilter, JobStore, ModelUsage, StoreError, Task, TaskStatus};

/// Name fragments of models that are usually small and quick.
const FAST_NAME_HINTS: [&str; 5] = ["mini", "tiny", "fast", "phi3", "mistral"];

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCandidate {
    pub path: PathBuf,
    pub name: String,
    pub size_gb: f64,
}

/// Every `*.gguf` file under `dir`, sorted by path. Hidden directories
/// (including the default retention holding area) are skipped.
pub fn discover_models(dir: &Path) -> Vec<ModelCandidate> {
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    let mut models: Vec<ModelCandidate> = walker
        .filter_map(|entry| entry.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("gguf"))
        })
        .filter_map(|e| {
            let size = e.metadata().ok()?.len();
            Some(ModelCandidate {
                name: e.path().file_stem()?.to_string_lossy().to_string(),
                path: e.into_path(),
                size_gb: size as f64 / BYTES_PER_GB,
            })
        })
        .collect();
    models.sort_by(|a, b| a.path.cmp(&b.path));
    models
}

/// Case-insensitive substring match of any keep-list entry on name or path.
pub fn matches_keep_list(model: &ModelCandidate, keep_list: &[String]) -> bool {
    keep_list.iter().any(|keep| keep_matches(model, keep))
}

fn keep_matches(model: &ModelCandidate, keep: &str) -> bool {
    let keep = keep.to_lowercase();
    !keep.is_empty()
        && (model.name.to_lowercase().contains(&keep)
            || model.path.to_string_lossy().to_lowercase().contains(&keep))
}

/// Pick the model to run, ignoring anything in `exclude`.
///
/// Precedence: keep-list match (in keep-list order), most recently used,
/// fast name hint, smallest file.
pub fn choose_fast_model<'a>(
    candidates: &'a [ModelCandidate],
    keep_list: &[String],
    usage: &[ModelUsage],
    exclude: &[PathBuf],
) -> Option<&'a ModelCandidate> {
    let pool: Vec<&ModelCandidate> = candidates
        .iter()
        .filter(|c| !exclude.contains(&c.path))
        .collect();

    for keep in keep_list {
        if let Some(m) = pool.iter().copied().find(|m| keep_matches(m, keep)) {
            return Some(m);
        }
    }

    let mut recent: Vec<&ModelUsage> = usage.iter().collect();
    recent.sort_by(|a, b| b.last_used.cmp(&a.last_used));
    for u in recent {
        if let Some(m) = pool.iter().copied().find(|m| m.path.to_string_lossy() == u.model_path) {
            return Some(m);
        }
    }

    for hint in FAST_NAME_HINTS {
        if let Some(m) = pool.iter().copied().find(|m| m.name.to_lowercase().contains(hint)) {
            return Some(m);
        }
    }

    pool.into_iter()
        .min_by(|a, b| a.size_gb.total_cmp(&b.size_gb))
}

#[derive(Debug, Clone)]
pub struct OffloadConfig {
    pub models_dir: PathBuf,
    pub keep_list: Vec<String>,
    pub max_tasks: usize,
    pub max_attempts: u32,
    /// Prompts shorter than this are eligible regardless of priority.
    pub short_prompt_chars: usize,
    pub poll_interval: Duration,
    pub generation: GenerationConfig,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            keep_list: Vec::new(),
            max_tasks: 5,
            max_attempts: 3,
            short_prompt_chars: 2000,
            poll_interval: Duration::from_secs(30),
            generation: GenerationConfig {
                max_tokens: 1024,
                ..GenerationConfig::default()
            },
        }
    }
}

pub struct OffloadScheduler {
    store: Arc<dyn JobStore>,
    handle: ModelHandle,
    sanitizer: Arc<Sanitizer>,
    config: OffloadConfig,
}

impl OffloadScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        runtime: Box<dyn LocalRuntime>,
        sanitizer: Arc<Sanitizer>,
        config: OffloadConfig,
    ) -> Self {
        Self {
            store,
            handle: ModelHandle::new(runtime),
            sanitizer,
            config,
        }
    }

    pub fn handle(&self) -> &ModelHandle {
        &self.handle
    }

    /// Generate on the preferred model; on failure unload, switch to the
    /// next candidate and try once more.
    ///
    /// Models that fail are added to `failed` and skipped for the rest of
    /// the cycle.
    async fn generate_with_failover(
        &self,
        prompt: &str,
        candidates: &[ModelCandidate],
        usage: &[ModelUsage],
        failed: &mut Vec<PathBuf>,
    ) -> Result<(ModelCandidate, LlmResponse), LlmError> {
        let keep = &self.config.keep_list;
        let model = choose_fast_model(candidates, keep, usage, failed).ok_or_else(|| {
            LlmError::unavailable(format!(
                "No working local model left in {}",
                self.config.models_dir.display()
            ))
        })?;

        let first = match self.handle.generate(model, prompt, &self.config.generation).await {
            Ok(response) => return Ok((model.clone(), response)),
            Err(e) => e,
        };
        tracing::warn!(model = %model.name, "Local inference failed, switching model: {}", first);
        failed.push(model.path.clone());
        self.handle.unload().await;

        let Some(alternate) = choose_fast_model(candidates, keep, usage, failed) else {
            return Err(first);
        };
        match self
            .handle
            .generate(alternate, prompt, &self.config.generation)
            .await
        {
            Ok(response) => Ok((alternate.clone(), response)),
            Err(e) => {
                failed.push(alternate.path.clone());
                self.handle.unload().await;
                Err(e)
            }
        }
    }

    async fn process(
        &self,
        task: &Task,
        candidates: &[ModelCandidate],
        usage: &[ModelUsage],
        failed: &mut Vec<PathBuf>,
    ) -> Result<Outcome, StoreError> {
        let (model, response) = match self
            .generate_with_failover(&task.prompt, candidates, usage, failed)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                // A model that cannot be loaded says nothing about the task.
                let error = if e.kind == LlmErrorKind::Unavailable {
                    TaskError::transient(e.to_string())
                } else {
                    TaskError::from(e)
                };
                return settle_failure(self.store.as_ref(), task, &error, self.config.max_attempts)
                    .await;
            }
        };

        tracing::info!(
            task_id = task.id,
            model = %model.name,
            chars = response.text.len(),
            elapsed_ms = response.generation_time.as_millis() as u64,
            "Local generation finished"
        );
        self.store
            .record_model_usage(&model.path.to_string_lossy(), &model.name, model.size_gb)
            .await?;

        let validation = self
            .sanitizer
            .validate(self.store.as_ref(), task.id, &task.prompt, &response.text)
            .await?;
        self.store
            .update_result(
                task.id,
                validation.status,
                Some(&validation.outcome.text),
                None,
            )
            .await?;
        Ok(if validation.status == TaskStatus::Flagged {
            Outcome::Flagged
        } else {
            Outcome::Completed
        })
    }

    /// One cycle: claim eligible tasks and run them one at a time on the
    /// shared handle. Nothing is claimed while no local model exists.
    pub async fn poll_once(&self, cancel: &CancellationToken) -> Result<DrainReport, StoreError> {
        let mut report = DrainReport::default();
        if cancel.is_cancelled() {
            return Ok(report);
        }

        let candidates = discover_models(&self.config.models_dir);
        if candidates.is_empty() {
            tracing::debug!(
                models_dir = %self.config.models_dir.display(),
                "No local models, leaving tasks for the main worker"
            );
            return Ok(report);
        }

        let filter = ClaimFilter::offload(self.config.short_prompt_chars);
        let tasks = self.store.claim(self.config.max_tasks, &filter).await?;
        report.claimed = tasks.len();
        if tasks.is_empty() {
            tracing::debug!("No eligible offload tasks");
            return Ok(report);
        }

        let usage = self.store.list_model_usage().await?;
        let mut failed = Vec::new();

        for task in &tasks {
            match self.process(task, &candidates, &usage, &mut failed).await {
                Ok(outcome) => report.tally(outcome),
                Err(e) => {
                    tracing::warn!(task_id = task.id, "Offload task not recorded: {}", e);
                    report.errors += 1;
                }
            }
        }
        Ok(report)
    }

    /// Poll until cancelled, then unload the model.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            models_dir = %self.config.models_dir.display(),
            poll_s = self.config.poll_interval.as_secs(),
            "Offload scheduler started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }
            match self.poll_once(&cancel).await {
                Ok(report) if report.claimed > 0 => tracing::info!(
                    completed = report.completed,
                    flagged = report.flagged,
                    requeued = report.requeued,
                    failed = report.failed,
                    "Offload cycle finished"
                ),
                Ok(_) => {}
                Err(e) => tracing::warn!("Offload cycle failed: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        self.handle.unload().await;
        tracing::info!("Offload scheduler stopped");
    }
}
