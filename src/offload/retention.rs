//! Retention sweep for local model files.
//!
//! Models unused for longer than the prune window are moved to a holding
//! directory, never deleted. Eviction from the holding area is left to the
//! operator.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

use super::{discover_models, matches_keep_list, ModelCandidate};
use crate::store::{JobStore, ModelUsage, StoreError};

const ACTOR: &str = "retention";

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub prune_days: u32,
    /// Most recently used models kept regardless of age.
    pub min_keep: usize,
    pub keep_list: Vec<String>,
    pub holding_dir: PathBuf,
}

impl RetentionConfig {
    pub fn for_models_dir(models_dir: &Path) -> Self {
        Self {
            prune_days: 30,
            min_keep: 1,
            keep_list: Vec::new(),
            holding_dir: models_dir.join(".retired"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetentionEntry {
    pub model: ModelCandidate,
    pub last_used: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionPlan {
    pub relocate: Vec<RetentionEntry>,
    pub keep: Vec<RetentionEntry>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetentionReport {
    pub dry_run: bool,
    pub planned: Vec<PathBuf>,
    /// `(from, to)` for every completed move.
    pub relocated: Vec<(PathBuf, PathBuf)>,
    pub errors: usize,
}

/// Split `candidates` into models to keep and models to relocate.
///
/// Never-used models count as unused. Keep-list matches and the `min_keep`
/// most recently used models are always kept.
pub fn plan_retention(
    candidates: &[ModelCandidate],
    usage: &[ModelUsage],
    config: &RetentionConfig,
    now: DateTime<Utc>,
) -> RetentionPlan {
    let cutoff = now - chrono::Duration::days(i64::from(config.prune_days));

    let mut entries: Vec<RetentionEntry> = candidates
        .iter()
        .map(|model| {
            let path = model.path.to_string_lossy();
            RetentionEntry {
                last_used: usage
                    .iter()
                    .find(|u| u.model_path == path)
                    .and_then(ModelUsage::last_used_utc),
                model: model.clone(),
            }
        })
        .collect();
    // Newest first; never used sorts last.
    entries.sort_by(|a, b| b.last_used.cmp(&a.last_used));

    let mut plan = RetentionPlan::default();
    for (rank, entry) in entries.into_iter().enumerate() {
        let stale = entry.last_used.map_or(true, |ts| ts < cutoff);
        let protected = rank < config.min_keep || matches_keep_list(&entry.model, &config.keep_list);
        if stale && !protected {
            plan.relocate.push(entry);
        } else {
            plan.keep.push(entry);
        }
    }
    plan
}

/// Move `path` into `holding_dir`, falling back to copy and remove when a
/// rename crosses filesystems. Existing names get a timestamp suffix.
async fn relocate(path: &Path, holding_dir: &Path) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(holding_dir).await?;
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"))?;
    let mut dest = holding_dir.join(file_name);
    if tokio::fs::try_exists(&dest).await? {
        dest = holding_dir.join(format!(
            "{}.{}",
            file_name.to_string_lossy(),
            Utc::now().timestamp()
        ));
    }

    if tokio::fs::rename(path, &dest).await.is_err() {
        tokio::fs::copy(path, &dest).await?;
        tokio::fs::remove_file(path).await?;
    }
    Ok(dest)
}

/// Plan and, when `confirm` is set, carry out the retention sweep.
pub async fn run_retention(
    store: &dyn JobStore,
    models_dir: &Path,
    config: &RetentionConfig,
    confirm: bool,
) -> Result<RetentionReport, StoreError> {
    let candidates: Vec<ModelCandidate> = discover_models(models_dir)
        .into_iter()
        .filter(|m| !m.path.starts_with(&config.holding_dir))
        .collect();
    let usage = store.list_model_usage().await?;
    let plan = plan_retention(&candidates, &usage, config, Utc::now());

    let mut report = RetentionReport {
        dry_run: !confirm,
        planned: plan.relocate.iter().map(|e| e.model.path.clone()).collect(),
        ..RetentionReport::default()
    };

    if !confirm {
        for entry in &plan.relocate {
            tracing::info!(
                model = %entry.model.name,
                path = %entry.model.path.display(),
                size_gb = entry.model.size_gb,
                "Would relocate unused model"
            );
        }
        return Ok(report);
    }

    for entry in &plan.relocate {
        let from = &entry.model.path;
        match relocate(from, &config.holding_dir).await {
            Ok(to) => {
                tracing::info!(from = %from.display(), to = %to.display(), "Relocated unused model");
                store
                    .record_bot_audit(
                        ACTOR,
                        "retention_relocate",
                        &format!("{} -> {}", from.display(), to.display()),
                    )
                    .await?;
                report.relocated.push((from.clone(), to));
            }
            Err(e) => {
                tracing::warn!(path = %from.display(), "Failed to relocate model: {}", e);
                report.errors += 1;
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteJobStore;
    use crate::util::format_ts;
    use tempfile::TempDir;

    fn candidate(name: &str) -> ModelCandidate {
        ModelCandidate {
            path: PathBuf::from(format!("/models/{}.gguf", name)),
            name: name.to_string(),
            size_gb: 1.0,
        }
    }

    fn used(name: &str, days_ago: i64, now: DateTime<Utc>) -> ModelUsage {
        ModelUsage {
            model_path: format!("/models/{}.gguf", name),
            name: name.to_string(),
            size_gb: 1.0,
            last_used: format_ts(now - chrono::Duration::days(days_ago)),
            usage_count: 3,
        }
    }

    fn config() -> RetentionConfig {
        RetentionConfig::for_models_dir(Path::new("/models"))
    }

    #[test]
    fn stale_and_never_used_models_are_planned() {
        let now = Utc::now();
        let models = vec![candidate("fresh"), candidate("old"), candidate("never")];
        let usage = vec![used("fresh", 1, now), used("old", 90, now)];

        let plan = plan_retention(&models, &usage, &config(), now);
        let names: Vec<_> = plan.relocate.iter().map(|e| e.model.name.as_str()).collect();
        assert_eq!(names, vec!["old", "never"]);
        assert_eq!(plan.keep[0].model.name, "fresh");
    }

    #[test]
    fn min_keep_protects_the_most_recent_even_when_stale() {
        let now = Utc::now();
        let models = vec![candidate("a"), candidate("b")];
        let usage = vec![used("a", 60, now), used("b", 90, now)];

        let plan = plan_retention(&models, &usage, &config(), now);
        assert_eq!(plan.keep.len(), 1);
        assert_eq!(plan.keep[0].model.name, "a");
        assert_eq!(plan.relocate[0].model.name, "b");
    }

    #[test]
    fn keep_list_is_never_relocated() {
        let now = Utc::now();
        let models = vec![candidate("fresh"), candidate("Phi3-Mini")];
        let usage = vec![used("fresh", 1, now)];
        let config = RetentionConfig {
            keep_list: vec!["mini".to_string()],
            ..config()
        };
        assert!(plan_retention(&models, &usage, &config, now).relocate.is_empty());
    }

    #[tokio::test]
    async fn dry_run_moves_nothing_and_confirm_relocates_with_audit() {
        let dir = TempDir::new().unwrap();
        let models_dir = dir.path().join("models");
        std::fs::create_dir_all(&models_dir).unwrap();
        std::fs::write(models_dir.join("keep.gguf"), b"k").unwrap();
        std::fs::write(models_dir.join("unused.gguf"), b"u").unwrap();
        let store = SqliteJobStore::open(dir.path().join("t.db")).await.unwrap();
        store
            .record_model_usage(&models_dir.join("keep.gguf").to_string_lossy(), "keep", 0.1)
            .await
            .unwrap();
        let config = RetentionConfig::for_models_dir(&models_dir);

        let report = run_retention(&store, &models_dir, &config, false).await.unwrap();
        assert!(report.dry_run);
        assert_eq!(report.planned, vec![models_dir.join("unused.gguf")]);
        assert!(models_dir.join("unused.gguf").exists());

        let report = run_retention(&store, &models_dir, &config, true).await.unwrap();
        assert_eq!(report.relocated.len(), 1);
        assert!(!models_dir.join("unused.gguf").exists());
        assert!(config.holding_dir.join("unused.gguf").exists());
        assert!(models_dir.join("keep.gguf").exists());

        let audit = store.list_bot_audit(10).await.unwrap();
        assert_eq!(audit[0].action, "retention_relocate");
        assert_eq!(audit[0].actor, "retention");

        // Relocated files are out of the candidate set.
        let again = run_retention(&store, &models_dir, &config, true).await.unwrap();
        assert!(again.planned.is_empty());
    }
}
