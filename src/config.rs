//! Configuration management for the task queue.
//!
//! Configuration is read from environment variables:
//! - `TASKQ_DB_PATH` - Optional. SQLite file. Defaults to `data/llm_tasks.db`.
//! - `TASKQ_POLL_INTERVAL_S`, `TASKQ_MAX_TASKS`, `TASKQ_CONCURRENCY` - Worker loop.
//! - `LLM_MAX_ATTEMPTS` - Optional. Attempts before a task fails. Defaults to `3`.
//! - `LLM_SANITIZER_FLAG_THRESHOLD` - Optional. Cumulative corrections that flag a task (>= 1).
//! - `LLM_SANITIZER_TOLERANCE` - Optional. Relative tolerance. Defaults to `0.005`.
//! - `LLM_PROVIDER`, `PROVIDER_PRIORITY` - Primary provider and fallback order.
//! - `GEMINI_API_KEY`, `GEMINI_MODEL`, `GEMINI_RATE_LIMIT_S`, `GEMINI_TIMEOUT_S` - Gemini.
//!   The key is required when `LLM_PROVIDER` is set to `gemini` explicitly.
//! - `OLLAMA_HOST`, `OLLAMA_MODEL` - Ollama.
//! - `LLM_MAX_TOKENS`, `LLM_TEMPERATURE`, `LLM_MAX_RETRIES`, `LLM_MIN_QUALITY` - Generation.
//! - `OFFLOAD_*`, `LOCAL_MODELS_DIR`, `LOCAL_SERVER_BIN`, `LOCAL_SERVER_PORT`, `KEEP_LOCAL_MODELS` - Offload.
//! - `MODEL_PRUNE_DAYS`, `MODEL_MIN_KEEP`, `MODEL_HOLDING_DIR` - Retention.
//! - `STALE_SECONDS`, `SWEEP_MAX_ATTEMPTS`, `SWEEP_DRAIN_MAX_TASKS`, `SWEEP_INTERVAL_S` - Sweeper.
//! - `TASKQ_DRY_RUN`, `SWEEP_NO_DRAIN`, `SWEEP_NO_RETRY` - Booleans.
//! - `ALERT_QUEUE_THRESHOLD`, `ALERT_SANITIZER_THRESHOLD`, `ALERT_WINDOW_S` - Alerts.
//! - `REVIEW_APPROVAL_POLICY`, `REVIEW_OPERATORS` - Operator review.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::alerts::AlertThresholds;
use crate::executor::WorkerConfig;
use crate::llm::{GeminiConfig, OllamaConfig, RetryConfig};
use crate::offload::{LlamaServerConfig, OffloadConfig, RetentionConfig};
use crate::review::ApprovalPolicy;
use crate::router::RouterConfig;
use crate::sanitizer::SanitizerConfig;
use crate::sweeper::SweeperConfig;
use crate::util::{parse_bool, split_list};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub dry_run: bool,
    pub worker: WorkerConfig,
    pub sanitizer: SanitizerConfig,
    pub router: RouterConfig,
    pub gemini: GeminiConfig,
    pub ollama: OllamaConfig,
    pub offload: OffloadConfig,
    pub llama_server: LlamaServerConfig,
    pub retention: RetentionConfig,
    pub sweeper: SweeperConfig,
    pub alerts: AlertThresholds,
    pub approval_policy: ApprovalPolicy,
    /// Actors allowed to run review actions.
    pub operators: Vec<String>,
}

/// Typed reads over a key lookup. Empty values count as unset.
struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|e| ConfigError::InvalidValue(key.to_string(), format!("{}", e))),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_secs)
    }

    fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(|v| parse_bool(&v))
    }

    fn list(&self, key: &str, default: &str) -> Vec<String> {
        split_list(&self.string(key, default))
    }
}

fn ensure(ok: bool, key: &str, message: &str) -> Result<(), ConfigError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue(key.to_string(), message.to_string()))
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let vars = Vars { lookup };

        let max_attempts: u32 = vars.parse("LLM_MAX_ATTEMPTS", 3)?;
        ensure(max_attempts >= 1, "LLM_MAX_ATTEMPTS", "must be at least 1")?;

        let worker = WorkerConfig {
            max_tasks: vars.parse("TASKQ_MAX_TASKS", 5)?,
            concurrency: vars.parse("TASKQ_CONCURRENCY", 2)?,
            max_attempts,
            poll_interval: vars.secs("TASKQ_POLL_INTERVAL_S", 10)?,
        };

        let sanitizer = SanitizerConfig {
            tolerance: vars.parse("LLM_SANITIZER_TOLERANCE", 0.005)?,
            flag_threshold: vars.parse("LLM_SANITIZER_FLAG_THRESHOLD", 1)?,
        };
        ensure(
            sanitizer.flag_threshold >= 1,
            "LLM_SANITIZER_FLAG_THRESHOLD",
            "must be at least 1",
        )?;
        ensure(
            sanitizer.tolerance >= 0.0,
            "LLM_SANITIZER_TOLERANCE",
            "must not be negative",
        )?;

        let mut router = RouterConfig {
            primary: vars.string("LLM_PROVIDER", "gemini"),
            priority: vars.list("PROVIDER_PRIORITY", "gemini,ollama"),
            primary_retry: RetryConfig::default().with_max_attempts(vars.parse("LLM_MAX_RETRIES", 3)?),
            min_quality: vars.parse("LLM_MIN_QUALITY", 0.5)?,
            ..RouterConfig::default()
        };
        router.generation.max_tokens = vars.parse("LLM_MAX_TOKENS", 2048)?;
        router.generation.temperature = vars.parse("LLM_TEMPERATURE", 0.7)?;
        ensure(
            (0.0..=1.0).contains(&router.min_quality),
            "LLM_MIN_QUALITY",
            "must be between 0 and 1",
        )?;

        let gemini_defaults = GeminiConfig::default();
        let gemini = GeminiConfig {
            api_key: vars.get("GEMINI_API_KEY"),
            model: vars.string("GEMINI_MODEL", &gemini_defaults.model),
            rate_limit: vars.secs("GEMINI_RATE_LIMIT_S", 60)?,
            timeout: vars.secs("GEMINI_TIMEOUT_S", 20)?,
            ..gemini_defaults
        };
        let gemini_chosen = vars
            .get("LLM_PROVIDER")
            .is_some_and(|p| p.trim().eq_ignore_ascii_case("gemini"));
        if gemini_chosen && gemini.api_key.is_none() {
            return Err(ConfigError::MissingEnvVar("GEMINI_API_KEY".to_string()));
        }

        let ollama_defaults = OllamaConfig::default();
        let ollama = OllamaConfig {
            host: vars.string("OLLAMA_HOST", &ollama_defaults.host),
            model: vars.string("OLLAMA_MODEL", &ollama_defaults.model),
            ..ollama_defaults
        };

        let keep_list = vars.list("KEEP_LOCAL_MODELS", "");
        let models_dir = PathBuf::from(vars.string("LOCAL_MODELS_DIR", "models"));
        let mut offload = OffloadConfig {
            models_dir: models_dir.clone(),
            keep_list: keep_list.clone(),
            max_tasks: vars.parse("OFFLOAD_MAX_TASKS", 5)?,
            max_attempts: vars.parse("OFFLOAD_MAX_ATTEMPTS", 3)?,
            short_prompt_chars: vars.parse("OFFLOAD_SHORT_PROMPT_CHARS", 2000)?,
            poll_interval: vars.secs("OFFLOAD_POLL_S", 30)?,
            ..OffloadConfig::default()
        };
        offload.generation.max_tokens = vars.parse("OFFLOAD_MAX_TOKENS", 1024)?;

        let llama_server = LlamaServerConfig {
            binary: vars.string("LOCAL_SERVER_BIN", "llama-server"),
            port: vars.parse("LOCAL_SERVER_PORT", 8089)?,
            ..LlamaServerConfig::default()
        };

        let mut retention = RetentionConfig::for_models_dir(&models_dir);
        retention.prune_days = vars.parse("MODEL_PRUNE_DAYS", 30)?;
        retention.min_keep = vars.parse("MODEL_MIN_KEEP", 1)?;
        retention.keep_list = keep_list;
        if let Some(dir) = vars.get("MODEL_HOLDING_DIR") {
            retention.holding_dir = PathBuf::from(dir);
        }

        let dry_run = vars.flag("TASKQ_DRY_RUN");
        let sweeper = SweeperConfig {
            stale_after: vars.secs("STALE_SECONDS", 3600)?,
            max_attempts: vars.parse("SWEEP_MAX_ATTEMPTS", 5)?,
            dry_run,
            skip_drain: vars.flag("SWEEP_NO_DRAIN"),
            skip_retry: vars.flag("SWEEP_NO_RETRY"),
            drain_max_tasks: vars.parse("SWEEP_DRAIN_MAX_TASKS", 100)?,
            interval: vars.secs("SWEEP_INTERVAL_S", 300)?,
        };

        let alerts = AlertThresholds {
            queue_length: vars.parse("ALERT_QUEUE_THRESHOLD", 10)?,
            sanitizer_corrections: vars.parse("ALERT_SANITIZER_THRESHOLD", 1)?,
            window: vars.secs("ALERT_WINDOW_S", 3600)?,
        };

        let approval_policy = match vars.get("REVIEW_APPROVAL_POLICY") {
            Some(raw) => ApprovalPolicy::parse(&raw).ok_or_else(|| {
                ConfigError::InvalidValue("REVIEW_APPROVAL_POLICY".to_string(), raw.clone())
            })?,
            None => ApprovalPolicy::default(),
        };

        Ok(Self {
            db_path: PathBuf::from(vars.string("TASKQ_DB_PATH", "data/llm_tasks.db")),
            dry_run,
            worker,
            sanitizer,
            router,
            gemini,
            ollama,
            offload,
            llama_server,
            retention,
            sweeper,
            alerts,
            approval_policy,
            operators: vars.list("REVIEW_OPERATORS", ""),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(move |key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let config = load(&[]).unwrap();
        assert_eq!(config.db_path, PathBuf::from("data/llm_tasks.db"));
        assert_eq!(config.worker.max_attempts, 3);
        assert_eq!(config.sanitizer.flag_threshold, 1);
        assert_eq!(config.router.primary, "gemini");
        assert_eq!(config.router.priority, vec!["gemini", "ollama"]);
        assert_eq!(config.offload.generation.max_tokens, 1024);
        assert_eq!(config.offload.short_prompt_chars, 2000);
        assert_eq!(config.retention.holding_dir, PathBuf::from("models/.retired"));
        assert_eq!(config.sweeper.stale_after, Duration::from_secs(3600));
        assert_eq!(config.sweeper.max_attempts, 5);
        assert!(!config.dry_run);
        assert_eq!(config.approval_policy, ApprovalPolicy::AllowWithCorrections);
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("TASKQ_DB_PATH", "/tmp/q.db"),
            ("LLM_PROVIDER", "ollama"),
            ("PROVIDER_PRIORITY", "ollama, gemini"),
            ("KEEP_LOCAL_MODELS", "mini,phi3"),
            ("TASKQ_DRY_RUN", "yes"),
            ("SWEEP_NO_DRAIN", "1"),
            ("GEMINI_API_KEY", "k"),
            ("REVIEW_APPROVAL_POLICY", "require_clean_audit"),
            ("REVIEW_OPERATORS", "alice,bob"),
        ])
        .unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/q.db"));
        assert_eq!(config.router.primary, "ollama");
        assert_eq!(config.router.priority, vec!["ollama", "gemini"]);
        assert_eq!(config.offload.keep_list, vec!["mini", "phi3"]);
        assert_eq!(config.retention.keep_list, vec!["mini", "phi3"]);
        assert!(config.dry_run && config.sweeper.dry_run);
        assert!(config.sweeper.skip_drain);
        assert!(!config.sweeper.skip_retry);
        assert_eq!(config.gemini.api_key.as_deref(), Some("k"));
        assert_eq!(config.approval_policy, ApprovalPolicy::RequireCleanAudit);
        assert_eq!(config.operators, vec!["alice", "bob"]);
    }

    #[test]
    fn explicit_gemini_primary_needs_a_key() {
        let err = load(&[("LLM_PROVIDER", "gemini")]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "GEMINI_API_KEY"));
        assert!(load(&[("LLM_PROVIDER", "gemini"), ("GEMINI_API_KEY", "k")]).is_ok());
    }

    #[test]
    fn zero_flag_threshold_is_rejected() {
        let err = load(&[("LLM_SANITIZER_FLAG_THRESHOLD", "0")]).unwrap_err();
        assert!(err.to_string().contains("LLM_SANITIZER_FLAG_THRESHOLD"));
    }

    #[test]
    fn unparsable_numbers_name_the_variable() {
        let err = load(&[("TASKQ_MAX_TASKS", "five")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref k, _) if k == "TASKQ_MAX_TASKS"));
    }
}
