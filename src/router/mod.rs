//! Ordered provider fallback with quality gating.
//!
//! The chain is the primary provider (or the task's provider hint) followed
//! by the fixed priority list, deduplicated. Each provider is loaded lazily,
//! called with its retry budget, and its output must pass both the length
//! floor and the quality bar before it is returned.

mod quality;

pub use quality::{QualityReport, QualityScorer, MIN_SCORABLE_CHARS};

#[cfg(test)]
pub(crate) use quality::sample_digest;

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::llm::{generate_with_retry, GenerationConfig, LlmProvider, RetryConfig, TokenUsage};

/// Stops generation from running on into echoed source documents.
pub const DEFAULT_STOP_SEQUENCES: [&str; 3] = ["## Document 1:", "## Document 2:", "## Document 3:"];

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub primary: String,
    /// Fallback order after the primary.
    pub priority: Vec<String>,
    pub generation: GenerationConfig,
    /// Budget for the primary; fallbacks always get a single attempt.
    pub primary_retry: RetryConfig,
    pub min_response_chars: usize,
    pub min_quality: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            primary: "gemini".to_string(),
            priority: vec!["gemini".to_string(), "ollama".to_string()],
            generation: GenerationConfig {
                stop_sequences: DEFAULT_STOP_SEQUENCES.iter().map(|s| s.to_string()).collect(),
                ..GenerationConfig::default()
            },
            primary_retry: RetryConfig::default(),
            min_response_chars: MIN_SCORABLE_CHARS,
            min_quality: 0.5,
        }
    }
}

/// An accepted generation.
#[derive(Debug, Clone, Serialize)]
pub struct RoutedResponse {
    pub text: String,
    pub provider: String,
    pub model: String,
    pub usage: Option<TokenUsage>,
    pub finish_reason: Option<String>,
    pub generation_time: Duration,
    pub quality: QualityReport,
}

/// Why one provider in the chain was passed over.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderFailure {
    pub provider: String,
    pub reason: String,
    /// Retrying later cannot help (auth, malformed request, unavailable).
    pub permanent: bool,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("No providers registered for chain {0:?}")]
    NoProviders(Vec<String>),

    #[error("All providers failed or produced low quality. Last error: {last_error}")]
    Exhausted {
        last_error: String,
        failures: Vec<ProviderFailure>,
    },
}

impl RouterError {
    /// True when every provider failed with a permanent error.
    pub fn is_permanent(&self) -> bool {
        match self {
            RouterError::NoProviders(_) => true,
            RouterError::Exhausted { failures, .. } => {
                !failures.is_empty() && failures.iter().all(|f| f.permanent)
            }
        }
    }
}

pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn LlmProvider>>,
    config: RouterConfig,
    scorer: QualityScorer,
    loaded: Mutex<HashSet<String>>,
}

impl ProviderRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            providers: HashMap::new(),
            config,
            scorer: QualityScorer::default(),
            loaded: Mutex::new(HashSet::new()),
        }
    }

    /// Register a provider under its own name. A later registration with
    /// the same name replaces the earlier one.
    pub fn with_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.providers.insert(provider.name().to_string(), provider);
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Names in call order for a task with `hint`, registered providers only.
    pub fn provider_order(&self, hint: Option<&str>) -> Vec<String> {
        let primary = hint
            .filter(|h| self.providers.contains_key(*h))
            .unwrap_or(&self.config.primary);

        let mut seen = HashSet::new();
        std::iter::once(primary)
            .chain(self.config.priority.iter().map(String::as_str))
            .filter(|name| self.providers.contains_key(*name))
            .filter(|name| seen.insert(name.to_string()))
            .map(str::to_string)
            .collect()
    }

    async fn ensure_loaded(&self, provider: &dyn LlmProvider) -> Result<(), crate::llm::LlmError> {
        let mut loaded = self.loaded.lock().await;
        if loaded.contains(provider.name()) {
            return Ok(());
        }
        provider.load().await?;
        loaded.insert(provider.name().to_string());
        tracing::info!(provider = provider.name(), "Provider loaded");
        Ok(())
    }

    /// Unload every provider loaded so far. The next call loads again.
    pub async fn unload_all(&self) {
        let names: Vec<String> = self.loaded.lock().await.drain().collect();
        for name in names {
            if let Some(provider) = self.providers.get(&name) {
                provider.unload().await;
                tracing::info!(provider = %name, "Provider unloaded");
            }
        }
    }

    /// Walk the chain until a response passes the quality bar.
    pub async fn generate(
        &self,
        prompt: &str,
        hint: Option<&str>,
    ) -> Result<RoutedResponse, RouterError> {
        let order = self.provider_order(hint);
        if order.is_empty() {
            let mut wanted = vec![hint.unwrap_or(&self.config.primary).to_string()];
            wanted.extend(self.config.priority.iter().cloned());
            return Err(RouterError::NoProviders(wanted));
        }

        let mut failures = Vec::new();
        for (index, name) in order.iter().enumerate() {
            let Some(provider) = self.providers.get(name) else {
                continue;
            };
            tracing::info!(provider = %name, position = index, "Attempting generation");

            if let Err(e) = self.ensure_loaded(provider.as_ref()).await {
                tracing::warn!(provider = %name, "Provider failed to load: {}", e);
                failures.push(ProviderFailure {
                    provider: name.clone(),
                    reason: e.to_string(),
                    permanent: !e.is_transient(),
                });
                continue;
            }

            let retry = if index == 0 {
                self.config.primary_retry.clone()
            } else {
                RetryConfig::single_attempt()
            };

            let response =
                match generate_with_retry(provider.as_ref(), prompt, &self.config.generation, &retry)
                    .await
                {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(provider = %name, "Provider failed: {}", e);
                        failures.push(ProviderFailure {
                            provider: name.clone(),
                            reason: e.to_string(),
                            permanent: !e.is_transient(),
                        });
                        continue;
                    }
                };

            let text = response.text.trim();
            if text.chars().count() < self.config.min_response_chars {
                tracing::warn!(provider = %name, chars = text.len(), "Provider returned empty/short response");
                failures.push(ProviderFailure {
                    provider: name.clone(),
                    reason: format!("Empty or short response from {}", name),
                    permanent: false,
                });
                continue;
            }

            let quality = self.scorer.score(text);
            tracing::info!(provider = %name, score = quality.score, "Quality score");
            if quality.score < self.config.min_quality {
                tracing::warn!(
                    provider = %name,
                    feedback = %quality.feedback.join(", "),
                    "Low quality response"
                );
                failures.push(ProviderFailure {
                    provider: name.clone(),
                    reason: format!("Low quality score ({}) from {}", quality.score, name),
                    permanent: false,
                });
                continue;
            }

            return Ok(RoutedResponse {
                text: text.to_string(),
                provider: name.clone(),
                model: response.model,
                usage: response.usage,
                finish_reason: response.finish_reason,
                generation_time: response.generation_time,
                quality,
            });
        }

        let last_error = failures
            .last()
            .map(|f| f.reason.clone())
            .unwrap_or_else(|| "no provider produced output".to_string());
        Err(RouterError::Exhausted {
            last_error,
            failures,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedProvider;
    use crate::llm::LlmError;
    use std::sync::atomic::Ordering;

    fn chain_config() -> RouterConfig {
        RouterConfig {
            primary: "primary".to_string(),
            priority: vec!["primary".to_string(), "fallback".to_string()],
            primary_retry: RetryConfig::default().with_max_attempts(2),
            ..RouterConfig::default()
        }
    }

    #[test]
    fn order_puts_primary_first_and_deduplicates() {
        let router = ProviderRouter::new(RouterConfig {
            primary: "b".to_string(),
            priority: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            ..RouterConfig::default()
        })
        .with_provider(Arc::new(ScriptedProvider::new("a", vec![])))
        .with_provider(Arc::new(ScriptedProvider::new("b", vec![])))
        .with_provider(Arc::new(ScriptedProvider::new("c", vec![])));

        assert_eq!(router.provider_order(None), vec!["b", "a", "c"]);
        assert_eq!(router.provider_order(Some("c")), vec!["c", "a", "b"]);
        // Unknown hints fall back to the configured primary.
        assert_eq!(router.provider_order(Some("zzz")), vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn unload_all_releases_loaded_providers_once() {
        let primary = Arc::new(ScriptedProvider::new(
            "primary",
            vec![Ok(sample_digest()), Ok(sample_digest())],
        ));
        let idle = Arc::new(ScriptedProvider::new("fallback", vec![]));
        let router = ProviderRouter::new(chain_config())
            .with_provider(primary.clone())
            .with_provider(idle.clone());

        router.generate("prompt", None).await.unwrap();
        router.unload_all().await;
        router.unload_all().await;
        assert_eq!(primary.unloads.load(Ordering::SeqCst), 1);
        assert_eq!(idle.unloads.load(Ordering::SeqCst), 0);

        router.generate("prompt", None).await.unwrap();
        assert_eq!(primary.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn short_primary_response_falls_back_to_quality_output() {
        let primary = Arc::new(ScriptedProvider::new("primary", vec![Ok("too short".to_string())]));
        let fallback = Arc::new(ScriptedProvider::new("fallback", vec![Ok(sample_digest())]));
        let router = ProviderRouter::new(chain_config())
            .with_provider(primary.clone())
            .with_provider(fallback.clone());

        let result = router.generate("prompt", None).await.unwrap();
        assert_eq!(result.provider, "fallback");
        assert!(result.quality.score >= 0.5);
        assert_eq!(result.model, "fallback-model");
        assert_eq!(primary.calls(), 1);
        assert_eq!(fallback.calls(), 1);
    }

    #[tokio::test]
    async fn low_quality_everywhere_is_an_error_not_a_result() {
        let meh = "Plain words with no structure at all, repeated to pass the floor. ".repeat(3);
        let router = ProviderRouter::new(chain_config())
            .with_provider(Arc::new(ScriptedProvider::new("primary", vec![Ok(meh.clone())])))
            .with_provider(Arc::new(ScriptedProvider::new("fallback", vec![Ok(meh)])));

        let err = router.generate("prompt", None).await.unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("All providers failed or produced low quality."));
        assert!(message.contains("Low quality score"));
        assert!(message.contains("fallback"));
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn fallbacks_get_a_single_attempt() {
        let quick = || LlmError::rate_limited("quota".to_string(), Some(Duration::from_millis(1)));
        let primary = Arc::new(ScriptedProvider::new("primary", vec![Err(quick()), Err(quick())]));
        let fallback = Arc::new(ScriptedProvider::new(
            "fallback",
            vec![Err(quick()), Ok(sample_digest())],
        ));
        let router = ProviderRouter::new(chain_config())
            .with_provider(primary.clone())
            .with_provider(fallback.clone());

        let err = router.generate("prompt", None).await.unwrap_err();
        assert_eq!(primary.calls(), 2);
        assert_eq!(fallback.calls(), 1);
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn permanent_failures_across_the_chain_are_permanent() {
        let router = ProviderRouter::new(chain_config())
            .with_provider(Arc::new(ScriptedProvider::new(
                "primary",
                vec![Err(LlmError::client_error(401, "bad key".to_string()))],
            )))
            .with_provider(Arc::new(ScriptedProvider::new(
                "fallback",
                vec![Err(LlmError::client_error(400, "bad request".to_string()))],
            )));

        let err = router.generate("prompt", None).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn providers_load_once() {
        let primary = Arc::new(ScriptedProvider::new(
            "primary",
            vec![Ok(sample_digest()), Ok(sample_digest())],
        ));
        let router = ProviderRouter::new(chain_config()).with_provider(primary.clone());

        router.generate("a", None).await.unwrap();
        router.generate("b", None).await.unwrap();
        assert_eq!(primary.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_chain_reports_no_providers() {
        let router = ProviderRouter::new(chain_config());
        let err = router.generate("p", None).await.unwrap_err();
        assert!(matches!(err, RouterError::NoProviders(_)));
        assert!(err.is_permanent());
    }
}
