//! LLM provider abstraction.
//!
//! A provider is anything that turns a prompt into text: a cloud API
//! ([`GeminiProvider`]), a local server ([`OllamaProvider`]), or a locally
//! hosted model managed by the offload scheduler.

mod error;
mod gemini;
mod ollama;
pub mod throttle;

pub use error::{
    classify_http_status, parse_retry_after, LlmError, LlmErrorKind, RetryConfig,
};
pub use gemini::{GeminiConfig, GeminiProvider};
pub use ollama::{OllamaConfig, OllamaProvider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Per-call generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
            stop_sequences: Vec::new(),
        }
    }
}

/// Token accounting reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Text produced by one provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
    pub model: String,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    pub generation_time: Duration,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable provider name used for routing (`gemini`, `ollama`, ...).
    fn name(&self) -> &str;

    /// Prepare the provider. Must be idempotent.
    async fn load(&self) -> Result<(), LlmError> {
        Ok(())
    }

    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<LlmResponse, LlmError>;

    /// Release resources. Must be idempotent.
    async fn unload(&self) {}
}

/// Call `provider` until it succeeds, the error is not retryable, or the
/// attempt/time budget in `retry` runs out.
pub async fn generate_with_retry(
    provider: &dyn LlmProvider,
    prompt: &str,
    config: &GenerationConfig,
    retry: &RetryConfig,
) -> Result<LlmResponse, LlmError> {
    let start = Instant::now();
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match provider.generate(prompt, config).await {
            Ok(response) => {
                if attempt > 0 {
                    tracing::info!(
                        provider = provider.name(),
                        retries = attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Generation succeeded after retries"
                    );
                }
                return Ok(response);
            }
            Err(error) => {
                let retryable = retry.should_retry(&error) && attempt + 1 < max_attempts;
                if !retryable {
                    tracing::warn!(
                        provider = provider.name(),
                        attempts = attempt + 1,
                        "Generation failed: {}",
                        error
                    );
                    return Err(error);
                }

                let remaining = retry.max_retry_duration.saturating_sub(start.elapsed());
                let delay = error.suggested_delay(attempt).min(remaining);
                if delay.is_zero() && remaining.is_zero() {
                    tracing::warn!(
                        provider = provider.name(),
                        "Retry budget exhausted: {}",
                        error
                    );
                    return Err(error);
                }

                tracing::warn!(
                    provider = provider.name(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "{} from provider, retrying: {}",
                    error.kind,
                    error.message
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted provider shared by the router and executor tests.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    pub struct ScriptedProvider {
        name: String,
        script: Mutex<VecDeque<Result<String, LlmError>>>,
        pub calls: AtomicU32,
        pub loads: AtomicU32,
        pub unloads: AtomicU32,
    }

    impl ScriptedProvider {
        pub fn new(name: &str, script: Vec<Result<String, LlmError>>) -> Self {
            Self {
                name: name.to_string(),
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                loads: AtomicU32::new(0),
                unloads: AtomicU32::new(0),
            }
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn load(&self) -> Result<(), LlmError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn generate(
            &self,
            _prompt: &str,
            _config: &GenerationConfig,
        ) -> Result<LlmResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(LlmError::unavailable("script exhausted".to_string())));
            next.map(|text| LlmResponse {
                text,
                model: format!("{}-model", self.name),
                usage: Some(TokenUsage::new(10, 20)),
                finish_reason: Some("stop".to_string()),
                generation_time: Duration::from_millis(5),
            })
        }

        async fn unload(&self) {
            self.unloads.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedProvider;
    use super::*;

    fn quick_rate_limit() -> LlmError {
        LlmError::rate_limited("quota".to_string(), Some(Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn retries_transient_errors_within_budget() {
        let provider = ScriptedProvider::new(
            "p",
            vec![Err(quick_rate_limit()), Err(quick_rate_limit()), Ok("ok".to_string())],
        );
        let resp = generate_with_retry(
            &provider,
            "prompt",
            &GenerationConfig::default(),
            &RetryConfig::default(),
        )
        .await
        .unwrap();
        assert_eq!(resp.text, "ok");
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn single_attempt_does_not_retry() {
        let provider = ScriptedProvider::new("p", vec![Err(quick_rate_limit()), Ok("ok".into())]);
        let err = generate_with_retry(
            &provider,
            "prompt",
            &GenerationConfig::default(),
            &RetryConfig::single_attempt(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::RateLimited);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let provider = ScriptedProvider::new(
            "p",
            vec![
                Err(LlmError::client_error(401, "bad key".to_string())),
                Ok("ok".into()),
            ],
        );
        let err = generate_with_retry(
            &provider,
            "prompt",
            &GenerationConfig::default(),
            &RetryConfig::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::ClientError);
        assert_eq!(provider.calls(), 1);
    }
}
