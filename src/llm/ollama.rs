//! Ollama `/api/generate` provider (non-streaming).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::error::{parse_retry_after, LlmError};
use super::{GenerationConfig, LlmProvider, LlmResponse, TokenUsage};

#[derive(Debug, Clone)]
pub struct OllamaConfig {
    pub host: String,
    pub model: String,
    pub timeout: Duration,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            host: "http://127.0.0.1:11434".to_string(),
            model: "llama3".to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct OllamaProvider {
    client: Client,
    config: OllamaConfig,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::unavailable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.host.trim_end_matches('/'), path)
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    options: Options<'a>,
}

#[derive(Serialize)]
struct Options<'a> {
    num_predict: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "no_stops")]
    stop: &'a [String],
}

fn no_stops(stops: &&[String]) -> bool {
    stops.is_empty()
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    response: String,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

impl GenerateResponse {
    fn usage(&self) -> Option<TokenUsage> {
        match (self.prompt_eval_count, self.eval_count) {
            (None, None) => None,
            (p, c) => Some(TokenUsage::new(p.unwrap_or(0), c.unwrap_or(0))),
        }
    }
}

#[async_trait]
impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    /// Checks that the server answers; models are pulled on first use.
    async fn load(&self) -> Result<(), LlmError> {
        let response = self
            .client
            .get(self.url("/api/tags"))
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(LlmError::unavailable(format!(
                "Ollama at {} answered {}",
                self.config.host,
                response.status()
            )))
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<LlmResponse, LlmError> {
        let request = GenerateRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            options: Options {
                num_predict: config.max_tokens,
                temperature: config.temperature,
                stop: &config.stop_sequences,
            },
        };

        let start = Instant::now();
        let response = self
            .client
            .post(self.url("/api/generate"))
            .json(&request)
            .send()
            .await
            .map_err(LlmError::from_reqwest)?;

        let status = response.status();
        let retry_after = parse_retry_after(response.headers().get("retry-after"));
        let body = response.text().await.map_err(LlmError::from_reqwest)?;
        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), body, retry_after));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::parse_error(format!("Failed to parse Ollama response: {}", e)))?;

        Ok(LlmResponse {
            usage: parsed.usage(),
            model: parsed
                .model
                .clone()
                .unwrap_or_else(|| self.config.model.clone()),
            finish_reason: parsed.done_reason,
            text: parsed.response,
            generation_time: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_comes_from_eval_counts() {
        let parsed: GenerateResponse = serde_json::from_str(
            r#"{"model":"llama3","response":"hi","done":true,"done_reason":"stop",
                "prompt_eval_count":7,"eval_count":3}"#,
        )
        .unwrap();
        let usage = parsed.usage().unwrap();
        assert_eq!(usage.prompt_tokens, 7);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.total_tokens, 10);
    }

    #[test]
    fn missing_counts_mean_no_usage() {
        let parsed: GenerateResponse = serde_json::from_str(r#"{"response":"hi"}"#).unwrap();
        assert!(parsed.usage().is_none());
    }
}
