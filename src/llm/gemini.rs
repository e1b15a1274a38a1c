//! Google Gemini `generateContent` provider.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::{parse_retry_after, LlmError};
use super::throttle::ProviderThrottle;
use super::{GenerationConfig, LlmProvider, LlmResponse, TokenUsage};

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: Option<String>,
    pub model: String,
    /// Minimum spacing between calls, shared process-wide.
    pub rate_limit: Duration,
    pub timeout: Duration,
    pub base_url: String,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gemini-1.5-flash".to_string(),
            rate_limit: Duration::from_secs(60),
            timeout: Duration::from_secs(20),
            base_url: GEMINI_API_BASE.to_string(),
        }
    }
}

pub struct GeminiProvider {
    client: Client,
    config: GeminiConfig,
    throttle: Arc<ProviderThrottle>,
}

impl GeminiProvider {
    pub fn new(config: GeminiConfig) -> Result<Self, LlmError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LlmError::unavailable(format!("Failed to build HTTP client: {}", e)))?;
        let throttle = ProviderThrottle::shared("gemini", config.rate_limit);
        Ok(Self {
            client,
            config,
            throttle,
        })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: RequestGenerationConfig<'a>,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<RequestPart<'a>>,
}

#[derive(Serialize)]
struct RequestPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RequestGenerationConfig<'a> {
    max_output_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "no_stops")]
    stop_sequences: &'a [String],
}

fn no_stops(stops: &&[String]) -> bool {
    stops.is_empty()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u64,
    #[serde(default)]
    candidates_token_count: u64,
    #[serde(default)]
    total_token_count: Option<u64>,
}

/// Text, usage, finish reason and model version.
type ParsedResponse = (String, Option<TokenUsage>, Option<String>, String);

fn parse_response(body: &str, fallback_model: &str) -> Result<ParsedResponse, LlmError> {
    let parsed: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| LlmError::parse_error(format!("Failed to parse Gemini response: {}", e)))?;

    let candidate = parsed
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::parse_error("No candidates in Gemini response".to_string()))?;

    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    let usage = parsed.usage_metadata.map(|u| {
        let mut usage = TokenUsage::new(u.prompt_token_count, u.candidates_token_count);
        if let Some(total) = u.total_token_count {
            usage.total_tokens = total;
        }
        usage
    });

    let model = parsed
        .model_version
        .unwrap_or_else(|| fallback_model.to_string());
    Ok((text, usage, candidate.finish_reason, model))
}

#[async_trait]
impl LlmProvider for GeminiProvider {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn load(&self) -> Result<(), LlmError> {
        match self.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => Ok(()),
            _ => Err(LlmError::unavailable("GEMINI_API_KEY is not set".to_string())),
        }
    }

    async fn generate(
        &self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<LlmResponse, LlmError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| LlmError::unavailable("GEMINI_API_KEY is not set".to_string()))?;

        let request = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![RequestPart { text: prompt }],
            }],
            generation_config: RequestGenerationConfig {
                max_output_tokens: config.max_tokens,
                temperature: config.temperature,
                stop_sequences: &config.stop_sequences,
            },
        };

        self.throttle.acquire().await;
        let start = Instant::now();

        let response = self
            .client
            .post(self.endpoint())
            .header("x-goog-api-key", api_key)
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

        let (text, usage, finish_reason, model) = parse_response(&body, &self.config.model)?;
        tracing::debug!(
            model = %model,
            chars = text.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Gemini generation finished"
        );

        Ok(LlmResponse {
            text,
            model,
            usage,
            finish_reason,
            generation_time: start.elapsed(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_text_usage_and_finish_reason() {
        let body = r#"{
            "candidates": [{
                "content": {"parts": [{"text": "Hello "}, {"text": "world"}]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 8, "totalTokenCount": 20},
            "modelVersion": "gemini-1.5-flash-002"
        }"#;
        let (text, usage, finish, model) = parse_response(body, "fallback").unwrap();
        assert_eq!(text, "Hello world");
        assert_eq!(usage.unwrap().total_tokens, 20);
        assert_eq!(finish.as_deref(), Some("STOP"));
        assert_eq!(model, "gemini-1.5-flash-002");
    }

    #[test]
    fn missing_candidates_is_a_parse_error() {
        let err = parse_response(r#"{"candidates": []}"#, "m").unwrap_err();
        assert_eq!(err.kind, crate::llm::LlmErrorKind::ParseError);
    }

    #[test]
    fn request_serializes_camel_case() {
        let stops = vec!["## Document 1:".to_string()];
        let request = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![RequestPart { text: "hi" }],
            }],
            generation_config: RequestGenerationConfig {
                max_output_tokens: 64,
                temperature: 0.5,
                stop_sequences: &stops,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["generationConfig"]["maxOutputTokens"], 64);
        assert_eq!(json["generationConfig"]["stopSequences"][0], "## Document 1:");
    }

    #[tokio::test]
    async fn load_requires_api_key() {
        let provider = GeminiProvider::new(GeminiConfig::default()).unwrap();
        assert!(provider.load().await.is_err());
    }
}
